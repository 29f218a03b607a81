//! Async Rust on a foreign, single-threaded GUI event loop.
//!
//! The foreign runtime (native toolkit or [`HeadlessRuntime`]) owns the loop
//! thread and speaks a C ABI of `(invoke, user_data, release)` callbacks.
//! Everything that touches it is posted there as a [`Capsule`](bridge::capsule::Capsule):
//! executor tasks, timer bodies, callback handlers. The host tokio runtime
//! drives everything else, including the idle driver that pumps the loop's
//! timers.

pub mod app;
pub mod bridge;
pub mod callback;
pub mod channel;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod headless;
pub mod thread;
pub mod timer;

use std::future::Future;

pub use app::{App, AppContext, run_app};
pub use async_task::Task;
pub use bridge::abi::{ForeignRuntime, TimerMode};
#[cfg(feature = "native")]
pub use bridge::native::NativeRuntime;
pub use callback::Callback;
pub use channel::{OneShot, Recv};
pub use config::BridgeConfig;
pub use error::{BridgeError, Cancelled};
pub use event_loop::{EventLoop, IdleDriver, LoopState};
pub use executor::Executor;
pub use headless::HeadlessRuntime;
pub use timer::Timer;

/// Spawn a future on the installed event loop's thread.
pub fn spawn<F>(future: F) -> Result<Task<F::Output>, BridgeError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Ok(EventLoop::shared()?.executor().spawn(future))
}
