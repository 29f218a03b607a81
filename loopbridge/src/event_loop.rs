//! Event loop lifecycle: start, readiness, stop, and the idle driver.

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::bridge::abi::ForeignRuntime;
use crate::bridge::capsule::{Capsule, RawCapsule};
use crate::channel::{OneShot, Recv};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::executor::Executor;
use crate::thread;

/// The process-wide loop, once [`EventLoop::install`]ed.
static INSTALLED: OnceCell<EventLoop> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    /// `start` called, loop not yet processing events.
    Starting,
    Running,
    Stopped,
}

/// Owns the foreign loop's lifecycle and the executor posting onto it.
pub struct EventLoop {
    runtime: Arc<dyn ForeignRuntime>,
    executor: Executor,
    config: BridgeConfig,
    state: Arc<Mutex<LoopState>>,
    ready: OneShot<()>,
    stopped: OneShot<()>,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("state", &self.state())
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    pub fn new(runtime: Arc<dyn ForeignRuntime>, config: BridgeConfig) -> Self {
        Self {
            executor: Executor::new(Arc::clone(&runtime)),
            runtime,
            config,
            state: Arc::new(Mutex::new(LoopState::Idle)),
            ready: OneShot::new(),
            stopped: OneShot::new(),
            loop_thread: Mutex::new(None),
        }
    }

    /// Make this process's one event loop. Fails if one is already installed.
    pub fn install(
        runtime: Arc<dyn ForeignRuntime>,
        config: BridgeConfig,
    ) -> Result<&'static EventLoop, BridgeError> {
        config.validate()?;
        INSTALLED
            .set(Self::new(runtime, config))
            .map_err(|_| BridgeError::AlreadyInstalled)?;
        Self::shared()
    }

    pub fn shared() -> Result<&'static EventLoop, BridgeError> {
        INSTALLED.get().ok_or(BridgeError::NotInstalled)
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    /// Thread that called [`start`](Self::start), once it has.
    pub fn loop_thread(&self) -> Option<ThreadId> {
        *self.loop_thread.lock()
    }

    /// Resolves once the loop processes events, or with `Cancelled` if it
    /// exited without ever doing so.
    pub fn ready(&self) -> Recv<()> {
        self.ready.value()
    }

    /// Resolves once [`start`](Self::start) returned.
    pub fn stopped(&self) -> Recv<()> {
        self.stopped.value()
    }

    /// The readiness channel itself, for callers that poll instead of awaiting.
    pub fn readiness(&self) -> OneShot<()> {
        self.ready.clone()
    }

    /// Run the foreign loop on the calling thread until [`stop`](Self::stop).
    ///
    /// The calling thread becomes the loop thread for the duration.
    pub fn start(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock();
            if *state != LoopState::Idle {
                return Err(BridgeError::AlreadyStarted);
            }
            *state = LoopState::Starting;
        }

        // A zero-delay timer is the first thing the running loop processes;
        // posted events are not accepted before the loop exists.
        let state = Arc::clone(&self.state);
        let ready = self.ready.clone();
        let RawCapsule {
            invoke,
            user_data,
            release,
        } = Capsule::once(move || {
            *state.lock() = LoopState::Running;
            tracing::debug!("event loop ready");
            ready.send(());
        })
        .into_raw();
        unsafe { self.runtime.timer_singleshot(0, invoke, user_data, release) };

        let loop_thread = std::thread::current().id();
        *self.loop_thread.lock() = Some(loop_thread);
        if INSTALLED.get().is_some_and(|installed| std::ptr::eq(installed, self)) {
            thread::bind(loop_thread);
        }
        let _guard = thread::enter();
        tracing::info!(
            quit_on_last_window_closed = self.config.quit_on_last_window_closed,
            "event loop starting"
        );
        self.runtime
            .run_event_loop(self.config.quit_on_last_window_closed);

        *self.state.lock() = LoopState::Stopped;
        // No-op if readiness was already signalled.
        self.ready.cancel();
        self.stopped.send(());
        tracing::info!("event loop stopped");
        Ok(())
    }

    /// Ask the loop to exit. Callable from any thread.
    pub fn stop(&self) {
        if thread::is_loop_thread() {
            self.runtime.quit_event_loop();
        } else {
            let runtime = Arc::clone(&self.runtime);
            self.executor.enqueue(move || runtime.quit_event_loop());
        }
    }

    /// Spawn the idle driver on `host`. It waits for readiness, then pumps the
    /// loop until [`start`](Self::start) returns.
    pub fn spawn_idle_driver(&self, host: &Handle) -> JoinHandle<()> {
        let driver = IdleDriver::new(self.executor.clone(), self.config.idle_ceiling());
        let ready = self.ready();
        let stopped = self.stopped();
        host.spawn(async move {
            if ready.await.is_err() {
                tracing::debug!("event loop exited before it was ready, idle driver not started");
                return;
            }
            tokio::select! {
                () = driver.run() => {}
                _ = stopped => tracing::debug!("event loop stopped, idle driver exiting"),
            }
        })
    }
}

/// Periodically asks the foreign runtime how long until its next update,
/// sleeps for that long (capped), then has it update timers and animations.
#[derive(Debug)]
pub struct IdleDriver {
    executor: Executor,
    ceiling: Duration,
}

impl IdleDriver {
    pub fn new(executor: Executor, ceiling: Duration) -> Self {
        Self { executor, ceiling }
    }

    /// Sleep before the next pump, given the runtime's reported milliseconds.
    pub fn sleep_for(&self, reported_ms: u64) -> Duration {
        Duration::from_millis(reported_ms).min(self.ceiling)
    }

    /// Pump forever. Stopped by cancelling the future.
    pub async fn run(self) {
        loop {
            let runtime = Arc::clone(self.executor.runtime());
            let reported = match self
                .executor
                .run(move || runtime.duration_until_next_timer_update())
                .value()
                .await
            {
                Ok(ms) => ms,
                Err(_) => break,
            };

            let sleep = self.sleep_for(reported);
            tracing::trace!(reported, ?sleep, "idle driver sleeping");
            tokio::time::sleep(sleep).await;

            let runtime = Arc::clone(self.executor.runtime());
            self.executor
                .enqueue(move || runtime.update_timers_and_animations());
        }
    }
}
