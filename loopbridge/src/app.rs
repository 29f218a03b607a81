//! Application entry point.
//!
//! An application implements [`App::setup`]; [`run_app`] installs the event
//! loop, runs setup on the loop thread once the loop is live, keeps the idle
//! driver pumping until the loop exits, then tears everything down.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::bridge::abi::ForeignRuntime;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::event_loop::EventLoop;
use crate::executor::Executor;

pub trait App: Send + 'static {
    /// Runs on the loop thread, after the loop is ready. An error stops the loop.
    fn setup(self, cx: AppContext) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// What setup gets to work with.
#[derive(Debug, Clone)]
pub struct AppContext {
    event_loop: &'static EventLoop,
    host: Handle,
}

impl AppContext {
    pub fn event_loop(&self) -> &'static EventLoop {
        self.event_loop
    }

    pub fn executor(&self) -> &Executor {
        self.event_loop.executor()
    }

    /// The host tokio runtime, for work that should stay off the loop thread.
    pub fn host(&self) -> &Handle {
        &self.host
    }

    pub fn stop(&self) {
        self.event_loop.stop();
    }
}

/// Run `app` on `runtime`, blocking the calling thread until the loop exits.
///
/// The calling thread becomes the loop thread. Installs the process-wide
/// [`EventLoop`], so it can only be called once per process.
pub fn run_app<A: App>(
    app: A,
    runtime: Arc<dyn ForeignRuntime>,
    config: BridgeConfig,
) -> anyhow::Result<()> {
    config.validate()?;
    let host = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(config.host_worker_threads)
        .thread_name("loopbridge-host")
        .build()
        .map_err(BridgeError::HostRuntime)?;

    let event_loop = EventLoop::install(runtime, config)?;
    let idle = event_loop.spawn_idle_driver(host.handle());

    let cx = AppContext {
        event_loop,
        host: host.handle().clone(),
    };
    let failure: Arc<Mutex<Option<anyhow::Error>>> = Arc::default();
    let setup_failure = Arc::clone(&failure);
    let setup = host.spawn(async move {
        if event_loop.ready().await.is_err() {
            return;
        }
        tracing::info!("running app setup");
        event_loop
            .executor()
            .spawn(async move {
                if let Err(e) = app.setup(cx).await {
                    tracing::error!("app setup failed: {e:#}");
                    *setup_failure.lock() = Some(e);
                    event_loop.stop();
                }
            })
            .detach();
    });

    let started = {
        // Futures polled on the loop thread may use tokio timers and I/O.
        let _host = host.enter();
        event_loop.start()
    };
    setup.abort();
    started?;
    // The driver exits on its own once the loop has stopped.
    if let Err(e) = host.block_on(idle) {
        tracing::warn!("idle driver failed: {e}");
    }

    let failure = failure.lock().take();
    failure.map_or(Ok(()), Err)
}
