//! Timers firing once or periodically on the loop thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::bridge::abi::{ForeignRuntime, TimerMode, millis};
use crate::bridge::capsule::{self, Capsule, RawCapsule};
use crate::error::BridgeError;
use crate::executor::Executor;
use crate::thread;

/// Handle to one foreign timer.
///
/// Created anywhere; started, stopped and queried on the loop thread only.
/// Starting an already started timer re-arms the same foreign timer rather
/// than allocating a second one.
///
/// The body is owned by the foreign timer, which the handle destroys on
/// [`destroy`](Self::destroy) or drop. The body is released with it.
pub struct Timer {
    runtime: Arc<dyn ForeignRuntime>,
    /// Foreign timer id, 0 while not started.
    id: AtomicUsize,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("id", &self.id()).finish()
    }
}

impl Timer {
    pub fn new(executor: &Executor) -> Self {
        Self {
            runtime: Arc::clone(executor.runtime()),
            id: AtomicUsize::new(0),
        }
    }

    /// Foreign id, `None` until first started or after [`destroy`](Self::destroy).
    pub fn id(&self) -> Option<usize> {
        match self.id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Fire `body` once, `after` from now.
    pub fn run_once<F>(&self, after: Duration, body: F) -> Result<(), BridgeError>
    where
        F: FnMut() + Send + 'static,
    {
        self.start(TimerMode::SingleShot, after, body)
    }

    /// Fire `body` every `every` until stopped.
    pub fn run_repeating<F>(&self, every: Duration, body: F) -> Result<(), BridgeError>
    where
        F: FnMut() + Send + 'static,
    {
        self.start(TimerMode::Repeated, every, body)
    }

    /// Suspend firing, keeping the id so [`restart`](Self::restart) can resume it.
    pub fn stop(&self) {
        if let Some(id) = self.id() {
            thread::assert_loop_thread("Timer::stop");
            self.runtime.timer_stop(id);
            tracing::debug!("timer {id} stopped");
        }
    }

    /// Resume a stopped timer on its existing id.
    pub fn restart(&self) {
        if let Some(id) = self.id() {
            thread::assert_loop_thread("Timer::restart");
            self.runtime.timer_restart(id);
            tracing::debug!("timer {id} restarted");
        }
    }

    pub fn running(&self) -> bool {
        match self.id() {
            Some(id) => {
                thread::assert_loop_thread("Timer::running");
                self.runtime.timer_running(id)
            }
            None => false,
        }
    }

    /// Release the foreign timer and everything tied to it. The handle can be started again.
    pub fn destroy(&self) {
        let id = self.id.swap(0, Ordering::AcqRel);
        if id != 0 {
            thread::assert_loop_thread("Timer::destroy");
            self.runtime.timer_destroy(id);
            tracing::debug!("timer {id} destroyed");
        }
    }

    fn start<F>(&self, mode: TimerMode, duration: Duration, body: F) -> Result<(), BridgeError>
    where
        F: FnMut() + Send + 'static,
    {
        thread::assert_loop_thread("Timer::start");
        let RawCapsule {
            invoke,
            user_data,
            release,
        } = Capsule::new(body).into_raw();

        let previous = self.id.load(Ordering::Acquire);
        let duration_ms = millis(duration);
        let id = unsafe {
            self.runtime
                .timer_start(previous, mode, duration_ms, invoke, user_data, release)
        };
        if id == 0 {
            // Ownership of the capsule already passed to the foreign side; it is
            // left there rather than risk a second release.
            tracing::warn!("foreign runtime refused to start a timer");
            return Err(BridgeError::ResourceUnavailable("timer"));
        }
        self.id.store(id, Ordering::Release);
        tracing::debug!(id, ?mode, duration_ms, reused = previous == id, "timer started");
        Ok(())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let id = self.id.swap(0, Ordering::AcqRel);
        if id == 0 {
            return;
        }
        if thread::is_loop_thread() {
            self.runtime.timer_destroy(id);
        } else {
            let runtime = Arc::clone(&self.runtime);
            capsule::post(
                self.runtime.as_ref(),
                Capsule::once(move || runtime.timer_destroy(id)),
            );
        }
        tracing::debug!("timer {id} dropped");
    }
}
