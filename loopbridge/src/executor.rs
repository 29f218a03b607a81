//! Executor that runs work on the foreign loop's thread.
//!
//! Every schedule request becomes a capsule posted as a foreign-loop event, so
//! tasks are resumed by the loop itself, in the order their events were posted.
//! Nothing runs until the loop does: await
//! [`EventLoop::ready`](crate::EventLoop::ready) before relying on progress.

use std::future::Future;
use std::sync::Arc;

use async_task::{Runnable, Task};

use crate::bridge::abi::ForeignRuntime;
use crate::bridge::capsule::{self, Capsule};
use crate::channel::OneShot;

/// Handle to the loop's execution context. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<dyn ForeignRuntime>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(runtime: Arc<dyn ForeignRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn ForeignRuntime> {
        &self.runtime
    }

    /// Post one unit of work. Fire and forget.
    pub fn enqueue<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        capsule::post(self.runtime.as_ref(), Capsule::once(work));
    }

    /// Run a closure on the loop thread and deliver its result through a channel.
    pub fn run<R, F>(&self, work: F) -> OneShot<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (capsule, result) = Capsule::with_result(work);
        capsule::post(self.runtime.as_ref(), capsule);
        result
    }

    /// Spawn a future whose every poll happens on the loop thread.
    ///
    /// Dropping the returned [`Task`] cancels the future; call
    /// [`Task::detach`] to let it run to completion on its own.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let runtime = Arc::clone(&self.runtime);
        let schedule = move |runnable: Runnable| {
            capsule::post(
                runtime.as_ref(),
                Capsule::once(move || {
                    runnable.run();
                }),
            );
        };
        let (runnable, task) = async_task::spawn(future, schedule);
        runnable.schedule();
        task
    }
}
