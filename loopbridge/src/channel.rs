//! One-shot, many-waiter async channel.
//!
//! Carries a single value from a (usually synchronous, loop-thread) producer
//! to any number of async waiters. State moves at most once away from
//! pending, either to fulfilled or to cancelled. Registration of waiters and
//! resolution are serialised through one lock, so a waiter can never miss the
//! value between checking the state and registering.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::Cancelled;

enum State<T> {
    Pending,
    Fulfilled(T),
    Cancelled,
}

/// Runs once the source leaves pending, outside the source's lock.
type Forward<T> = Box<dyn FnOnce(&Inner<T>) + Send>;

struct Shared<T> {
    state: State<T>,
    waiters: HashMap<u64, Waker>,
    forwards: Vec<Forward<T>>,
}

struct Inner<T> {
    shared: Mutex<Shared<T>>,
    next_waiter: AtomicU64,
}

/// One value, many waiters. Clones share the same channel.
pub struct OneShot<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for OneShot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for OneShot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.shared.lock();
        let state = match shared.state {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Cancelled => "cancelled",
        };
        f.debug_struct("OneShot")
            .field("state", &state)
            .field("waiters", &shared.waiters.len())
            .finish()
    }
}

impl<T> OneShot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state: State::Pending,
                    waiters: HashMap::new(),
                    forwards: Vec::new(),
                }),
                next_waiter: AtomicU64::new(1),
            }),
        }
    }

    /// Fulfil the channel and wake every registered waiter.
    ///
    /// Does nothing on a cancelled channel.
    ///
    /// # Panics
    ///
    /// If the channel was already fulfilled. A channel carries one value.
    pub fn send(&self, value: T) {
        let (waiters, forwards) = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                State::Cancelled => {
                    tracing::trace!("send on cancelled channel ignored");
                    return;
                }
                State::Fulfilled(_) => panic!("OneShot should only receive one value"),
                State::Pending => {}
            }
            shared.state = State::Fulfilled(value);
            (
                std::mem::take(&mut shared.waiters),
                std::mem::take(&mut shared.forwards),
            )
        };
        self.resolve(waiters, forwards);
    }

    /// Cancel a pending channel, failing current and future waiters with [`Cancelled`].
    ///
    /// A fulfilled channel keeps its value.
    pub fn cancel(&self) {
        let (waiters, forwards) = {
            let mut shared = self.inner.shared.lock();
            if matches!(shared.state, State::Fulfilled(_)) {
                return;
            }
            shared.state = State::Cancelled;
            (
                std::mem::take(&mut shared.waiters),
                std::mem::take(&mut shared.forwards),
            )
        };
        self.resolve(waiters, forwards);
    }

    fn resolve(&self, waiters: HashMap<u64, Waker>, forwards: Vec<Forward<T>>) {
        for waker in waiters.into_values() {
            waker.wake();
        }
        for forward in forwards {
            forward(&self.inner);
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.shared.lock().state, State::Pending)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.shared.lock().state, State::Cancelled)
    }

    /// Number of suspended waiters.
    pub fn waiter_count(&self) -> usize {
        self.inner.shared.lock().waiters.len()
    }

    /// Wait for the value.
    ///
    /// Resolves immediately once the channel is fulfilled or cancelled.
    /// Dropping the future before it resolves removes its registration.
    pub fn value(&self) -> Recv<T> {
        Recv {
            inner: Arc::clone(&self.inner),
            id: None,
        }
    }
}

impl<T: Clone> OneShot<T> {
    /// The outcome, if the channel has left the pending state.
    pub fn try_value(&self) -> Option<Result<T, Cancelled>> {
        match &self.inner.shared.lock().state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Cancelled => Some(Err(Cancelled)),
        }
    }

    /// A channel that receives `f(value)` once this one is fulfilled, and is
    /// cancelled when this one is.
    ///
    /// `f` runs on whichever thread resolves this channel, or right away if it
    /// already is resolved. Cancelling the derived channel leaves this one alone.
    pub fn map<R, F>(&self, f: F) -> OneShot<R>
    where
        T: 'static,
        R: Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        let mapped = OneShot::new();
        let target = mapped.clone();
        let forward: Forward<T> = Box::new(move |source: &Inner<T>| {
            let outcome = match &source.shared.lock().state {
                State::Fulfilled(value) => Ok(value.clone()),
                State::Cancelled => Err(Cancelled),
                State::Pending => return,
            };
            match outcome {
                Ok(value) => target.send(f(value)),
                Err(Cancelled) => target.cancel(),
            }
        });

        {
            let mut shared = self.inner.shared.lock();
            if matches!(shared.state, State::Pending) {
                shared.forwards.push(forward);
                return mapped;
            }
        }
        forward(&self.inner);
        mapped
    }
}

/// Future returned by [`OneShot::value`].
#[must_use = "futures do nothing unless polled"]
pub struct Recv<T> {
    inner: Arc<Inner<T>>,
    id: Option<u64>,
}

impl<T: Clone> Future for Recv<T> {
    type Output = Result<T, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut guard = this.inner.shared.lock();
        let shared = &mut *guard;
        match &shared.state {
            State::Fulfilled(value) => {
                this.id = None;
                Poll::Ready(Ok(value.clone()))
            }
            State::Cancelled => {
                this.id = None;
                Poll::Ready(Err(Cancelled))
            }
            State::Pending => {
                let next_waiter = &this.inner.next_waiter;
                let id = *this
                    .id
                    .get_or_insert_with(|| next_waiter.fetch_add(1, Ordering::Relaxed));
                shared.waiters.insert(id, cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for Recv<T> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.inner.shared.lock().waiters.remove(&id);
        }
    }
}
