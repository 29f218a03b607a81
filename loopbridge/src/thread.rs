//! Loop-thread identity.
//!
//! The foreign runtime only accepts calls from the thread running its loop.
//! That thread is marked for as long as a [`LoopThreadGuard`] lives on it;
//! [`EventLoop::start`](crate::EventLoop::start) and the headless runtime's
//! dispatch paths hold one. Once the installed loop has started, its thread
//! is bound for the rest of the process and marks on other threads no
//! longer count.

use std::cell::Cell;
use std::marker::PhantomData;
use std::thread::ThreadId;

use once_cell::sync::OnceCell;

static BOUND: OnceCell<ThreadId> = OnceCell::new();

thread_local! {
    static ON_LOOP_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as the loop thread until dropped. Guards nest.
#[must_use = "the thread is only marked while the guard is alive"]
pub struct LoopThreadGuard {
    previous: bool,
    // Tied to the thread it marked.
    _not_send: PhantomData<*const ()>,
}

impl Drop for LoopThreadGuard {
    fn drop(&mut self) {
        ON_LOOP_THREAD.with(|flag| flag.set(self.previous));
    }
}

/// Mark the current thread as the loop thread.
///
/// Only code that drives the foreign loop itself should call this: runtime
/// implementations while dispatching, and tests stepping a headless runtime by hand.
pub fn enter() -> LoopThreadGuard {
    let previous = ON_LOOP_THREAD.with(|flag| flag.replace(true));
    LoopThreadGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// True while the current thread is driving the foreign loop.
pub fn is_loop_thread() -> bool {
    marked_loop_thread(BOUND.get().copied())
}

fn marked_loop_thread(bound: Option<ThreadId>) -> bool {
    ON_LOOP_THREAD.with(Cell::get)
        && bound.is_none_or(|id| id == std::thread::current().id())
}

/// Tie the loop to `id` for the rest of the process. The first binding wins.
pub(crate) fn bind(id: ThreadId) {
    if BOUND.set(id).is_err() && BOUND.get() != Some(&id) {
        tracing::warn!("loop thread already bound to another thread");
    }
}

#[track_caller]
pub(crate) fn assert_loop_thread(what: &str) {
    assert!(is_loop_thread(), "{what} called off the event loop thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_marks_and_restores() {
        assert!(!is_loop_thread());
        {
            let _outer = enter();
            assert!(is_loop_thread());
            {
                let _inner = enter();
                assert!(is_loop_thread());
            }
            assert!(is_loop_thread());
        }
        assert!(!is_loop_thread());
    }

    #[test]
    fn test_mark_is_per_thread() {
        let _guard = enter();
        let elsewhere = std::thread::spawn(is_loop_thread).join().unwrap();
        assert!(!elsewhere);
    }

    #[test]
    fn test_mark_on_unbound_thread_does_not_count() {
        let _guard = enter();
        let elsewhere = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();
        assert!(marked_loop_thread(None));
        assert!(marked_loop_thread(Some(std::thread::current().id())));
        assert!(!marked_loop_thread(Some(elsewhere)));
    }

    #[test]
    #[should_panic(expected = "off the event loop thread")]
    fn test_assert_off_thread_panics() {
        assert_loop_thread("Timer::stop");
    }
}
