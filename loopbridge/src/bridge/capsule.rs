//! Type-erased units of work that cross the ABI boundary.
//!
//! A capsule is boxed, turned into a raw `(invoke, user_data, release)` triple
//! by [`Capsule::into_raw`], and from then on owned by the foreign side. The
//! foreign side frees it through `release`, exactly once. A capsule that the
//! foreign side never releases (an event still queued when the loop exits) is
//! leaked on purpose: freeing it here as well could double-free.

use std::ffi::c_void;

use super::abi::{BindingFn, ForeignRuntime, InvokeFn, ReleaseFn};
use crate::channel::OneShot;
use crate::thread;

/// A unit of work with no arguments and no result.
pub struct Capsule {
    work: Box<dyn FnMut() + Send + 'static>,
}

impl Capsule {
    /// Wrap work that may be invoked repeatedly (timer ticks).
    pub fn new<F>(work: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            work: Box::new(work),
        }
    }

    /// Wrap work that runs at most once; later invocations do nothing.
    pub fn once<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut work = Some(work);
        Self::new(move || {
            if let Some(work) = work.take() {
                work();
            }
        })
    }

    /// Wrap work producing a value, delivered through the returned channel.
    pub fn with_result<R, F>(work: F) -> (Self, OneShot<R>)
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let result = OneShot::new();
        let sender = result.clone();
        (Self::once(move || sender.send(work())), result)
    }

    /// Hand the capsule over to the foreign side.
    pub fn into_raw(self) -> RawCapsule {
        RawCapsule {
            invoke: invoke_capsule,
            user_data: Box::into_raw(Box::new(self)).cast(),
            release: release_capsule,
        }
    }
}

/// A capsule in flight across the boundary.
#[derive(Debug)]
pub struct RawCapsule {
    pub invoke: InvokeFn,
    pub user_data: *mut c_void,
    pub release: ReleaseFn,
}

// Safety: `user_data` is only dereferenced through `invoke` (which requires the
// loop thread) and `release`; the capsule itself holds `Send` work.
unsafe impl Send for RawCapsule {}
unsafe impl Sync for RawCapsule {}

impl RawCapsule {
    /// # Safety
    ///
    /// The capsule must not have been released.
    pub unsafe fn invoke(&self) {
        unsafe { (self.invoke)(self.user_data) }
    }

    /// # Safety
    ///
    /// Must be called at most once per capsule, and never concurrently with `invoke`.
    pub unsafe fn release(self) {
        unsafe { (self.release)(self.user_data) }
    }
}

unsafe extern "C" fn invoke_capsule(user_data: *mut c_void) {
    thread::assert_loop_thread("capsule");
    tracing::trace!(?user_data, "invoking capsule");
    let capsule = unsafe { &mut *user_data.cast::<Capsule>() };
    (capsule.work)();
}

unsafe extern "C" fn release_capsule(user_data: *mut c_void) {
    tracing::trace!(?user_data, "releasing capsule");
    drop(unsafe { Box::from_raw(user_data.cast::<Capsule>()) });
}

/// Post a capsule as a foreign-loop event.
pub fn post(runtime: &dyn ForeignRuntime, capsule: Capsule) {
    let RawCapsule {
        invoke,
        user_data,
        release,
    } = capsule.into_raw();
    unsafe { runtime.post_event(invoke, user_data, release) };
}

// ─── Bindings ────────────────────────────────────────────────────────

/// A handler taking `&Arg` and producing `Ret`, invoked through argument and
/// result pointers supplied by the caller.
pub struct BindingCapsule<Arg, Ret> {
    handler: Box<dyn FnMut(&Arg) -> Ret + Send + 'static>,
}

impl<Arg: 'static, Ret: 'static> BindingCapsule<Arg, Ret> {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&Arg) -> Ret + Send + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    pub fn into_raw(self) -> RawBinding {
        RawBinding {
            binding: invoke_binding::<Arg, Ret>,
            user_data: Box::into_raw(Box::new(self)).cast(),
            release: release_binding::<Arg, Ret>,
        }
    }
}

/// A binding capsule in flight across the boundary.
#[derive(Debug)]
pub struct RawBinding {
    pub binding: BindingFn,
    pub user_data: *mut c_void,
    pub release: ReleaseFn,
}

// Safety: same as `RawCapsule`.
unsafe impl Send for RawBinding {}
unsafe impl Sync for RawBinding {}

impl RawBinding {
    /// # Safety
    ///
    /// Must be called at most once per binding.
    pub unsafe fn release(self) {
        unsafe { (self.release)(self.user_data) }
    }
}

unsafe extern "C" fn invoke_binding<Arg: 'static, Ret: 'static>(
    user_data: *mut c_void,
    arg: *const c_void,
    ret: *mut c_void,
) {
    thread::assert_loop_thread("callback handler");
    let capsule = unsafe { &mut *user_data.cast::<BindingCapsule<Arg, Ret>>() };
    let arg = unsafe { &*arg.cast::<Arg>() };
    let value = (capsule.handler)(arg);
    // `ret` points at an initialised `Ret`; assignment drops the old value.
    unsafe { *ret.cast::<Ret>() = value };
}

unsafe extern "C" fn release_binding<Arg: 'static, Ret: 'static>(user_data: *mut c_void) {
    drop(unsafe { Box::from_raw(user_data.cast::<BindingCapsule<Arg, Ret>>()) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_invoke_then_release_frees_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let counter = DropCounter(Arc::clone(&drops));
        let seen = Arc::clone(&hits);
        let raw = Capsule::new(move || {
            let _keep = &counter;
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .into_raw();

        let _guard = thread::enter();
        unsafe {
            raw.invoke();
            raw.invoke();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        unsafe { raw.release() };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_without_invoke() {
        let drops = Arc::new(AtomicUsize::new(0));
        let counter = DropCounter(Arc::clone(&drops));
        let raw = Capsule::once(move || drop(counter)).into_raw();
        // Releasing off the loop thread is allowed; only invoking is not.
        unsafe { raw.release() };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_once_runs_a_single_time() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let raw = Capsule::once(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .into_raw();

        let _guard = thread::enter();
        unsafe {
            raw.invoke();
            raw.invoke();
            raw.release();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_result_delivers_value() {
        let (capsule, result) = Capsule::with_result(|| 6 * 7);
        assert!(result.is_pending());

        let raw = capsule.into_raw();
        let _guard = thread::enter();
        unsafe {
            raw.invoke();
            raw.release();
        }
        assert_eq!(result.try_value(), Some(Ok(42)));
    }

    #[test]
    fn test_binding_writes_result_slot() {
        let raw = BindingCapsule::new(|name: &String| format!("hello {name}")).into_raw();
        let arg = String::from("loop");
        let mut ret = String::new();

        let _guard = thread::enter();
        unsafe {
            (raw.binding)(
                raw.user_data,
                (&arg as *const String).cast(),
                (&mut ret as *mut String).cast(),
            );
            raw.release();
        }
        assert_eq!(ret, "hello loop");
    }
}
