//! [`ForeignRuntime`] backed by the native toolkit's C library (`libslint_cpp`).
//!
//! Timer ids come straight from the library. Callbacks are opaque structs on
//! the native side; they live boxed in a handle table here and are addressed
//! by the ids this module hands out.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use super::abi::{BindingFn, ForeignRuntime, InvokeFn, ReleaseFn, TimerMode};

#[repr(C)]
struct CallbackOpaque {
    _0: *const c_void,
    _1: *const c_void,
}

/// Boxed so the library always sees the address it initialised.
struct CallbackSlot(Box<CallbackOpaque>);

// Safety: only touched on the loop thread; the table itself is shared.
unsafe impl Send for CallbackSlot {}
unsafe impl Sync for CallbackSlot {}

#[link(name = "slint_cpp")]
unsafe extern "C" {
    fn slint_post_event(event: InvokeFn, user_data: *mut c_void, drop_user_data: ReleaseFn);

    fn slint_timer_start(
        id: usize,
        mode: TimerMode,
        duration: u64,
        callback: InvokeFn,
        user_data: *mut c_void,
        drop_user_data: ReleaseFn,
    ) -> usize;
    fn slint_timer_singleshot(
        delay: u64,
        callback: InvokeFn,
        user_data: *mut c_void,
        drop_user_data: ReleaseFn,
    );
    fn slint_timer_destroy(id: usize);
    fn slint_timer_stop(id: usize);
    fn slint_timer_restart(id: usize);
    fn slint_timer_running(id: usize) -> bool;

    fn slint_callback_init(out: *mut CallbackOpaque);
    fn slint_callback_call(sig: *const CallbackOpaque, arg: *const c_void, ret: *mut c_void);
    fn slint_callback_set_handler(
        sig: *const CallbackOpaque,
        binding: BindingFn,
        user_data: *mut c_void,
        drop_user_data: ReleaseFn,
    );
    fn slint_callback_drop(handle: *mut CallbackOpaque);

    fn slint_run_event_loop(quit_on_last_window_closed: bool);
    fn slint_quit_event_loop();
    fn slint_platform_update_timers_and_animations();
    fn slint_platform_duration_until_next_timer_update() -> u64;
}

pub struct NativeRuntime {
    callbacks: DashMap<usize, CallbackSlot>,
    next_callback: AtomicUsize,
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self {
            callbacks: DashMap::new(),
            next_callback: AtomicUsize::new(1),
        }
    }

    fn callback_ptr(&self, id: usize) -> Option<*const CallbackOpaque> {
        // Copy the address out; the table guard must not be held across
        // foreign code that may create or drop callbacks.
        self.callbacks
            .get(&id)
            .map(|slot| &*slot.0 as *const CallbackOpaque)
    }
}

impl ForeignRuntime for NativeRuntime {
    unsafe fn post_event(&self, invoke: InvokeFn, user_data: *mut c_void, release: ReleaseFn) {
        unsafe { slint_post_event(invoke, user_data, release) }
    }

    unsafe fn timer_start(
        &self,
        id: usize,
        mode: TimerMode,
        duration_ms: u64,
        invoke: InvokeFn,
        user_data: *mut c_void,
        release: ReleaseFn,
    ) -> usize {
        unsafe { slint_timer_start(id, mode, duration_ms, invoke, user_data, release) }
    }

    unsafe fn timer_singleshot(
        &self,
        delay_ms: u64,
        invoke: InvokeFn,
        user_data: *mut c_void,
        release: ReleaseFn,
    ) {
        unsafe { slint_timer_singleshot(delay_ms, invoke, user_data, release) }
    }

    fn timer_stop(&self, id: usize) {
        unsafe { slint_timer_stop(id) }
    }

    fn timer_restart(&self, id: usize) {
        unsafe { slint_timer_restart(id) }
    }

    fn timer_destroy(&self, id: usize) {
        unsafe { slint_timer_destroy(id) }
    }

    fn timer_running(&self, id: usize) -> bool {
        unsafe { slint_timer_running(id) }
    }

    fn callback_new(&self) -> usize {
        let mut opaque = Box::new(CallbackOpaque {
            _0: ptr::null(),
            _1: ptr::null(),
        });
        unsafe { slint_callback_init(&mut *opaque) };
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(id, CallbackSlot(opaque));
        id
    }

    unsafe fn callback_set_handler(
        &self,
        id: usize,
        binding: BindingFn,
        user_data: *mut c_void,
        release: ReleaseFn,
    ) {
        match self.callback_ptr(id) {
            Some(sig) => unsafe { slint_callback_set_handler(sig, binding, user_data, release) },
            None => {
                tracing::warn!("handler set on unknown callback {id}");
                unsafe { release(user_data) };
            }
        }
    }

    unsafe fn callback_call(&self, id: usize, arg: *const c_void, ret: *mut c_void) {
        if let Some(sig) = self.callback_ptr(id) {
            unsafe { slint_callback_call(sig, arg, ret) }
        }
    }

    fn callback_drop(&self, id: usize) {
        if let Some((_, mut slot)) = self.callbacks.remove(&id) {
            unsafe { slint_callback_drop(&mut *slot.0) };
        }
    }

    fn run_event_loop(&self, quit_on_last_window_closed: bool) {
        unsafe { slint_run_event_loop(quit_on_last_window_closed) }
    }

    fn quit_event_loop(&self) {
        unsafe { slint_quit_event_loop() }
    }

    fn update_timers_and_animations(&self) {
        unsafe { slint_platform_update_timers_and_animations() }
    }

    fn duration_until_next_timer_update(&self) -> u64 {
        unsafe { slint_platform_duration_until_next_timer_update() }
    }
}
