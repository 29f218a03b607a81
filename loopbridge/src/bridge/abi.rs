//! C ABI contract of the foreign event loop.
//!
//! Every unit of work crossing the boundary travels as an
//! `(invoke, user_data, release)` triple. The foreign side may call `invoke`
//! as often as the API allows (once for a posted event, once per tick for a
//! timer) and must call `release` exactly once when it no longer needs
//! `user_data`. Ids handed out by the foreign side are never zero; zero means
//! "allocate a new one" on the way in and "refused" on the way out.

use std::ffi::c_void;

/// Runs the unit of work behind `user_data`.
pub type InvokeFn = unsafe extern "C" fn(user_data: *mut c_void);

/// Frees `user_data`. Called exactly once per transferred context.
pub type ReleaseFn = unsafe extern "C" fn(user_data: *mut c_void);

/// Callback handler: reads an argument through `arg`, writes the result through `ret`.
pub type BindingFn =
    unsafe extern "C" fn(user_data: *mut c_void, arg: *const c_void, ret: *mut c_void);

/// Returned by `duration_until_next_timer_update` when nothing is scheduled.
pub const NO_PENDING_UPDATE: u64 = u64::MAX;

/// Timer firing mode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once, then stay stopped until restarted.
    SingleShot = 0,
    /// Fire every interval until stopped.
    Repeated = 1,
}

/// The foreign runtime as seen from this side of the boundary.
///
/// Implementations are the native toolkit (`bridge::native`) and the in-process
/// [`HeadlessRuntime`](crate::headless::HeadlessRuntime). Unless stated
/// otherwise, methods must be called on the loop thread.
pub trait ForeignRuntime: Send + Sync + 'static {
    // ─── Events ──────────────────────────────────────────────────────

    /// Queue `invoke(user_data)` to run on the loop thread, then release it.
    ///
    /// May be called from any thread. Events posted before the loop runs stay
    /// queued; events still queued when the loop exits are never released.
    ///
    /// # Safety
    ///
    /// `user_data` must stay valid for `invoke` and `release` until the runtime
    /// calls `release`, and must not be released by anyone else.
    unsafe fn post_event(&self, invoke: InvokeFn, user_data: *mut c_void, release: ReleaseFn);

    // ─── Timers ──────────────────────────────────────────────────────

    /// Start (or re-arm) a timer and return its id.
    ///
    /// `id == 0` allocates a new timer. A live id keeps its identity; its old
    /// callback context is released and replaced. Returns 0 on failure.
    ///
    /// # Safety
    ///
    /// Same ownership rules as [`post_event`](Self::post_event).
    unsafe fn timer_start(
        &self,
        id: usize,
        mode: TimerMode,
        duration_ms: u64,
        invoke: InvokeFn,
        user_data: *mut c_void,
        release: ReleaseFn,
    ) -> usize;

    /// Fire `invoke(user_data)` once after `delay_ms`, then release it.
    ///
    /// Unlike [`post_event`](Self::post_event) this may be called before the
    /// loop runs; the timer fires once the loop starts processing.
    ///
    /// # Safety
    ///
    /// Same ownership rules as [`post_event`](Self::post_event).
    unsafe fn timer_singleshot(
        &self,
        delay_ms: u64,
        invoke: InvokeFn,
        user_data: *mut c_void,
        release: ReleaseFn,
    );

    fn timer_stop(&self, id: usize);
    fn timer_restart(&self, id: usize);
    fn timer_destroy(&self, id: usize);
    fn timer_running(&self, id: usize) -> bool;

    // ─── Callbacks ───────────────────────────────────────────────────

    /// Allocate an empty callback slot. Returns 0 on failure.
    fn callback_new(&self) -> usize;

    /// Install a handler on a callback slot, releasing the previous one.
    ///
    /// # Safety
    ///
    /// Same ownership rules as [`post_event`](Self::post_event). `binding` must
    /// agree with the argument and result types used by callers of
    /// [`callback_call`](Self::callback_call).
    unsafe fn callback_set_handler(
        &self,
        id: usize,
        binding: BindingFn,
        user_data: *mut c_void,
        release: ReleaseFn,
    );

    /// Invoke the handler of a callback slot. Without a handler `ret` is untouched.
    ///
    /// # Safety
    ///
    /// `arg` must point to a live argument and `ret` to an initialised result
    /// of the types the installed handler expects.
    unsafe fn callback_call(&self, id: usize, arg: *const c_void, ret: *mut c_void);

    fn callback_drop(&self, id: usize);

    // ─── Loop ────────────────────────────────────────────────────────

    /// Run the loop on the calling thread until [`quit_event_loop`](Self::quit_event_loop).
    fn run_event_loop(&self, quit_on_last_window_closed: bool);

    fn quit_event_loop(&self);

    /// Fire due timers and advance animations.
    fn update_timers_and_animations(&self);

    /// Milliseconds until the next timer is due, or [`NO_PENDING_UPDATE`].
    fn duration_until_next_timer_update(&self) -> u64;
}

/// Convert a duration to whole milliseconds, saturating.
pub(crate) fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
