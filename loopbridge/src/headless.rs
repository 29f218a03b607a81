//! In-process foreign runtime.
//!
//! Implements the whole [`ForeignRuntime`] contract in Rust: a FIFO event
//! queue, timer and callback handle tables keyed by ids starting at 1, and a
//! blocking loop. Used by the demo binary and as the deterministic fake
//! runtime in tests (manual clock, call journal).

use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::bridge::abi::{
    BindingFn, ForeignRuntime, InvokeFn, NO_PENDING_UPDATE, ReleaseFn, TimerMode, millis,
};
use crate::bridge::capsule::{RawBinding, RawCapsule};
use crate::thread;

/// Longest the loop blocks on an empty queue before re-checking timers.
const MAX_WAIT: Duration = Duration::from_millis(50);

/// ABI calls, in the order the runtime received them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PostEvent,
    TimerStart {
        id: usize,
        mode: TimerMode,
        duration_ms: u64,
    },
    TimerSingleShot {
        delay_ms: u64,
    },
    TimerStop(usize),
    TimerRestart(usize),
    TimerDestroy(usize),
    CallbackNew(usize),
    CallbackSetHandler(usize),
    CallbackCall(usize),
    CallbackDrop(usize),
    RunEventLoop,
    QuitEventLoop,
    UpdateTimersAndAnimations,
    DurationUntilNextTimerUpdate,
}

enum Clock {
    System(Instant),
    Manual(AtomicU64),
}

impl Clock {
    fn now_ms(&self) -> u64 {
        match self {
            Clock::System(start) => millis(start.elapsed()),
            Clock::Manual(now) => now.load(Ordering::Acquire),
        }
    }
}

struct TimerSlot {
    mode: TimerMode,
    interval_ms: u64,
    /// `None` while stopped.
    deadline: Option<u64>,
    callback: RawCapsule,
    /// Slots created by `timer_singleshot` go away after firing.
    self_destroy: bool,
}

/// A release owed to a transferred context.
struct Release {
    release: ReleaseFn,
    user_data: *mut c_void,
}

// Safety: only ever run once, by the runtime that owns the context.
unsafe impl Send for Release {}

impl Release {
    unsafe fn run(self) {
        unsafe { (self.release)(self.user_data) }
    }
}

impl From<RawCapsule> for Release {
    fn from(raw: RawCapsule) -> Self {
        Self {
            release: raw.release,
            user_data: raw.user_data,
        }
    }
}

impl From<RawBinding> for Release {
    fn from(raw: RawBinding) -> Self {
        Self {
            release: raw.release,
            user_data: raw.user_data,
        }
    }
}

pub struct HeadlessRuntime {
    clock: Clock,
    events: Mutex<VecDeque<RawCapsule>>,
    wakeup: Condvar,
    timers: DashMap<usize, TimerSlot>,
    callbacks: DashMap<usize, Option<RawBinding>>,
    next_id: AtomicUsize,
    quit: AtomicBool,
    running: AtomicBool,
    /// Nesting depth of capsule invocations; releases wait until it drops to 0.
    depth: AtomicUsize,
    deferred: Mutex<Vec<Release>>,
    journal: Option<Mutex<Vec<Call>>>,
}

impl Default for HeadlessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessRuntime {
    /// Runtime on the system clock, without a journal.
    pub fn new() -> Self {
        Self {
            clock: Clock::System(Instant::now()),
            events: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            timers: DashMap::new(),
            callbacks: DashMap::new(),
            next_id: AtomicUsize::new(1),
            quit: AtomicBool::new(false),
            running: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            deferred: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    /// Time only moves through [`advance`](Self::advance). Starts at 0.
    pub fn with_manual_clock(mut self) -> Self {
        self.clock = Clock::Manual(AtomicU64::new(0));
        self
    }

    /// Record every ABI call; read back with [`journal`](Self::journal).
    pub fn with_journal(mut self) -> Self {
        self.journal = Some(Mutex::new(Vec::new()));
        self
    }

    pub fn journal(&self) -> Vec<Call> {
        self.journal
            .as_ref()
            .map(|journal| journal.lock().clone())
            .unwrap_or_default()
    }

    pub fn now(&self) -> Duration {
        Duration::from_millis(self.clock.now_ms())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Posted events not yet dispatched.
    pub fn pending_events(&self) -> usize {
        self.events.lock().len()
    }

    /// Live timers, armed or stopped.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Run one loop iteration on the calling thread: queued events, then due timers.
    pub fn pump(&self) {
        let _guard = thread::enter();
        self.dispatch_events();
        self.fire_due_timers();
    }

    /// Move a manual clock forward, firing every deadline on the way in order.
    ///
    /// Drives the runtime from the calling thread; not for use while
    /// [`run_event_loop`](ForeignRuntime::run_event_loop) runs elsewhere.
    pub fn advance(&self, by: Duration) {
        let Clock::Manual(now) = &self.clock else {
            tracing::warn!("advance() needs a manual clock");
            return;
        };
        let _guard = thread::enter();
        let target = now.load(Ordering::Acquire).saturating_add(millis(by));
        loop {
            self.dispatch_events();
            match self.next_deadline() {
                Some(deadline) if deadline <= target => {
                    now.fetch_max(deadline, Ordering::AcqRel);
                    self.fire_due_timers();
                }
                _ => break,
            }
        }
        now.store(target, Ordering::Release);
        self.dispatch_events();
        self.fire_due_timers();
    }

    fn record(&self, call: Call) {
        if let Some(journal) = &self.journal {
            journal.lock().push(call);
        }
    }

    fn allocate_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run foreign-side code, holding back releases until the outermost call returns.
    fn dispatching<R>(&self, f: impl FnOnce() -> R) -> R {
        self.depth.fetch_add(1, Ordering::AcqRel);
        let result = f();
        if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            let owed = std::mem::take(&mut *self.deferred.lock());
            for release in owed {
                unsafe { release.run() };
            }
        }
        result
    }

    fn retire(&self, release: Release) {
        if self.depth.load(Ordering::Acquire) > 0 {
            self.deferred.lock().push(release);
        } else {
            unsafe { release.run() };
        }
    }

    fn dispatch_events(&self) -> usize {
        // Events posted while dispatching wait for the next pass.
        let budget = self.events.lock().len();
        let mut dispatched = 0;
        while dispatched < budget {
            let Some(event) = self.events.lock().pop_front() else {
                break;
            };
            self.dispatching(|| unsafe { event.invoke() });
            self.retire(event.into());
            dispatched += 1;
        }
        if dispatched > 0 {
            tracing::trace!(dispatched, "dispatched posted events");
        }
        dispatched
    }

    fn next_deadline(&self) -> Option<u64> {
        self.timers.iter().filter_map(|slot| slot.deadline).min()
    }

    fn fire_due_timers(&self) {
        let now = self.clock.now_ms();
        let mut due: Vec<(u64, usize)> = self
            .timers
            .iter()
            .filter_map(|slot| {
                slot.deadline
                    .filter(|deadline| *deadline <= now)
                    .map(|deadline| (deadline, *slot.key()))
            })
            .collect();
        due.sort_unstable();

        for (_, id) in due {
            let fire = self.timers.get_mut(&id).and_then(|mut slot| {
                let deadline = slot.deadline?;
                if deadline > now {
                    return None;
                }
                let next = match slot.mode {
                    TimerMode::SingleShot => None,
                    TimerMode::Repeated => Some(now.saturating_add(slot.interval_ms.max(1))),
                };
                slot.deadline = next;
                Some((slot.callback.invoke, slot.callback.user_data, slot.self_destroy))
            });
            if let Some((invoke, user_data, self_destroy)) = fire {
                self.dispatching(|| unsafe { invoke(user_data) });
                if self_destroy {
                    self.remove_timer(id);
                }
            }
        }
    }

    fn remove_timer(&self, id: usize) {
        if let Some((_, slot)) = self.timers.remove(&id) {
            self.retire(slot.callback.into());
        }
    }

    fn insert_timer(&self, slot: TimerSlot) -> usize {
        let id = self.allocate_id();
        self.timers.insert(id, slot);
        id
    }
}

impl ForeignRuntime for HeadlessRuntime {
    unsafe fn post_event(&self, invoke: InvokeFn, user_data: *mut c_void, release: ReleaseFn) {
        self.record(Call::PostEvent);
        let mut events = self.events.lock();
        events.push_back(RawCapsule {
            invoke,
            user_data,
            release,
        });
        self.wakeup.notify_one();
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
        self.record(Call::TimerStart {
            id,
            mode,
            duration_ms,
        });
        let callback = RawCapsule {
            invoke,
            user_data,
            release,
        };
        let deadline = Some(self.clock.now_ms().saturating_add(duration_ms));

        if id != 0 {
            if let Some(mut slot) = self.timers.get_mut(&id) {
                let previous = std::mem::replace(&mut slot.callback, callback);
                slot.mode = mode;
                slot.interval_ms = duration_ms;
                slot.deadline = deadline;
                slot.self_destroy = false;
                drop(slot);
                self.retire(previous.into());
                return id;
            }
        }

        self.insert_timer(TimerSlot {
            mode,
            interval_ms: duration_ms,
            deadline,
            callback,
            self_destroy: false,
        })
    }

    unsafe fn timer_singleshot(
        &self,
        delay_ms: u64,
        invoke: InvokeFn,
        user_data: *mut c_void,
        release: ReleaseFn,
    ) {
        self.record(Call::TimerSingleShot { delay_ms });
        self.insert_timer(TimerSlot {
            mode: TimerMode::SingleShot,
            interval_ms: delay_ms,
            deadline: Some(self.clock.now_ms().saturating_add(delay_ms)),
            callback: RawCapsule {
                invoke,
                user_data,
                release,
            },
            self_destroy: true,
        });
    }

    fn timer_stop(&self, id: usize) {
        self.record(Call::TimerStop(id));
        if let Some(mut slot) = self.timers.get_mut(&id) {
            slot.deadline = None;
        }
    }

    fn timer_restart(&self, id: usize) {
        self.record(Call::TimerRestart(id));
        let now = self.clock.now_ms();
        if let Some(mut slot) = self.timers.get_mut(&id) {
            slot.deadline = Some(now.saturating_add(slot.interval_ms));
        }
    }

    fn timer_destroy(&self, id: usize) {
        self.record(Call::TimerDestroy(id));
        self.remove_timer(id);
    }

    fn timer_running(&self, id: usize) -> bool {
        self.timers
            .get(&id)
            .is_some_and(|slot| slot.deadline.is_some())
    }

    fn callback_new(&self) -> usize {
        let id = self.allocate_id();
        self.callbacks.insert(id, None);
        self.record(Call::CallbackNew(id));
        id
    }

    unsafe fn callback_set_handler(
        &self,
        id: usize,
        binding: BindingFn,
        user_data: *mut c_void,
        release: ReleaseFn,
    ) {
        self.record(Call::CallbackSetHandler(id));
        let handler = RawBinding {
            binding,
            user_data,
            release,
        };
        let previous = match self.callbacks.get_mut(&id) {
            Some(mut slot) => slot.replace(handler),
            // Unknown slot: the handler is ours to free right away.
            None => Some(handler),
        };
        if let Some(previous) = previous {
            self.retire(previous.into());
        }
    }

    unsafe fn callback_call(&self, id: usize, arg: *const c_void, ret: *mut c_void) {
        self.record(Call::CallbackCall(id));
        let handler = self.callbacks.get(&id).and_then(|slot| {
            slot.value()
                .as_ref()
                .map(|handler| (handler.binding, handler.user_data))
        });
        if let Some((binding, user_data)) = handler {
            self.dispatching(|| unsafe { binding(user_data, arg, ret) });
        }
    }

    fn callback_drop(&self, id: usize) {
        self.record(Call::CallbackDrop(id));
        if let Some((_, Some(handler))) = self.callbacks.remove(&id) {
            self.retire(handler.into());
        }
    }

    fn run_event_loop(&self, _quit_on_last_window_closed: bool) {
        self.record(Call::RunEventLoop);
        self.running.store(true, Ordering::Release);
        let _guard = thread::enter();
        tracing::debug!("headless event loop running");

        loop {
            self.dispatch_events();
            self.fire_due_timers();
            if self.quit.swap(false, Ordering::AcqRel) {
                break;
            }

            let now = self.clock.now_ms();
            let wait = self
                .next_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(now)))
                .unwrap_or(MAX_WAIT)
                .min(MAX_WAIT);
            let mut events = self.events.lock();
            if events.is_empty() && !wait.is_zero() && !self.quit.load(Ordering::Acquire) {
                self.wakeup.wait_for(&mut events, wait);
            }
        }

        self.running.store(false, Ordering::Release);
        let undelivered = self.pending_events();
        if undelivered > 0 {
            tracing::debug!(undelivered, "headless event loop exited with queued events");
        }
    }

    fn quit_event_loop(&self) {
        self.record(Call::QuitEventLoop);
        self.quit.store(true, Ordering::Release);
        let _events = self.events.lock();
        self.wakeup.notify_all();
    }

    fn update_timers_and_animations(&self) {
        self.record(Call::UpdateTimersAndAnimations);
        thread::assert_loop_thread("update_timers_and_animations");
        self.fire_due_timers();
    }

    fn duration_until_next_timer_update(&self) -> u64 {
        self.record(Call::DurationUntilNextTimerUpdate);
        let now = self.clock.now_ms();
        self.next_deadline()
            .map(|deadline| deadline.saturating_sub(now))
            .unwrap_or(NO_PENDING_UPDATE)
    }
}

impl Drop for HeadlessRuntime {
    fn drop(&mut self) {
        // Registered contexts are released with the runtime; queued events are
        // not, matching a loop that shut down before delivering them.
        for (_, slot) in std::mem::take(&mut self.timers) {
            unsafe { Release::from(slot.callback).run() };
        }
        for handler in std::mem::take(&mut self.callbacks)
            .into_iter()
            .filter_map(|(_, handler)| handler)
        {
            unsafe { Release::from(handler).run() };
        }
        for release in std::mem::take(self.deferred.get_mut()) {
            unsafe { release.run() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::capsule::Capsule;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn post(runtime: &HeadlessRuntime, work: impl FnOnce() + Send + 'static) {
        crate::bridge::capsule::post(runtime, Capsule::once(work));
    }

    #[test]
    fn test_ids_start_at_one() {
        let runtime = HeadlessRuntime::new();
        assert_eq!(runtime.callback_new(), 1);
        assert_eq!(runtime.callback_new(), 2);
    }

    #[test]
    fn test_no_timers_reports_sentinel() {
        let runtime = HeadlessRuntime::new().with_manual_clock();
        assert_eq!(runtime.duration_until_next_timer_update(), NO_PENDING_UPDATE);
    }

    #[test]
    fn test_duration_until_next_timer() {
        let runtime = HeadlessRuntime::new().with_manual_clock();
        let raw = Capsule::new(|| {}).into_raw();
        unsafe {
            runtime.timer_start(0, TimerMode::Repeated, 40, raw.invoke, raw.user_data, raw.release)
        };
        assert_eq!(runtime.duration_until_next_timer_update(), 40);
        runtime.advance(Duration::from_millis(15));
        assert_eq!(runtime.duration_until_next_timer_update(), 25);
    }

    #[test]
    fn test_singleshot_fires_once_and_frees_itself() {
        let runtime = HeadlessRuntime::new().with_manual_clock();
        let fired = Arc::new(AtomicU32::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&released));
        let seen = Arc::clone(&fired);
        let raw = Capsule::new(move || {
            let _keep = &flag;
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .into_raw();

        unsafe { runtime.timer_singleshot(0, raw.invoke, raw.user_data, raw.release) };
        runtime.pump();
        runtime.advance(Duration::from_secs(1));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.timer_count(), 0);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_events_left_at_exit_are_leaked() {
        let released = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicBool::new(false));
        {
            let runtime = HeadlessRuntime::new();
            let flag = DropFlag(Arc::clone(&released));
            let seen = Arc::clone(&ran);
            post(&runtime, move || {
                let _keep = flag;
                seen.store(true, Ordering::SeqCst);
            });
            assert_eq!(runtime.pending_events(), 1);
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dropping_runtime_releases_timers() {
        let released = Arc::new(AtomicBool::new(false));
        {
            let runtime = HeadlessRuntime::new().with_manual_clock();
            let flag = DropFlag(Arc::clone(&released));
            let raw = Capsule::new(move || {
                let _keep = &flag;
            })
            .into_raw();
            unsafe {
                runtime.timer_start(0, TimerMode::Repeated, 10, raw.invoke, raw.user_data, raw.release)
            };
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_restarting_from_own_callback_defers_release() {
        let runtime = Arc::new(HeadlessRuntime::new().with_manual_clock());
        let released = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicU32::new(0));

        let flag = DropFlag(Arc::clone(&released));
        let inner = Arc::clone(&runtime);
        let seen = Arc::clone(&hits);
        let raw = Capsule::new(move || {
            let _keep = &flag;
            seen.fetch_add(1, Ordering::SeqCst);
            // Replace our own callback while it is running.
            let next = Capsule::new(|| {}).into_raw();
            unsafe {
                inner.timer_start(1, TimerMode::SingleShot, 5, next.invoke, next.user_data, next.release)
            };
            assert!(!flag.0.load(Ordering::SeqCst));
        })
        .into_raw();
        let id = unsafe {
            runtime.timer_start(0, TimerMode::SingleShot, 5, raw.invoke, raw.user_data, raw.release)
        };
        assert_eq!(id, 1);

        runtime.advance(Duration::from_millis(5));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(runtime.timer_count(), 1);

        // Break the runtime <-> capsule cycle before the test ends.
        runtime.timer_destroy(1);
    }

    #[test]
    fn test_run_loop_until_quit() {
        let runtime = Arc::new(HeadlessRuntime::new().with_journal());
        let looping = Arc::clone(&runtime);
        let quitter = Arc::clone(&runtime);
        post(&runtime, move || quitter.quit_event_loop());

        std::thread::spawn(move || looping.run_event_loop(false))
            .join()
            .unwrap();

        assert!(!runtime.is_running());
        assert_eq!(
            runtime.journal(),
            vec![Call::PostEvent, Call::RunEventLoop, Call::QuitEventLoop]
        );
    }
}
