//! Event loop scenarios against the headless runtime on a real loop thread.
//!
//! Covers:
//! - executor work and spawned futures only ever run on the loop thread
//! - readiness resumes every waiter only after the loop started running
//! - the idle driver keeps pumping when nothing is scheduled
//! - work posted after the loop exited is never run nor released

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use loopbridge::headless::Call;
use loopbridge::{BridgeConfig, BridgeError, EventLoop, HeadlessRuntime, LoopState, OneShot};

struct Running {
    runtime: Arc<HeadlessRuntime>,
    event_loop: Arc<EventLoop>,
    thread: JoinHandle<Result<(), BridgeError>>,
}

impl Running {
    fn stop(self) -> (Arc<HeadlessRuntime>, Arc<EventLoop>) {
        self.event_loop.stop();
        self.thread.join().unwrap().unwrap();
        (self.runtime, self.event_loop)
    }
}

fn start(runtime: Arc<HeadlessRuntime>, event_loop: Arc<EventLoop>) -> Running {
    let looping = Arc::clone(&event_loop);
    let thread = std::thread::Builder::new()
        .name("event-loop".into())
        .spawn(move || looping.start())
        .unwrap();
    Running {
        runtime,
        event_loop,
        thread,
    }
}

fn headless(runtime: HeadlessRuntime, config: BridgeConfig) -> (Arc<HeadlessRuntime>, Arc<EventLoop>) {
    let runtime = Arc::new(runtime);
    let event_loop = Arc::new(EventLoop::new(runtime.clone(), config));
    (runtime, event_loop)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn executor_work_runs_on_loop_thread() {
    let (runtime, event_loop) = headless(HeadlessRuntime::new(), BridgeConfig::default());
    let running = start(runtime, event_loop.clone());
    event_loop.ready().await.unwrap();
    let loop_thread = event_loop.loop_thread().unwrap();
    assert_ne!(loop_thread, std::thread::current().id());

    let results: Vec<_> = (0..8)
        .map(|_| event_loop.executor().run(|| std::thread::current().id()))
        .collect();
    for result in results {
        assert_eq!(result.value().await.unwrap(), loop_thread);
    }

    // A future woken from a host worker still resumes on the loop thread.
    let gate: OneShot<()> = OneShot::new();
    let waiting = gate.clone();
    let task = event_loop.executor().spawn(async move {
        let before = std::thread::current().id();
        waiting.value().await.unwrap();
        (before, std::thread::current().id())
    });
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.send(());
    });
    assert_eq!(task.await, (loop_thread, loop_thread));

    running.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_resumes_all_waiters_after_loop_runs() {
    let (runtime, event_loop) = headless(
        HeadlessRuntime::new().with_journal(),
        BridgeConfig::default(),
    );

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let ready = event_loop.ready();
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                ready.await.unwrap();
                runtime.journal()
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(waiters.iter().all(|waiter| !waiter.is_finished()));
    assert_eq!(event_loop.readiness().waiter_count(), 3);
    assert_eq!(event_loop.state(), LoopState::Idle);

    let running = start(runtime, event_loop.clone());
    for waiter in waiters {
        let journal = waiter.await.unwrap();
        let armed = journal
            .iter()
            .position(|call| *call == Call::TimerSingleShot { delay_ms: 0 })
            .unwrap();
        let run = journal
            .iter()
            .position(|call| *call == Call::RunEventLoop)
            .unwrap();
        assert!(armed < run);
    }
    assert_eq!(event_loop.state(), LoopState::Running);

    running.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_driver_sleeps_no_longer_than_ceiling() {
    let config = BridgeConfig {
        idle_ceiling_ms: 20,
        ..BridgeConfig::default()
    };
    let (runtime, event_loop) = headless(HeadlessRuntime::new().with_journal(), config);
    let idle = event_loop.spawn_idle_driver(&tokio::runtime::Handle::current());
    let running = start(runtime, event_loop.clone());
    event_loop.ready().await.unwrap();

    // Nothing is scheduled, so the runtime reports "no pending update".
    tokio::time::sleep(Duration::from_millis(250)).await;
    idle.abort();
    let (runtime, _) = running.stop();

    let pumps = runtime
        .journal()
        .iter()
        .filter(|call| **call == Call::UpdateTimersAndAnimations)
        .count();
    assert!(pumps >= 3, "idle driver pumped only {pumps} times");
}

#[test]
fn idle_driver_clamps_sentinel_to_ceiling() {
    let runtime = Arc::new(HeadlessRuntime::new());
    let event_loop = EventLoop::new(runtime, BridgeConfig::default());
    let driver = loopbridge::IdleDriver::new(event_loop.executor().clone(), Duration::from_millis(100));
    assert_eq!(
        driver.sleep_for(loopbridge::bridge::abi::NO_PENDING_UPDATE),
        Duration::from_millis(100)
    );
}

#[test]
fn work_posted_after_exit_is_leaked() {
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let released = Arc::new(AtomicBool::new(false));
    let ran = Arc::new(AtomicBool::new(false));
    {
        let (runtime, event_loop) = headless(HeadlessRuntime::new(), BridgeConfig::default());
        event_loop.stop();
        event_loop.start().unwrap();
        assert_eq!(event_loop.state(), LoopState::Stopped);

        let flag = DropFlag(Arc::clone(&released));
        let seen = Arc::clone(&ran);
        event_loop.executor().enqueue(move || {
            let _keep = flag;
            seen.store(true, Ordering::SeqCst);
        });
        assert_eq!(runtime.pending_events(), 1);
    }
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!released.load(Ordering::SeqCst));
}
