//! Session lifecycle on the loopback substrate.
//!
//! These run anywhere: calls are routed explicitly through
//! `LoopbackSubstrate::invoke` instead of being intercepted by the kernel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use syschaos::registry::Origin;
use syschaos::{
    CallContext, Eligibility, LoopbackSubstrate, Outcome, PlanBuilder, Probability, Session,
    SessionError, SessionState, StartError, ThreadDiscovery,
};
use syschaos_dispatch::current_tid;

const READ: i64 = 0;
const WRITE: i64 = 1;
const OPENAT: i64 = 257;
const EIO: i64 = 5;

/// Route a write on `fd` through the loopback.  The real call "succeeds"
/// with one byte written and records that it ran.
fn write_on(lb: &LoopbackSubstrate, fd: i32, ran: &AtomicU64) -> i64 {
    lb.invoke(WRITE, [fd as u64, 0, 1, 0, 0, 0], || {
        ran.fetch_add(1, Ordering::SeqCst);
        1
    })
}

fn loopback() -> Arc<LoopbackSubstrate> {
    Arc::new(LoopbackSubstrate::new())
}

#[test]
fn always_failing_write_fails_every_call() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();

    let ran = AtomicU64::new(0);
    for _ in 0..100 {
        assert_eq!(write_on(&lb, 3, &ran), -EIO);
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0, "failed calls must not run");

    session.stop().unwrap();
    let stats = session.stats();
    assert_eq!(stats.intercepted, 100);
    assert_eq!(stats.failed_before, 100);
}

#[test]
fn zero_probability_never_injects() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(0.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();

    let ran = AtomicU64::new(0);
    for _ in 0..1_000 {
        assert_eq!(write_on(&lb, 3, &ran), 1);
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1_000);
    assert_eq!(session.stats().failed(), 0);
}

#[test]
fn unconfigured_syscalls_pass_through() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();

    assert_eq!(lb.invoke(READ, [3, 0, 1, 0, 0, 0], || 1), 1);
    assert_eq!(session.stats().intercepted, 0);
}

#[test]
fn non_members_are_untouched() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();

    let ran = AtomicU64::new(0);
    assert_eq!(write_on(&lb, 3, &ran), 1);

    session.add_this_thread().unwrap();
    assert_eq!(write_on(&lb, 3, &ran), -EIO);
    session.remove_this_thread().unwrap();
    assert_eq!(write_on(&lb, 3, &ran), 1);
}

#[test]
fn descriptor_not_std_spares_stdio() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(
            WRITE,
            Outcome::failing(1.0, EIO as i32).with_eligibility(Eligibility::DescriptorNotStd),
        )
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();

    let ran = AtomicU64::new(0);
    for fd in 0..3 {
        assert_eq!(write_on(&lb, fd, &ran), 1, "fd {} must pass", fd);
    }
    for fd in 3..10 {
        assert_eq!(write_on(&lb, fd, &ran), -EIO, "fd {} must fail", fd);
    }
    assert_eq!(session.stats().ineligible, 3);
}

#[test]
fn custom_eligibility_runs_on_loopback() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(
            WRITE,
            Outcome::failing(1.0, EIO as i32)
                .with_eligibility(Eligibility::custom(|call: &CallContext| call.args[2] > 100)),
        )
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();

    assert_eq!(lb.invoke(WRITE, [3, 0, 10, 0, 0, 0], || 10), 10);
    assert_eq!(lb.invoke(WRITE, [3, 0, 4096, 0, 0, 0], || 4096), -EIO);
}

#[test]
fn failure_ratio_follows_probability() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .seed(1234)
        .outcome(WRITE, Outcome::failing(0.25, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();

    let ran = AtomicU64::new(0);
    let total = 20_000;
    let failed = (0..total)
        .filter(|_| write_on(&lb, 3, &ran) == -EIO)
        .count() as f64;
    // 1 failure for every 3 successes, give or take.
    let ratio = failed / (total as f64 - failed);
    assert!(
        (0.30..=0.37).contains(&ratio),
        "failure:success ratio {:.3} should be near 1:3",
        ratio
    );
}

#[test]
fn weighted_errors_follow_their_weights() {
    const ENOSPC: i64 = 28;
    let lb = loopback();
    let plan = PlanBuilder::new()
        .seed(99)
        .outcome(
            WRITE,
            Outcome::failing(1.0, EIO as i32).or_error(ENOSPC as i32, 3.0),
        )
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();

    let ran = AtomicU64::new(0);
    let (mut eio, mut enospc) = (0u32, 0u32);
    for _ in 0..10_000 {
        match write_on(&lb, 3, &ran) {
            r if r == -EIO => eio += 1,
            r if r == -ENOSPC => enospc += 1,
            r => panic!("unexpected result {}", r),
        }
    }
    let ratio = enospc as f64 / eio as f64;
    assert!((2.6..=3.4).contains(&ratio), "ENOSPC:EIO ratio {:.3}", ratio);
}

#[test]
fn after_bias_one_runs_the_call_then_fails_it() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(
            WRITE,
            Outcome::failing(1.0, EIO as i32).with_fail(Probability::new(1.0).with_after_bias(1.0)),
        )
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();

    let ran = AtomicU64::new(0);
    assert_eq!(write_on(&lb, 3, &ran), -EIO);
    assert_eq!(ran.load(Ordering::SeqCst), 1, "the real call ran");
    assert_eq!(session.stats().failed_after, 1);
}

#[test]
fn same_seed_same_decisions() {
    fn run(seed: u64) -> Vec<i64> {
        let lb = loopback();
        let plan = PlanBuilder::new()
            .seed(seed)
            .outcome(WRITE, Outcome::failing(0.5, EIO as i32))
            .build()
            .unwrap();
        let session = Session::start_with(plan, lb.clone()).unwrap();
        session.add_this_thread().unwrap();
        let ran = AtomicU64::new(0);
        (0..200).map(|_| write_on(&lb, 3, &ran)).collect()
    }

    assert_eq!(run(77), run(77));
    assert_ne!(run(77), run(78));
}

#[test]
fn failed_hook_rolls_back_earlier_hooks() {
    let lb = Arc::new(LoopbackSubstrate::new().refusing(OPENAT));
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .outcome(OPENAT, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();

    let err = Session::start_with(plan, lb.clone()).unwrap_err();
    assert!(matches!(err, StartError::Unsupported(_)), "{:?}", err);
    assert!(!lb.is_hooked(WRITE));
    assert!(!lb.is_hooked(OPENAT));
    assert!(!lb.is_active());

    // The substrate is free for the next session.
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    assert_eq!(session.state(), SessionState::Running);
}

#[test]
fn invalid_plan_is_rejected_before_anything_is_hooked() {
    let lb = loopback();
    let err = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.5, EIO as i32))
        .build()
        .unwrap_err();
    assert!(err.field.contains("fail"), "{}", err);
    assert!(!lb.is_hooked(WRITE));
}

#[test]
fn second_session_on_one_substrate_is_busy() {
    let lb = loopback();
    let plan = || {
        PlanBuilder::new()
            .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
            .build()
            .unwrap()
    };
    let first = Session::start_with(plan(), lb.clone()).unwrap();
    assert!(matches!(
        Session::start_with(plan(), lb.clone()),
        Err(StartError::StartFailed(_))
    ));
    // The failed start never activated, so routing still belongs to the
    // first session.
    assert!(lb.is_active());
    assert_eq!(first.state(), SessionState::Running);
    first.stop().unwrap();
}

#[test]
fn explicit_membership_with_other_threads() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();

    let (tid_tx, tid_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let worker = thread::spawn({
        let lb = lb.clone();
        move || {
            tid_tx.send(current_tid()).unwrap();
            go_rx.recv().unwrap();
            let ran = AtomicU64::new(0);
            write_on(&lb, 3, &ran)
        }
    });
    let tid = tid_rx.recv().unwrap();
    assert!(session.add_thread(tid).unwrap());
    assert_eq!(session.member_record(tid).unwrap().origin, Origin::Explicit);
    go_tx.send(()).unwrap();
    assert_eq!(worker.join().unwrap(), -EIO);

    assert!(matches!(
        session.add_thread(i32::MAX),
        Err(SessionError::NoSuchThread(_))
    ));
}

#[cfg(target_os = "linux")]
#[test]
fn polling_discovers_threads_within_the_interval() {
    let lb = loopback();
    let interval = Duration::from_millis(20);
    let plan = PlanBuilder::new()
        .discovery(ThreadDiscovery::poll(interval))
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();

    // The starting thread was found by the initial scan.
    assert!(session.is_member(current_tid()));
    let poller = session.poller_tid().unwrap();
    assert!(!session.is_member(poller));

    let (tid_tx, tid_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let worker = thread::spawn(move || {
        tid_tx.send(current_tid()).unwrap();
        let _ = done_rx.recv();
    });
    let tid = tid_rx.recv().unwrap();

    // One interval plus scheduling slack.
    let bound = interval * 4;
    let spawned = Instant::now();
    while !session.is_member(tid) && spawned.elapsed() < bound {
        thread::sleep(Duration::from_millis(1));
    }
    let waited = spawned.elapsed();
    assert!(session.is_member(tid), "not discovered within {:?}", bound);
    assert!(waited <= bound, "discovered after {:?}", waited);
    assert_eq!(session.member_record(tid).unwrap().origin, Origin::Discovered);

    // Explicit removal sticks across later scans.
    session.remove_thread(tid).unwrap();
    thread::sleep(interval * 5);
    assert!(!session.is_member(tid));

    drop(done_tx);
    worker.join().unwrap();
    session.stop().unwrap();
    assert_eq!(session.poller_tid(), None);
}

#[cfg(target_os = "linux")]
#[test]
fn no_discovery_means_no_implicit_members() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(session.members().is_empty());
    assert_eq!(session.poller_tid(), None);

    // A one-shot scan is still available.
    assert!(session.discover_threads().unwrap() >= 1);
    assert!(session.is_member(current_tid()));
}

#[test]
fn no_injection_after_stop_returns() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();

    let stopped = Arc::new(AtomicBool::new(false));
    let (tid_tx, tid_rx) = mpsc::channel();
    let worker = thread::spawn({
        let lb = lb.clone();
        let stopped = stopped.clone();
        move || {
            tid_tx.send(current_tid()).unwrap();
            let ran = AtomicU64::new(0);
            let mut late_failures = 0;
            loop {
                // Read the flag before the call: anything failing after
                // stop() returned is a violation.
                let was_stopped = stopped.load(Ordering::SeqCst);
                let ret = write_on(&lb, 3, &ran);
                if was_stopped {
                    if ret == -EIO {
                        late_failures += 1;
                    }
                    if ran.load(Ordering::SeqCst) > 1_000 {
                        return late_failures;
                    }
                }
            }
        }
    });
    session.add_thread(tid_rx.recv().unwrap()).unwrap();
    thread::sleep(Duration::from_millis(20));

    session.stop().unwrap();
    stopped.store(true, Ordering::SeqCst);
    assert_eq!(worker.join().unwrap(), 0);
    assert!(session.stats().failed_before > 0);
}

#[test]
fn membership_after_stop() {
    let lb = loopback();
    let plan = PlanBuilder::new()
        .outcome(WRITE, Outcome::failing(1.0, EIO as i32))
        .build()
        .unwrap();
    let session = Session::start_with(plan, lb.clone()).unwrap();
    session.add_this_thread().unwrap();
    session.stop().unwrap();

    assert!(lb.armed_threads().is_empty());
    assert!(matches!(
        session.add_this_thread(),
        Err(SessionError::Stopped)
    ));
    assert!(!session.remove_this_thread().unwrap());
    assert!(session.stop().is_ok());
}
