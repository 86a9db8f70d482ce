//! The interception substrate contract.
//!
//! A [`Substrate`] is whatever actually intercepts syscalls and routes them
//! to a [`DecisionEngine`].  The session controller only talks to this
//! trait, so the same lifecycle code drives the kernel-backed
//! [`DispatchSubstrate`](crate::DispatchSubstrate) and the in-process
//! [`LoopbackSubstrate`](crate::LoopbackSubstrate).

use std::io;
use std::sync::Arc;
use std::time::Duration;
use syschaos_fault::engine::{DecisionEngine, Tid};
use thiserror::Error;

/// Errors from an interception substrate.
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("the interception substrate is already in use by another session")]
    Busy,

    #[error("thread {0} does not exist")]
    NoSuchThread(Tid),

    #[error("thread {0} has SIGSYS blocked and cannot be armed")]
    SigsysBlocked(Tid),

    #[error("thread {tid} did not acknowledge {what} within {timeout:?}")]
    Timeout {
        tid: Tid,
        what: &'static str,
        timeout: Duration,
    },

    #[error("{what} failed for thread {tid}")]
    Os {
        tid: Tid,
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// What a substrate can honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether [`Eligibility::Custom`](syschaos_fault::Eligibility::Custom)
    /// predicates may run at interception time.
    pub custom_eligibility: bool,
}

/// Syscall interception backend.
///
/// Lifecycle, as driven by the session controller:
///
/// ```text
/// hook(nr)* → activate(engine) → arm/disarm(tid)* → deactivate() → unhook(nr)* → release()
/// ```
///
/// Implementations must make `deactivate` a drain barrier: once it
/// returns, no call is routed to the engine it was activated with, and
/// no directive from that engine is still being applied.
pub trait Substrate: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Register interest in `syscall`.
    fn hook(&self, syscall: i64) -> Result<(), SubstrateError>;

    /// Withdraw interest in `syscall`.  Unhooking an unhooked syscall is a
    /// no-op.
    fn unhook(&self, syscall: i64);

    /// Route intercepted calls to `engine`.
    fn activate(&self, engine: Arc<DecisionEngine>) -> Result<(), SubstrateError>;

    /// Stop routing and wait for in-flight decisions to finish.
    fn deactivate(&self);

    /// Start intercepting calls made by `tid`.
    fn arm(&self, tid: Tid) -> Result<(), SubstrateError>;

    /// Stop intercepting calls made by `tid`.  Disarming a thread that has
    /// exited succeeds.
    fn disarm(&self, tid: Tid) -> Result<(), SubstrateError>;

    fn arm_current(&self) -> Result<(), SubstrateError> {
        self.arm(current_tid())
    }

    fn disarm_current(&self) -> Result<(), SubstrateError> {
        self.disarm(current_tid())
    }

    /// Shield the calling thread's own syscalls from injection until the
    /// matching [`leave_control`](Self::leave_control).  Nests.
    fn enter_control(&self) {}

    fn leave_control(&self) {}

    /// Threads whose interception lapsed and should be re-armed.
    fn take_lapsed(&self) -> Vec<Tid> {
        Vec::new()
    }

    /// Give up any process-wide claim so another session can start.
    /// Called once the owning session has stopped; idempotent.
    fn release(&self) {}
}

/// RAII form of [`Substrate::enter_control`].
pub struct ControlGuard<'a> {
    substrate: &'a dyn Substrate,
}

impl<'a> ControlGuard<'a> {
    pub fn new(substrate: &'a dyn Substrate) -> Self {
        substrate.enter_control();
        Self { substrate }
    }
}

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        self.substrate.leave_control();
    }
}

/// Kernel thread id of the caller.
#[cfg(target_os = "linux")]
pub fn current_tid() -> Tid {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::gettid() }
}

/// Process-local id of the caller, assigned on first use.
#[cfg(not(target_os = "linux"))]
pub fn current_tid() -> Tid {
    use std::sync::atomic::{AtomicI32, Ordering};

    static NEXT: AtomicI32 = AtomicI32::new(1);
    thread_local! {
        static TID: Tid = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|tid| *tid)
}

/// Whether `tid` names a live thread of this process.
#[cfg(target_os = "linux")]
pub fn thread_exists(tid: Tid) -> bool {
    // SAFETY: signal 0 only performs the existence and permission checks.
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Without kernel thread ids there is nothing to check; every id is
/// treated as live.
#[cfg(not(target_os = "linux"))]
pub fn thread_exists(_tid: Tid) -> bool {
    true
}
