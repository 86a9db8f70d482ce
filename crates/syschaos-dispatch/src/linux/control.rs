//! Process-wide dispatch state and the control path.
//!
//! Everything the signal handlers read lives in statics made of atomics:
//! the hooked-syscall bitmap, the routing pointer with its in-flight
//! counter, and the lapsed-thread ring.  The controller side
//! ([`DispatchSubstrate`]) mutates them; the handlers only load.

use super::handler::{on_control, on_sigsys};
use super::thread::with_thread;
use super::trampoline::{raw_syscall, restorer};
use super::{assign_signals, control_mask, sig_arm, sig_disarm, sig_rearm, sigbit};
use crate::substrate::{current_tid, thread_exists, Capabilities, Substrate, SubstrateError};
use log::{debug, trace, warn};
use std::io;
use std::os::raw::{c_int, c_long, c_ulong};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use syschaos_fault::engine::{DecisionEngine, Tid};
use syschaos_fault::plan::MAX_SYSCALL;

// ═══════════════════════════════════════════════════════════════════════
//  Hooked syscalls
// ═══════════════════════════════════════════════════════════════════════

const HOOK_WORDS: usize = (MAX_SYSCALL as usize + 63) / 64;

#[allow(clippy::declare_interior_mutable_const)]
const UNHOOKED: AtomicU64 = AtomicU64::new(0);
static HOOKED: [AtomicU64; HOOK_WORDS] = [UNHOOKED; HOOK_WORDS];

/// Syscalls the handler itself depends on.
const UNHOOKABLE: [i64; 3] = [
    libc::SYS_rt_sigreturn,
    libc::SYS_exit,
    libc::SYS_restart_syscall,
];

pub(crate) fn is_hooked(nr: i64) -> bool {
    if !(0..MAX_SYSCALL).contains(&nr) {
        return false;
    }
    let nr = nr as usize;
    HOOKED[nr / 64].load(Ordering::SeqCst) & (1 << (nr % 64)) != 0
}

fn set_hooked(nr: i64, hooked: bool) {
    let nr = nr as usize;
    let bit = 1u64 << (nr % 64);
    if hooked {
        HOOKED[nr / 64].fetch_or(bit, Ordering::SeqCst);
    } else {
        HOOKED[nr / 64].fetch_and(!bit, Ordering::SeqCst);
    }
}

fn clear_hooks() {
    for word in &HOOKED {
        word.store(0, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Routing
// ═══════════════════════════════════════════════════════════════════════

pub(crate) struct Routing {
    pub(crate) session: u64,
    pub(crate) engine: Arc<DecisionEngine>,
}

static ROUTING: AtomicPtr<Routing> = AtomicPtr::new(ptr::null_mut());
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Run `f` inside the in-flight window.
///
/// The counter is raised before the pointer is loaded and `deactivate`
/// withdraws the pointer before it polls the counter (both SeqCst), so
/// either this call sees null or `deactivate` waits for it.
pub(crate) fn with_routing<R>(f: impl FnOnce(Option<&Routing>) -> R) -> R {
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let current = ROUTING.load(Ordering::SeqCst);
    // SAFETY: a published routing is freed only after it was withdrawn
    // and IN_FLIGHT dropped to zero, which cannot happen while we hold
    // our increment.
    let result = f(unsafe { current.as_ref() });
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    result
}

// ═══════════════════════════════════════════════════════════════════════
//  Lapsed threads
// ═══════════════════════════════════════════════════════════════════════

const LAPSED_SLOTS: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicI32 = AtomicI32::new(0);
static LAPSED: [AtomicI32; LAPSED_SLOTS] = [EMPTY_SLOT; LAPSED_SLOTS];

/// Queue `tid` for re-arming.  Drops the entry when the ring is full;
/// the thread then stays suspended until it is armed again explicitly.
pub(crate) fn push_lapsed(tid: Tid) {
    for slot in &LAPSED {
        match slot.compare_exchange(0, tid, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return,
            Err(existing) if existing == tid => return,
            Err(_) => {}
        }
    }
}

fn drain_lapsed() -> Vec<Tid> {
    LAPSED
        .iter()
        .map(|slot| slot.swap(0, Ordering::SeqCst))
        .filter(|&tid| tid != 0)
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Signal handlers
// ═══════════════════════════════════════════════════════════════════════

const SA_RESTORER: c_ulong = 0x0400_0000;

/// `struct sigaction` as the kernel sees it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelSigaction {
    pub(crate) handler: usize,
    pub(crate) flags: c_ulong,
    pub(crate) restorer: usize,
    pub(crate) mask: u64,
}

impl KernelSigaction {
    pub(crate) const fn default_action() -> Self {
        Self {
            handler: libc::SIG_DFL,
            flags: 0,
            restorer: 0,
            mask: 0,
        }
    }
}

/// Raw `rt_sigaction`.  Safe to call from signal context.
///
/// # Safety
///
/// `action.handler` must be a handler matching `action.flags`.
pub(crate) unsafe fn set_action(sig: c_int, action: &KernelSigaction) -> io::Result<KernelSigaction> {
    let mut old = KernelSigaction::default_action();
    let rc = raw_syscall(
        libc::SYS_rt_sigaction,
        [
            sig as c_long,
            action as *const KernelSigaction as c_long,
            &mut old as *mut KernelSigaction as c_long,
            8,
            0,
            0,
        ],
    );
    if rc < 0 {
        return Err(io::Error::from_raw_os_error(-rc as i32));
    }
    Ok(old)
}

fn query_action(sig: c_int) -> io::Result<KernelSigaction> {
    let mut old = KernelSigaction::default_action();
    // SAFETY: a null new action only reads the current one.
    let rc = unsafe {
        raw_syscall(
            libc::SYS_rt_sigaction,
            [
                sig as c_long,
                0,
                &mut old as *mut KernelSigaction as c_long,
                8,
                0,
                0,
            ],
        )
    };
    if rc < 0 {
        return Err(io::Error::from_raw_os_error(-rc as i32));
    }
    Ok(old)
}

static PREV_SIGSYS: OnceLock<KernelSigaction> = OnceLock::new();

/// SIGSYS disposition that was in place before ours.
pub(crate) fn previous_sigsys() -> Option<&'static KernelSigaction> {
    PREV_SIGSYS.get()
}

static INSTALLED: OnceLock<Result<(), String>> = OnceLock::new();

/// Probe the kernel and install the handlers, once per process.
///
/// The handlers are never removed: with no session active they pass
/// everything through.
fn install() -> Result<(), SubstrateError> {
    INSTALLED
        .get_or_init(install_handlers)
        .clone()
        .map_err(SubstrateError::Unsupported)
}

fn install_handlers() -> Result<(), String> {
    probe_kernel()?;
    assign_signals();

    let prev = query_action(libc::SIGSYS).map_err(|e| format!("reading SIGSYS action: {}", e))?;
    let _ = PREV_SIGSYS.set(prev);

    let sigsys = KernelSigaction {
        handler: on_sigsys as *const () as usize,
        flags: (libc::SA_SIGINFO | libc::SA_NODEFER) as c_ulong | SA_RESTORER,
        restorer: restorer(),
        mask: 0,
    };
    // SAFETY: on_sigsys has the SA_SIGINFO signature.
    unsafe { set_action(libc::SIGSYS, &sigsys) }
        .map_err(|e| format!("installing SIGSYS handler: {}", e))?;

    let control = KernelSigaction {
        handler: on_control as *const () as usize,
        flags: (libc::SA_SIGINFO | libc::SA_RESTART) as c_ulong | SA_RESTORER,
        restorer: restorer(),
        mask: control_mask(),
    };
    for sig in [sig_arm(), sig_disarm(), sig_rearm()] {
        // SAFETY: on_control has the SA_SIGINFO signature.
        unsafe { set_action(sig, &control) }
            .map_err(|e| format!("installing handler for signal {}: {}", sig, e))?;
    }

    debug!(
        "dispatch handlers installed (arm={}, disarm={}, rearm={})",
        sig_arm(),
        sig_disarm(),
        sig_rearm()
    );
    Ok(())
}

/// Turn dispatch on and off again on the calling thread.  The selector
/// stays ALLOW throughout, so nothing is intercepted.
fn probe_kernel() -> Result<(), String> {
    let rc = with_thread(|t| {
        if t.is_armed() {
            return 0;
        }
        let rc = t.arm();
        if rc == 0 {
            t.disarm();
        }
        rc
    })
    .unwrap_or(0);

    match rc {
        0 => Ok(()),
        rc if rc == -(libc::EINVAL as c_long) => Err(
            "syscall user dispatch is not available (needs Linux 5.11+ on x86_64)".to_string(),
        ),
        rc => Err(format!(
            "PR_SET_SYSCALL_USER_DISPATCH probe failed: {}",
            io::Error::from_raw_os_error(-rc as i32)
        )),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Cross-thread handshake
// ═══════════════════════════════════════════════════════════════════════

pub(crate) const SI_QUEUE: c_int = -1;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const SPIN_LIMIT: u32 = 64;
const LIVENESS_EVERY: u32 = 256;

/// Completion slot shared with the target thread's handler.
#[repr(C)]
pub(crate) struct Handshake {
    done: AtomicBool,
    result: AtomicI32,
}

impl Handshake {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            result: AtomicI32::new(0),
        }
    }

    /// Publish the result.  The controller may free `self` as soon as
    /// this returns.
    pub(crate) fn complete(&self, result: c_long) {
        self.result.store(result as i32, Ordering::Relaxed);
        self.done.store(true, Ordering::Release);
    }
}

/// `siginfo_t` in its SI_QUEUE shape (x86_64, 128 bytes).
#[repr(C)]
pub(crate) struct QueuedInfo {
    pub(crate) signo: c_int,
    errno: c_int,
    pub(crate) code: c_int,
    _pad: c_int,
    pub(crate) pid: c_int,
    uid: u32,
    pub(crate) value: usize,
    _rest: [u64; 12],
}

/// Ask `tid` to run a control operation on itself and wait for the
/// result it reports (0 or a negative errno).
fn handshake(tid: Tid, sig: c_int, what: &'static str) -> Result<c_long, SubstrateError> {
    let shared = Box::into_raw(Box::new(Handshake::new()));
    // SAFETY: getpid and getuid have no preconditions.
    let (pid, uid) = unsafe { (libc::getpid(), libc::getuid()) };
    let info = QueuedInfo {
        signo: sig,
        errno: 0,
        code: SI_QUEUE,
        _pad: 0,
        pid,
        uid,
        value: shared as usize,
        _rest: [0; 12],
    };

    // SAFETY: `info` is a complete siginfo for a queued signal.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_rt_tgsigqueueinfo,
            pid,
            tid,
            sig,
            &info as *const QueuedInfo,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // SAFETY: nothing was queued, so the handshake is still ours alone.
        drop(unsafe { Box::from_raw(shared) });
        return Err(match err.raw_os_error() {
            Some(libc::ESRCH) => SubstrateError::NoSuchThread(tid),
            _ => SubstrateError::Os {
                tid,
                what,
                source: err,
            },
        });
    }
    trace!("queued {} for thread {}", what, tid);

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut spins = 0u32;
    loop {
        // SAFETY: `shared` stays allocated until one of the branches
        // below frees or leaks it.
        if unsafe { (*shared).done.load(Ordering::Acquire) } {
            // SAFETY: the target no longer touches a completed handshake.
            let done = unsafe { Box::from_raw(shared) };
            return Ok(done.result.load(Ordering::Relaxed) as c_long);
        }

        spins = spins.wrapping_add(1);
        if spins < SPIN_LIMIT {
            std::hint::spin_loop();
        } else {
            thread::yield_now();
        }
        if spins % LIVENESS_EVERY != 0 {
            continue;
        }

        if !thread_exists(tid) {
            // SAFETY: as above.
            if unsafe { (*shared).done.load(Ordering::Acquire) } {
                continue;
            }
            // SAFETY: a thread that is gone runs no handler.
            drop(unsafe { Box::from_raw(shared) });
            return Err(SubstrateError::NoSuchThread(tid));
        }
        if Instant::now() >= deadline {
            // The target may still run the handler later; the handshake
            // is leaked rather than freed under it.
            warn!(
                "thread {} did not acknowledge {} within {:?}",
                tid, what, HANDSHAKE_TIMEOUT
            );
            return Err(SubstrateError::Timeout {
                tid,
                what,
                timeout: HANDSHAKE_TIMEOUT,
            });
        }
    }
}

fn check(rc: c_long, tid: Tid, what: &'static str) -> Result<(), SubstrateError> {
    if rc == 0 {
        return Ok(());
    }
    Err(SubstrateError::Os {
        tid,
        what,
        source: io::Error::from_raw_os_error(-rc as i32),
    })
}

/// Whether the calling thread's real signal mask blocks SIGSYS.
fn sigsys_blocked() -> bool {
    let mut current = 0u64;
    // SAFETY: a null new set only reads the mask.
    let rc = unsafe {
        raw_syscall(
            libc::SYS_rt_sigprocmask,
            [
                libc::SIG_BLOCK as c_long,
                0,
                &mut current as *mut u64 as c_long,
                8,
                0,
                0,
            ],
        )
    };
    rc == 0 && current & sigbit(libc::SIGSYS) != 0
}

// ═══════════════════════════════════════════════════════════════════════
//  DispatchSubstrate
// ═══════════════════════════════════════════════════════════════════════

static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Process-scoped handle on syscall user dispatch.
///
/// At most one handle holds the claim at a time.  [`release`] (called by
/// the session when it stops) or dropping the handle deactivates routing,
/// clears every hook and gives the claim back, so sessions can run one
/// after another in the same process.
///
/// [`release`]: Substrate::release
#[derive(Debug)]
pub struct DispatchSubstrate {
    claimed: AtomicBool,
}

impl DispatchSubstrate {
    /// Claim the process-wide substrate.
    ///
    /// The first successful claim probes kernel support and installs the
    /// signal handlers.
    pub fn acquire() -> Result<Self, SubstrateError> {
        if CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SubstrateError::Busy);
        }
        if let Err(e) = install() {
            CLAIMED.store(false, Ordering::Release);
            return Err(e);
        }
        debug!("dispatch substrate acquired");
        Ok(Self {
            claimed: AtomicBool::new(true),
        })
    }

    /// Check kernel support without claiming the substrate.
    pub fn probe() -> Result<(), SubstrateError> {
        install()
    }
}

impl Drop for DispatchSubstrate {
    fn drop(&mut self) {
        self.release();
    }
}

impl Substrate for DispatchSubstrate {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn capabilities(&self) -> Capabilities {
        // Predicates would run arbitrary code in signal context.
        Capabilities {
            custom_eligibility: false,
        }
    }

    fn hook(&self, syscall: i64) -> Result<(), SubstrateError> {
        if !(0..MAX_SYSCALL).contains(&syscall) {
            return Err(SubstrateError::Unsupported(format!(
                "syscall {} is out of range",
                syscall
            )));
        }
        if UNHOOKABLE.contains(&syscall) {
            return Err(SubstrateError::Unsupported(format!(
                "syscall {} cannot be intercepted",
                syscall
            )));
        }
        set_hooked(syscall, true);
        Ok(())
    }

    fn unhook(&self, syscall: i64) {
        if (0..MAX_SYSCALL).contains(&syscall) {
            set_hooked(syscall, false);
        }
    }

    fn activate(&self, engine: Arc<DecisionEngine>) -> Result<(), SubstrateError> {
        if !self.claimed.load(Ordering::Acquire) {
            return Err(SubstrateError::Busy);
        }
        let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let routing = Box::into_raw(Box::new(Routing { session, engine }));
        if ROUTING
            .compare_exchange(ptr::null_mut(), routing, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // SAFETY: never published.
            drop(unsafe { Box::from_raw(routing) });
            return Err(SubstrateError::Busy);
        }
        debug!("routing activated for session {}", session);
        Ok(())
    }

    fn deactivate(&self) {
        let routing = ROUTING.swap(ptr::null_mut(), Ordering::SeqCst);
        if routing.is_null() {
            return;
        }
        let mut spins = 0u32;
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            spins = spins.wrapping_add(1);
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
        // SAFETY: withdrawn and drained; no handler can still see it.
        let routing = unsafe { Box::from_raw(routing) };
        debug!("routing deactivated for session {}", routing.session);
    }

    fn arm(&self, tid: Tid) -> Result<(), SubstrateError> {
        if tid == current_tid() {
            return self.arm_current();
        }
        let rc = handshake(tid, sig_arm(), "arm")?;
        check(rc, tid, "arm")
    }

    fn disarm(&self, tid: Tid) -> Result<(), SubstrateError> {
        if tid == current_tid() {
            return self.disarm_current();
        }
        match handshake(tid, sig_disarm(), "disarm") {
            Ok(rc) => check(rc, tid, "disarm"),
            Err(SubstrateError::NoSuchThread(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn arm_current(&self) -> Result<(), SubstrateError> {
        let tid = current_tid();
        if sigsys_blocked() {
            return Err(SubstrateError::SigsysBlocked(tid));
        }
        let rc = with_thread(|t| {
            let rc = t.arm();
            t.refresh();
            rc
        })
        .unwrap_or(-(libc::ESRCH as c_long));
        check(rc, tid, "arm")
    }

    fn disarm_current(&self) -> Result<(), SubstrateError> {
        let tid = current_tid();
        let rc = with_thread(|t| t.disarm()).unwrap_or(0);
        check(rc, tid, "disarm")
    }

    fn enter_control(&self) {
        with_thread(|t| t.enter_control());
    }

    fn leave_control(&self) {
        with_thread(|t| t.leave_control());
    }

    fn take_lapsed(&self) -> Vec<Tid> {
        drain_lapsed()
    }

    fn release(&self) {
        if !self.claimed.swap(false, Ordering::AcqRel) {
            return;
        }
        self.deactivate();
        clear_hooks();
        CLAIMED.store(false, Ordering::Release);
        debug!("dispatch substrate released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The statics are process-wide; tests touching them use syscall
    // numbers no other test hooks.

    #[test]
    fn hook_bitmap_tracks_bits() {
        set_hooked(300, true);
        set_hooked(301, true);
        assert!(is_hooked(300));
        assert!(is_hooked(301));
        set_hooked(300, false);
        assert!(!is_hooked(300));
        assert!(is_hooked(301));
        set_hooked(301, false);
    }

    #[test]
    fn out_of_range_is_never_hooked() {
        assert!(!is_hooked(-1));
        assert!(!is_hooked(MAX_SYSCALL));
        assert!(!is_hooked(i64::MAX));
    }

    #[test]
    fn lapsed_ring_dedups_and_drains() {
        push_lapsed(-77);
        push_lapsed(-77);
        push_lapsed(-78);
        let mut drained = drain_lapsed();
        drained.retain(|&tid| tid < 0);
        drained.sort_unstable();
        assert_eq!(drained, vec![-78, -77]);
    }

    #[test]
    fn routing_window_sees_nothing_when_inactive() {
        if !ROUTING.load(Ordering::SeqCst).is_null() {
            return;
        }
        assert!(with_routing(|routing| routing.is_none()));
    }

    #[test]
    fn queued_info_is_a_full_siginfo() {
        assert_eq!(std::mem::size_of::<QueuedInfo>(), 128);
        assert_eq!(
            std::mem::size_of::<QueuedInfo>(),
            std::mem::size_of::<libc::siginfo_t>()
        );
        assert_eq!(std::mem::size_of::<KernelSigaction>(), 32);
    }
}
