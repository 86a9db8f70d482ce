//! Per-thread dispatch state.
//!
//! The kernel reads the selector byte on every syscall of an armed thread.
//! It must say BLOCK only while the thread is armed, not suspended, not
//! running one of our handlers and not shielded by the control path; in
//! every other case it says ALLOW.
//!
//! A thread is *suspended* while its signal mask blocks SIGSYS (a blocked
//! forced SIGSYS kills the process) or after a thread-creating syscall was
//! re-executed natively.  Suspension is lifted by the rearm signal, which
//! is queued and masked together with SIGSYS so it arrives once the
//! program unblocks signals.

use super::trampoline::{exempt_range, raw_syscall};
use super::{sig_rearm, sigbit};
use std::os::raw::c_long;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};

const PR_SET_SYSCALL_USER_DISPATCH: c_long = 59;
const PR_SYS_DISPATCH_OFF: c_long = 0;
const PR_SYS_DISPATCH_ON: c_long = 1;

const FILTER_ALLOW: u8 = 0;
const FILTER_BLOCK: u8 = 1;

pub(crate) struct ThreadState {
    selector: AtomicU8,
    armed: AtomicBool,
    suspended: AtomicBool,
    rearm_pending: AtomicBool,
    /// Our handlers currently running on this thread.
    depth: AtomicU32,
    /// Nested control-path sections.
    shield: AtomicU32,
    tid: AtomicI32,
}

thread_local! {
    // Constant-initialised and without a destructor, so it is usable from
    // signal context and during thread teardown.
    static THREAD: ThreadState = const { ThreadState::new() };
}

/// Run `f` against the calling thread's state.
pub(crate) fn with_thread<R>(f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
    THREAD.try_with(f).ok()
}

impl ThreadState {
    const fn new() -> Self {
        Self {
            selector: AtomicU8::new(FILTER_ALLOW),
            armed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            rearm_pending: AtomicBool::new(false),
            depth: AtomicU32::new(0),
            shield: AtomicU32::new(0),
            tid: AtomicI32::new(0),
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Kernel tid, cached at arm time.
    pub(crate) fn tid(&self) -> i32 {
        match self.tid.load(Ordering::Relaxed) {
            0 => {
                // SAFETY: gettid has no arguments.
                let tid = unsafe { raw_syscall(libc::SYS_gettid, [0; 6]) } as i32;
                self.tid.store(tid, Ordering::Relaxed);
                tid
            }
            tid => tid,
        }
    }

    /// Recompute the selector from the flags.
    pub(crate) fn refresh(&self) {
        let block = self.armed.load(Ordering::SeqCst)
            && !self.suspended.load(Ordering::SeqCst)
            && self.depth.load(Ordering::SeqCst) == 0
            && self.shield.load(Ordering::SeqCst) == 0;
        self.selector.store(
            if block { FILTER_BLOCK } else { FILTER_ALLOW },
            Ordering::SeqCst,
        );
    }

    /// First thing every handler does: nothing it runs may trap.
    pub(crate) fn enter_handler(&self) {
        self.selector.store(FILTER_ALLOW, Ordering::SeqCst);
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    /// Last thing every handler does.  `mask` is the signal mask that
    /// will be restored when the handler returns.
    pub(crate) fn leave_handler(&self, mask: &mut u64) {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if depth == 0 && self.is_armed() && *mask & sigbit(libc::SIGSYS) != 0 {
            self.suspended.store(true, Ordering::SeqCst);
            self.schedule_rearm(mask);
        }
        self.refresh();
    }

    fn schedule_rearm(&self, mask: &mut u64) {
        let sig = sig_rearm();
        *mask |= sigbit(sig);
        if !self.rearm_pending.swap(true, Ordering::SeqCst) {
            let block = sigbit(sig);
            // SAFETY: blocking first keeps the signal pending instead of
            // delivering it inside this handler; tgkill targets ourselves
            // with a signal we handle.
            unsafe {
                raw_syscall(
                    libc::SYS_rt_sigprocmask,
                    [
                        libc::SIG_BLOCK as c_long,
                        &block as *const u64 as c_long,
                        0,
                        8,
                        0,
                        0,
                    ],
                );
                let pid = raw_syscall(libc::SYS_getpid, [0; 6]);
                raw_syscall(
                    libc::SYS_tgkill,
                    [pid, self.tid() as c_long, sig as c_long, 0, 0, 0],
                );
            }
        }
    }

    /// Turn dispatch on for this thread.  Returns 0 or a negative errno.
    ///
    /// The selector is left as is; callers refresh it (directly, or when
    /// the enclosing handler returns).
    pub(crate) fn arm(&self) -> c_long {
        let (start, end) = exempt_range();
        let selector = self.selector.as_ptr() as c_long;
        self.tid();
        // SAFETY: the selector lives in this thread's TLS for as long as
        // the thread does, and the range covers our own text.
        let rc = unsafe {
            raw_syscall(
                libc::SYS_prctl,
                [
                    PR_SET_SYSCALL_USER_DISPATCH,
                    PR_SYS_DISPATCH_ON,
                    start as c_long,
                    (end - start) as c_long,
                    selector,
                    0,
                ],
            )
        };
        if rc == 0 {
            self.armed.store(true, Ordering::SeqCst);
            self.suspended.store(false, Ordering::SeqCst);
        }
        rc
    }

    /// Turn dispatch off for this thread.  Returns 0 or a negative errno.
    pub(crate) fn disarm(&self) -> c_long {
        self.armed.store(false, Ordering::SeqCst);
        self.suspended.store(false, Ordering::SeqCst);
        self.selector.store(FILTER_ALLOW, Ordering::SeqCst);
        // SAFETY: disabling dispatch takes no pointers.
        unsafe {
            raw_syscall(
                libc::SYS_prctl,
                [
                    PR_SET_SYSCALL_USER_DISPATCH,
                    PR_SYS_DISPATCH_OFF,
                    0,
                    0,
                    0,
                    0,
                ],
            )
        }
    }

    /// Lift a suspension.  [`leave_handler`](Self::leave_handler)
    /// re-suspends if SIGSYS is still blocked.
    pub(crate) fn resume(&self) {
        self.rearm_pending.store(false, Ordering::SeqCst);
        self.suspended.store(false, Ordering::SeqCst);
    }

    /// Suspend after a native re-execution.
    pub(crate) fn lapse(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub(crate) fn enter_control(&self) {
        self.shield.fetch_add(1, Ordering::SeqCst);
        self.refresh();
    }

    pub(crate) fn leave_control(&self) {
        let _ = self
            .shield
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| s.checked_sub(1));
        self.refresh();
    }

    #[cfg(test)]
    pub(crate) fn selector_blocks(&self) -> bool {
        self.selector.load(Ordering::SeqCst) == FILTER_BLOCK
    }
}
