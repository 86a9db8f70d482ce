//! Signal handlers.
//!
//! Everything in this file runs in signal context on the interrupted
//! thread: no locks, no allocation, no logging.  Syscalls are issued
//! either through the exempt trampoline or while the thread's selector
//! says ALLOW.

use super::control::{
    is_hooked, previous_sigsys, push_lapsed, set_action, with_routing, Handshake,
    KernelSigaction, QueuedInfo, SI_QUEUE,
};
use super::thread::{with_thread, ThreadState};
use super::trampoline::{raw_syscall, restorer};
use super::{sig_arm, sig_disarm, sigbit};
use libc::{c_int, c_long, c_void, siginfo_t, ucontext_t};
use std::{mem, ptr, thread};
use syschaos_fault::engine::{Phase, Timing};
use syschaos_fault::outcome::{CallContext, SYSCALL_ARGS};

/// `si_code` of a dispatch-generated SIGSYS.
const SYS_USER_DISPATCH: c_int = 2;

const SS_AUTODISARM: c_int = 1 << 31;
const AT_MINSIGSTKSZ: libc::c_ulong = 51;

/// `syscall` instruction encoding.
const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

const ARG_REGS: [c_int; SYSCALL_ARGS] = [
    libc::REG_RDI,
    libc::REG_RSI,
    libc::REG_RDX,
    libc::REG_R10,
    libc::REG_R8,
    libc::REG_R9,
];

// ═══════════════════════════════════════════════════════════════════════
//  Saved context access
// ═══════════════════════════════════════════════════════════════════════

fn reg(uc: &ucontext_t, r: c_int) -> i64 {
    uc.uc_mcontext.gregs[r as usize]
}

fn set_reg(uc: &mut ucontext_t, r: c_int, value: i64) {
    uc.uc_mcontext.gregs[r as usize] = value;
}

fn call_args(uc: &ucontext_t) -> [u64; SYSCALL_ARGS] {
    ARG_REGS.map(|r| reg(uc, r) as u64)
}

/// The mask restored by `rt_sigreturn`.  The kernel uses one word.
fn saved_mask(uc: &mut ucontext_t) -> &mut u64 {
    // SAFETY: sigset_t is larger than and aligned at least as u64.
    unsafe { &mut *(&mut uc.uc_sigmask as *mut libc::sigset_t as *mut u64) }
}

fn errno() -> c_int {
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() }
}

fn set_errno(value: c_int) {
    // SAFETY: as above.
    unsafe { *libc::__errno_location() = value }
}

// ═══════════════════════════════════════════════════════════════════════
//  SIGSYS
// ═══════════════════════════════════════════════════════════════════════

pub(crate) extern "C" fn on_sigsys(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    // SAFETY: SA_SIGINFO handlers receive a valid siginfo.
    if unsafe { (*info).si_code } != SYS_USER_DISPATCH {
        chain_sigsys(sig, info, ctx);
        return;
    }
    let saved_errno = errno();
    // SAFETY: SA_SIGINFO handlers receive the interrupted ucontext.
    let uc = unsafe { &mut *(ctx as *mut ucontext_t) };

    let handled = with_thread(|t| {
        t.enter_handler();
        dispatch(t, uc);
        t.leave_handler(saved_mask(uc));
    });
    if handled.is_none() {
        let nr = reg(uc, libc::REG_RAX);
        let args = call_args(uc);
        complete(None, uc, nr, args);
    }
    set_errno(saved_errno);
}

fn dispatch(t: &ThreadState, uc: &mut ucontext_t) {
    let nr = reg(uc, libc::REG_RAX);
    if nr == libc::SYS_rt_sigreturn {
        // Our own frame returns into the restorer, which then performs
        // the program's sigreturn on the frame below.
        set_reg(uc, libc::REG_RIP, restorer() as i64);
        return;
    }
    let args = call_args(uc);
    if !is_hooked(nr) {
        complete(Some(t), uc, nr, args);
        return;
    }

    // Nothing can be applied after a natively re-executed call.
    let phase = if creates_thread(nr, &args) {
        Phase::EntryOnly
    } else {
        Phase::Entry
    };
    let call = CallContext::new(nr, args);
    let tid = t.tid();
    let verdict = with_routing(|routing| {
        let routing = routing?;
        let directive = routing.engine.decide(nr, tid, phase, &call);
        if let Some(delay) = directive.delay_at(Timing::Before) {
            thread::sleep(delay);
        }
        Some((directive, routing.session))
    });
    let Some((directive, session)) = verdict else {
        complete(Some(t), uc, nr, args);
        return;
    };

    if let Some(errno) = directive.failure_at(Timing::Before) {
        if let Some(delay) = directive.delay_at(Timing::After) {
            thread::sleep(delay);
        }
        set_reg(uc, libc::REG_RAX, -(errno as i64));
        return;
    }

    complete(Some(t), uc, nr, args);
    if !directive.has_after_effects() {
        return;
    }
    with_routing(|routing| {
        // Stopped (or replaced) while the real call ran.
        if routing.map(|r| r.session) != Some(session) {
            return;
        }
        if let Some(delay) = directive.delay_at(Timing::After) {
            thread::sleep(delay);
        }
        if let Some(errno) = directive.failure_at(Timing::After) {
            set_reg(uc, libc::REG_RAX, -(errno as i64));
        }
    });
}

/// Run the trapped call on the program's behalf and store its result.
fn complete(t: Option<&ThreadState>, uc: &mut ucontext_t, nr: i64, args: [u64; SYSCALL_ARGS]) {
    let ret = match nr {
        libc::SYS_rt_sigprocmask => emulate_sigprocmask(uc, &args),
        libc::SYS_sigaltstack => emulate_sigaltstack(uc, &args),
        // A vfork child would run on, and clobber, this very frame.
        // SAFETY: fork takes no arguments.
        libc::SYS_vfork => unsafe { raw_syscall(libc::SYS_fork, [0; 6]) },
        _ if creates_thread(nr, &args) => {
            reexecute(t, uc, nr);
            return;
        }
        // SAFETY: the program issued this call with these arguments.
        _ => unsafe { raw_syscall(nr, args.map(|a| a as c_long)) },
    };
    set_reg(uc, libc::REG_RAX, ret);
}

/// Calls whose child would start on another stack or share this frame.
fn creates_thread(nr: i64, args: &[u64; SYSCALL_ARGS]) -> bool {
    match nr {
        libc::SYS_clone3 => true,
        libc::SYS_clone => args[0] & libc::CLONE_VM as u64 != 0 || args[1] != 0,
        _ => false,
    }
}

/// Rewind to the syscall instruction so it runs natively once the
/// handler returns.  The thread lapses until it is re-armed.
fn reexecute(t: Option<&ThreadState>, uc: &mut ucontext_t, nr: i64) {
    let Some(t) = t else {
        set_reg(uc, libc::REG_RAX, -(libc::ENOSYS as i64));
        return;
    };
    let rip = reg(uc, libc::REG_RIP) as usize;
    // SAFETY: RIP points just past the trapping instruction, in mapped text.
    let insn = unsafe { ptr::read_unaligned(rip.wrapping_sub(2) as *const [u8; 2]) };
    if insn != SYSCALL_INSN {
        set_reg(uc, libc::REG_RAX, -(libc::ENOSYS as i64));
        return;
    }
    set_reg(uc, libc::REG_RIP, (rip - 2) as i64);
    set_reg(uc, libc::REG_RAX, nr);
    t.lapse();
    push_lapsed(t.tid());
}

/// `rt_sigprocmask` against the mask `rt_sigreturn` will restore.
///
/// A bad pointer faults here where the kernel would return EFAULT.
fn emulate_sigprocmask(uc: &mut ucontext_t, args: &[u64; SYSCALL_ARGS]) -> i64 {
    let [how, set, oldset, size, ..] = *args;
    if size != 8 {
        return -(libc::EINVAL as i64);
    }
    let mask = saved_mask(uc);
    let old = *mask;
    if set != 0 {
        // SAFETY: the program passed a sigset pointer.
        let set = unsafe { ptr::read_unaligned(set as *const u64) };
        let next = match how as c_int {
            libc::SIG_BLOCK => old | set,
            libc::SIG_UNBLOCK => old & !set,
            libc::SIG_SETMASK => set,
            _ => return -(libc::EINVAL as i64),
        };
        *mask = next & !(sigbit(libc::SIGKILL) | sigbit(libc::SIGSTOP));
    }
    if oldset != 0 {
        // SAFETY: the program passed a sigset pointer.
        unsafe { ptr::write_unaligned(oldset as *mut u64, old) };
    }
    0
}

/// `sigaltstack` against the stack `rt_sigreturn` will restore.
fn emulate_sigaltstack(uc: &mut ucontext_t, args: &[u64; SYSCALL_ARGS]) -> i64 {
    let (new, old) = (args[0], args[1]);
    let current = uc.uc_stack;
    if new != 0 {
        if current.ss_flags & libc::SS_ONSTACK != 0 {
            return -(libc::EPERM as i64);
        }
        // SAFETY: the program passed a stack_t pointer.
        let ss = unsafe { ptr::read_unaligned(new as *const libc::stack_t) };
        uc.uc_stack = match ss.ss_flags & !SS_AUTODISARM {
            libc::SS_DISABLE => libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: ss.ss_flags,
                ss_size: 0,
            },
            0 | libc::SS_ONSTACK => {
                if ss.ss_size < min_stack_size() {
                    return -(libc::ENOMEM as i64);
                }
                ss
            }
            _ => return -(libc::EINVAL as i64),
        };
    }
    if old != 0 {
        // SAFETY: the program passed a stack_t pointer.
        unsafe { ptr::write_unaligned(old as *mut libc::stack_t, current) };
    }
    0
}

fn min_stack_size() -> usize {
    // SAFETY: getauxval only reads the auxiliary vector.
    let aux = unsafe { libc::getauxval(AT_MINSIGSTKSZ) } as usize;
    aux.max(libc::MINSIGSTKSZ)
}

/// A SIGSYS that dispatch did not generate goes wherever it went before
/// we were installed.
fn chain_sigsys(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let prev = previous_sigsys()
        .copied()
        .unwrap_or(KernelSigaction::default_action());
    match prev.handler {
        libc::SIG_IGN => {}
        libc::SIG_DFL => {
            // SAFETY: restoring the default action and re-raising; the
            // default action terminates the process.
            unsafe {
                let _ = set_action(sig, &KernelSigaction::default_action());
                let pid = raw_syscall(libc::SYS_getpid, [0; 6]);
                let tid = raw_syscall(libc::SYS_gettid, [0; 6]);
                raw_syscall(libc::SYS_tgkill, [pid, tid, sig as c_long, 0, 0, 0]);
            }
        }
        handler if prev.flags & libc::SA_SIGINFO as libc::c_ulong != 0 => {
            // SAFETY: installed as an SA_SIGINFO handler.
            let f: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                unsafe { mem::transmute(handler) };
            f(sig, info, ctx);
        }
        handler => {
            // SAFETY: installed as a plain handler.
            let f: extern "C" fn(c_int) = unsafe { mem::transmute(handler) };
            f(sig);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Control signals
// ═══════════════════════════════════════════════════════════════════════

/// Arm, disarm or rearm the receiving thread.
///
/// Arm and disarm arrive queued with a [`Handshake`] pointer; rearm is a
/// plain `tgkill` from the thread itself.
pub(crate) extern "C" fn on_control(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let saved_errno = errno();
    // SAFETY: SA_SIGINFO handlers receive the interrupted ucontext.
    let uc = unsafe { &mut *(ctx as *mut ucontext_t) };
    // SAFETY: every siginfo is at least as large as QueuedInfo.
    let queued = unsafe { &*(info as *const QueuedInfo) };
    // SAFETY: getpid takes no arguments.
    let pid = unsafe { raw_syscall(libc::SYS_getpid, [0; 6]) } as c_int;
    let handshake = (queued.code == SI_QUEUE && queued.pid == pid && queued.value != 0)
        .then_some(queued.value as *const Handshake);

    let result = with_thread(|t| {
        t.enter_handler();
        let rc = if sig == sig_arm() {
            t.arm()
        } else if sig == sig_disarm() {
            t.disarm()
        } else {
            t.resume();
            0
        };
        t.leave_handler(saved_mask(uc));
        rc
    })
    .unwrap_or(-(libc::ESRCH as c_long));

    if let Some(handshake) = handshake {
        // SAFETY: the controller keeps the handshake alive until it is
        // completed, or leaks it.
        unsafe { (*handshake).complete(result) };
    }
    set_errno(saved_errno);
}
