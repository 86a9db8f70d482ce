//! The exempt code region.
//!
//! Syscall user dispatch never intercepts a syscall whose instruction lies
//! inside the range registered with `prctl`.  Everything our handlers need
//! to issue regardless of the selector lives here: a raw six-argument
//! syscall entry and the `rt_sigreturn` restorer used by every handler we
//! install.

use std::arch::global_asm;
use std::os::raw::c_long;

global_asm!(
    ".pushsection .text.syschaos_exempt,\"ax\",@progbits",
    ".p2align 4",
    ".globl syschaos_exempt_start",
    ".hidden syschaos_exempt_start",
    "syschaos_exempt_start:",
    // fn(nr, a0, a1, a2, a3, a4, a5) -> c_long, SysV calling convention.
    ".globl syschaos_raw_syscall",
    ".hidden syschaos_raw_syscall",
    ".type syschaos_raw_syscall, @function",
    "syschaos_raw_syscall:",
    "    mov rax, rdi",
    "    mov rdi, rsi",
    "    mov rsi, rdx",
    "    mov rdx, rcx",
    "    mov r10, r8",
    "    mov r8, r9",
    "    mov r9, qword ptr [rsp + 8]",
    "    syscall",
    "    ret",
    ".size syschaos_raw_syscall, . - syschaos_raw_syscall",
    // Signal return.  Also the landing pad for redirected rt_sigreturn.
    ".globl syschaos_restore_rt",
    ".hidden syschaos_restore_rt",
    ".type syschaos_restore_rt, @function",
    "syschaos_restore_rt:",
    "    mov rax, 15",
    "    syscall",
    "    ud2",
    ".size syschaos_restore_rt, . - syschaos_restore_rt",
    ".globl syschaos_exempt_end",
    ".hidden syschaos_exempt_end",
    "syschaos_exempt_end:",
    ".popsection",
);

extern "C" {
    fn syschaos_raw_syscall(
        nr: c_long,
        a0: c_long,
        a1: c_long,
        a2: c_long,
        a3: c_long,
        a4: c_long,
        a5: c_long,
    ) -> c_long;
    fn syschaos_restore_rt();
    static syschaos_exempt_start: u8;
    static syschaos_exempt_end: u8;
}

/// Issue a syscall from the exempt region.
///
/// Returns the raw kernel result: a negative errno on failure.
///
/// # Safety
///
/// Same contract as the syscall itself.
#[inline]
pub(crate) unsafe fn raw_syscall(nr: c_long, args: [c_long; 6]) -> c_long {
    syschaos_raw_syscall(nr, args[0], args[1], args[2], args[3], args[4], args[5])
}

/// `[start, end)` of the exempt region.
pub(crate) fn exempt_range() -> (usize, usize) {
    // SAFETY: only the addresses of the labels are taken.
    unsafe {
        (
            std::ptr::addr_of!(syschaos_exempt_start) as usize,
            std::ptr::addr_of!(syschaos_exempt_end) as usize,
        )
    }
}

/// Address of the signal restorer.
pub(crate) fn restorer() -> usize {
    syschaos_restore_rt as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_covers_both_entry_points() {
        let (start, end) = exempt_range();
        assert!(start < end);
        let raw = syschaos_raw_syscall as *const () as usize;
        assert!((start..end).contains(&raw));
        assert!((start..end).contains(&restorer()));
    }

    #[test]
    fn raw_syscall_matches_libc() {
        // SAFETY: getpid and gettid take no arguments.
        unsafe {
            assert_eq!(
                raw_syscall(libc::SYS_getpid, [0; 6]),
                libc::getpid() as c_long
            );
            assert_eq!(raw_syscall(libc::SYS_gettid, [0; 6]), libc::gettid() as c_long);
        }
    }

    #[test]
    fn raw_syscall_returns_negative_errno() {
        // SAFETY: closing an invalid descriptor has no side effects.
        let rc = unsafe { raw_syscall(libc::SYS_close, [-1, 0, 0, 0, 0, 0]) };
        assert_eq!(rc, -(libc::EBADF as c_long));
    }

    #[test]
    fn sixth_argument_is_passed_on_the_stack() {
        // mmap takes its offset from the sixth argument; garbage there
        // fails with EINVAL.
        let len = 4096;
        // SAFETY: anonymous private mapping, unmapped below.
        let addr = unsafe {
            raw_syscall(
                libc::SYS_mmap,
                [
                    0,
                    len,
                    libc::PROT_READ as c_long,
                    (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as c_long,
                    -1,
                    0,
                ],
            )
        };
        assert!(addr > 0, "mmap failed: {}", addr);
        // SAFETY: the mapping was created above.
        let rc = unsafe { raw_syscall(libc::SYS_munmap, [addr, len, 0, 0, 0, 0]) };
        assert_eq!(rc, 0);
    }
}
