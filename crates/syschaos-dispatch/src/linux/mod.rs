//! Syscall user dispatch substrate (Linux, x86_64).
//!
//! ```text
//! armed thread ── syscall ──→ kernel: selector == BLOCK?
//!                                │ yes
//!                                ▼
//!                     SIGSYS (SYS_USER_DISPATCH)
//!                                │
//!        handler::on_sigsys: selector := ALLOW
//!          hooked? ── engine.decide() ── delay / errno / run natively
//!          selector := refresh()  ──→  rt_sigreturn via the exempt restorer
//! ```
//!
//! - [`trampoline`]: exempt code region (raw syscall, signal restorer)
//! - [`thread`]: per-thread selector and flags
//! - [`control`]: process-wide state, handler installation, cross-thread
//!   arm/disarm handshakes, [`DispatchSubstrate`]
//! - [`handler`]: the SIGSYS and control-signal handlers

mod control;
mod handler;
mod thread;
mod trampoline;

pub use control::DispatchSubstrate;

use std::sync::atomic::{AtomicI32, Ordering};

/// Real-time signals used by the control path, offset from SIGRTMIN.
const ARM_OFFSET: i32 = 4;
const DISARM_OFFSET: i32 = 5;
const REARM_OFFSET: i32 = 6;

static SIG_ARM: AtomicI32 = AtomicI32::new(0);
static SIG_DISARM: AtomicI32 = AtomicI32::new(0);
static SIG_REARM: AtomicI32 = AtomicI32::new(0);

/// Resolve the control signal numbers.  Idempotent.
fn assign_signals() {
    let base = libc::SIGRTMIN();
    SIG_ARM.store(base + ARM_OFFSET, Ordering::Relaxed);
    SIG_DISARM.store(base + DISARM_OFFSET, Ordering::Relaxed);
    SIG_REARM.store(base + REARM_OFFSET, Ordering::Relaxed);
}

fn sig_arm() -> i32 {
    SIG_ARM.load(Ordering::Relaxed)
}

fn sig_disarm() -> i32 {
    SIG_DISARM.load(Ordering::Relaxed)
}

fn sig_rearm() -> i32 {
    SIG_REARM.load(Ordering::Relaxed)
}

/// Bit for `sig` in a kernel signal mask.
fn sigbit(sig: i32) -> u64 {
    1u64 << (sig - 1)
}

/// Mask with every control signal.
fn control_mask() -> u64 {
    sigbit(sig_arm()) | sigbit(sig_disarm()) | sigbit(sig_rearm())
}
