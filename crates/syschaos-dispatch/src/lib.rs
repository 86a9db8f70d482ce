//! Syscall interception substrates for syschaos.
//!
//! A [`Substrate`] intercepts the syscalls a session hooks, on the threads
//! it arms, and applies the verdicts of a
//! [`DecisionEngine`](syschaos_fault::DecisionEngine):
//!
//! - [`DispatchSubstrate`]: Linux x86_64, built on
//!   `PR_SET_SYSCALL_USER_DISPATCH` (kernel 5.11+).  Intercepts real
//!   syscalls made anywhere in the process, libc included.
//! - [`LoopbackSubstrate`]: portable; calls are routed explicitly through
//!   [`LoopbackSubstrate::invoke`].

pub mod loopback;
pub mod substrate;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux::DispatchSubstrate;

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod unsupported;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub use unsupported::DispatchSubstrate;

pub use loopback::LoopbackSubstrate;
pub use substrate::{current_tid, thread_exists, Capabilities, ControlGuard, Substrate, SubstrateError};
