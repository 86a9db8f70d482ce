//! In-process syscall fault injection.
//!
//! syschaos makes chosen syscalls, on chosen threads of the running
//! process, fail with synthetic errors or stall for a while, without
//! touching the code under test.  It exists to exercise retry logic, error
//! propagation and idempotency under partial failure.
//!
//! # Architecture
//!
//! ```text
//! Plan (syschaos-fault)
//!   │
//!   ▼
//! Session::start ──→ DecisionEngine::compile
//!   │                 Substrate::hook(nr)*  ──→ activate(engine)
//!   │                 ThreadRegistry (+ discovery Poller)
//!   ▼
//! member thread ── syscall ──→ Substrate ──→ engine.decide() ──→ Directive
//!                                            delay / errno / pass through
//! ```
//!
//! - [`session`]: start/stop lifecycle and membership operations
//! - [`registry`]: the authoritative member set
//! - [`discovery`]: `/proc/self/task` scans and the background poller
//! - [`config`]: `SYSCHAOS_*` environment conventions for test harnesses
//! - [`error`]: error types
//!
//! The plan model and engine live in `syschaos-fault`, the interception
//! substrates in `syschaos-dispatch`; both are re-exported here.

pub mod config;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod session;

pub use config::HarnessConfig;
pub use error::{ConfigError, SessionError, StartError};
pub use registry::{Origin, ThreadRecord, ThreadRegistry};
pub use session::{Session, SessionState};

pub use syschaos_dispatch::{DispatchSubstrate, LoopbackSubstrate, Substrate, SubstrateError};
pub use syschaos_fault::{
    CallContext, Eligibility, Errno, ErrorWeight, Outcome, Plan, PlanBuilder, Probability, Stats,
    ThreadDiscovery, ValidationError,
};
