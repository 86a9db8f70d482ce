//! Plan model and decision engine for syscall fault injection.
//!
//! This crate is the pure, platform-independent half of syschaos:
//!
//! 1. **[`outcome`]**: per-syscall failure/delay behaviour and eligibility
//! 2. **[`plan`]**: validated, immutable injection plans and their builder
//! 3. **[`engine`]**: compiles a plan and decides the fate of each call
//! 4. **[`stats`]**: session-level counters
//!
//! # Architecture
//!
//! ```text
//! Client                 Session controller        Substrate (per call)
//! ──────                 ──────────────────        ────────────────────
//! PlanBuilder::build ──→ DecisionEngine::compile
//!                                                  intercept syscall
//!                                                  engine.decide() ──→ Directive
//!                                                  apply delay / errno
//! ```

pub mod engine;
pub mod outcome;
pub mod plan;
pub mod stats;

pub use engine::{DecisionEngine, Directive, Phase, Tid, Timing};
pub use outcome::{CallContext, Eligibility, Errno, ErrorWeight, Outcome, Probability};
pub use plan::{Plan, PlanBuilder, ThreadDiscovery, ValidationError};
pub use stats::Stats;
