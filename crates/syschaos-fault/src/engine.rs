//! Decision engine: the per-call verdict.
//!
//! A [`DecisionEngine`] is compiled once from a [`Plan`] into a dense table
//! indexed by syscall number.  Interception substrates call
//! [`DecisionEngine::decide`] for every intercepted call and apply the
//! returned [`Directive`].
//!
//! `decide` is the hot path.  It takes no locks, never allocates and never
//! panics, so it may run inside a signal handler.  Each thread draws from
//! its own ChaCha20 stream held in a constant-initialised thread-local;
//! the stream is keyed by the engine seed and the thread id, so a fixed
//! seed reproduces each thread's decisions.

use crate::outcome::{CallContext, Eligibility, Errno, Outcome, Probability};
use crate::plan::{Plan, ValidationError};
use crate::stats::SessionStats;
use log::debug;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::cell::RefCell;
use std::collections::TryReserveError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// OS thread id.
pub type Tid = i32;

/// Errors compiling a plan into an engine.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("out of memory while compiling outcome tables")]
    Allocation(#[from] TryReserveError),
}

/// Where the substrate observed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the real syscall runs.  Full decision.
    Entry,
    /// Before a real syscall that nothing can follow, such as one
    /// re-executed natively.  Every effect is placed before.
    EntryOnly,
    /// After the real syscall completed.  Every effect is placed after.
    Exit,
}

/// Placement of an effect relative to the real syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    Before,
    After,
}

/// Verdict for one intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    PassThrough,
    FailWith {
        errno: Errno,
        timing: Timing,
    },
    DelayBy {
        usec: u64,
        timing: Timing,
    },
    DelayThenFailWith {
        usec: u64,
        delay_timing: Timing,
        errno: Errno,
        fail_timing: Timing,
    },
}

impl Directive {
    /// Delay to apply at `timing`, if any.
    pub fn delay_at(&self, timing: Timing) -> Option<Duration> {
        match *self {
            Directive::DelayBy { usec, timing: t }
            | Directive::DelayThenFailWith {
                usec,
                delay_timing: t,
                ..
            } if t == timing => Some(Duration::from_micros(usec)),
            _ => None,
        }
    }

    /// Errno to report at `timing`, if any.
    pub fn failure_at(&self, timing: Timing) -> Option<Errno> {
        match *self {
            Directive::FailWith { errno, timing: t }
            | Directive::DelayThenFailWith {
                errno,
                fail_timing: t,
                ..
            } if t == timing => Some(errno),
            _ => None,
        }
    }

    /// Whether the real syscall must not run.
    pub fn suppresses_call(&self) -> bool {
        self.failure_at(Timing::Before).is_some()
    }

    /// Whether anything remains to do once the real call returns.
    pub fn has_after_effects(&self) -> bool {
        self.delay_at(Timing::After).is_some() || self.failure_at(Timing::After).is_some()
    }

    /// Move every effect to `timing`.
    pub fn placed(self, timing: Timing) -> Self {
        match self {
            Directive::PassThrough => Directive::PassThrough,
            Directive::FailWith { errno, .. } => Directive::FailWith { errno, timing },
            Directive::DelayBy { usec, .. } => Directive::DelayBy { usec, timing },
            Directive::DelayThenFailWith { usec, errno, .. } => Directive::DelayThenFailWith {
                usec,
                delay_timing: timing,
                errno,
                fail_timing: timing,
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Compiled tables
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct CompiledOutcome {
    fail: Probability,
    delay: Probability,
    max_delay_usec: u32,
    eligibility: Eligibility,
    /// Running weight totals paired with their errno, in plan order.
    cumulative: Vec<(f64, Errno)>,
    total: f64,
}

impl CompiledOutcome {
    fn compile(outcome: &Outcome) -> Result<Self, TryReserveError> {
        let mut cumulative = Vec::new();
        cumulative.try_reserve_exact(outcome.errors.len())?;
        let mut total = 0.0;
        for ew in &outcome.errors {
            total += ew.weight;
            cumulative.push((total, ew.errno));
        }
        Ok(Self {
            fail: outcome.fail,
            delay: outcome.delay,
            max_delay_usec: outcome.max_delay_usec,
            eligibility: outcome.eligibility.clone(),
            cumulative,
            total,
        })
    }

    /// First entry whose cumulative weight exceeds a draw in `[0, total)`.
    fn pick_errno<R: RngCore + ?Sized>(&self, rng: &mut R) -> Option<Errno> {
        if !(self.total.is_finite() && self.total > 0.0) {
            return None;
        }
        let draw = rng.gen_range(0.0..self.total);
        self.cumulative
            .iter()
            .find(|(cum, _)| *cum > draw)
            .map(|(_, errno)| *errno)
    }
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread generator, rekeyed whenever a different engine uses it.
struct ThreadStream {
    engine: u64,
    rng: ChaCha20Rng,
}

thread_local! {
    // No destructor and no lazy initialiser: readable from signal context.
    static STREAM: RefCell<Option<ThreadStream>> = const { RefCell::new(None) };
}

/// The compiled decision engine for one session.
///
/// # Example
///
/// ```
/// use syschaos_fault::engine::{DecisionEngine, Directive, Phase, Timing};
/// use syschaos_fault::outcome::{CallContext, Outcome};
/// use syschaos_fault::plan::PlanBuilder;
///
/// let plan = PlanBuilder::new()
///     .seed(1)
///     .outcome(1, Outcome::failing(1.0, 5))
///     .build()
///     .unwrap();
/// let engine = DecisionEngine::compile(&plan).unwrap();
///
/// let call = CallContext::new(1, [3, 0, 0, 0, 0, 0]);
/// let directive = engine.decide(1, 1234, Phase::Entry, &call);
/// assert_eq!(directive, Directive::FailWith { errno: 5, timing: Timing::Before });
/// ```
#[derive(Debug)]
pub struct DecisionEngine {
    id: u64,
    seed: u64,
    table: Vec<Option<CompiledOutcome>>,
    stats: SessionStats,
}

impl DecisionEngine {
    /// Validate `plan` and compile its outcome tables.
    pub fn compile(plan: &Plan) -> Result<Self, CompileError> {
        plan.validate()?;

        let len = plan.syscalls().max().map_or(0, |max| max as usize + 1);
        let mut table = Vec::new();
        table.try_reserve_exact(len)?;
        table.resize_with(len, || None);
        for so in plan.syscall_outcomes() {
            table[so.syscall as usize] = Some(CompiledOutcome::compile(&so.outcome)?);
        }

        let seed = plan.seed().unwrap_or_else(rand::random);
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "engine {}: compiled {} outcome(s), seed {}",
            id,
            plan.syscall_outcomes().len(),
            seed
        );

        Ok(Self {
            id,
            seed,
            table,
            stats: SessionStats::new(),
        })
    }

    /// Unique id of this engine within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Seed in effect (fixed by the plan or drawn at compile time).
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Whether `syscall` has a configured outcome.
    pub fn is_configured(&self, syscall: i64) -> bool {
        self.lookup(syscall).is_some()
    }

    /// Decide the fate of one call, drawing from the calling thread's
    /// stream.
    ///
    /// Never fails: anything unexpected yields [`Directive::PassThrough`]
    /// and is counted in `decision_faults`.
    pub fn decide(&self, syscall: i64, tid: Tid, phase: Phase, call: &CallContext) -> Directive {
        let decided = STREAM.try_with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            if slot.as_ref().map_or(true, |s| s.engine != self.id) {
                *slot = Some(ThreadStream {
                    engine: self.id,
                    rng: stream_for(self.seed, tid),
                });
            }
            let stream = slot.as_mut()?;
            Some(self.decide_with(&mut stream.rng, syscall, phase, call))
        });
        match decided {
            Ok(Some(directive)) => directive,
            _ => {
                self.stats.record_fault();
                Directive::PassThrough
            }
        }
    }

    /// Like [`decide`](Self::decide) with an explicit generator.
    pub fn decide_with<R: RngCore + ?Sized>(
        &self,
        rng: &mut R,
        syscall: i64,
        phase: Phase,
        call: &CallContext,
    ) -> Directive {
        let Some(compiled) = self.lookup(syscall) else {
            return Directive::PassThrough;
        };
        self.stats.record_intercepted();

        if !compiled.eligibility.admits(call) {
            self.stats.record_ineligible();
            return Directive::PassThrough;
        }

        let mut fail = None;
        if triggers(rng, &compiled.fail) && !compiled.cumulative.is_empty() {
            match compiled.pick_errno(rng) {
                Some(errno) => fail = Some((errno, placement(rng, &compiled.fail))),
                None => {
                    self.stats.record_fault();
                    return Directive::PassThrough;
                }
            }
        }

        let mut delay = None;
        if triggers(rng, &compiled.delay) {
            let usec = rng.gen_range(0..=compiled.max_delay_usec as u64);
            delay = Some((usec, placement(rng, &compiled.delay)));
        }

        let directive = match (delay, fail) {
            (None, None) => Directive::PassThrough,
            (None, Some((errno, timing))) => Directive::FailWith { errno, timing },
            (Some((usec, timing)), None) => Directive::DelayBy { usec, timing },
            (Some((usec, delay_timing)), Some((errno, fail_timing))) => {
                Directive::DelayThenFailWith {
                    usec,
                    delay_timing,
                    errno,
                    fail_timing,
                }
            }
        };
        let directive = match phase {
            Phase::Entry => directive,
            Phase::EntryOnly => directive.placed(Timing::Before),
            Phase::Exit => directive.placed(Timing::After),
        };

        for t in [Timing::Before, Timing::After] {
            let after = t == Timing::After;
            if directive.failure_at(t).is_some() {
                self.stats.record_failure(after);
            }
            if directive.delay_at(t).is_some() {
                self.stats.record_delay(after);
            }
        }
        directive
    }

    fn lookup(&self, syscall: i64) -> Option<&CompiledOutcome> {
        usize::try_from(syscall)
            .ok()
            .and_then(|nr| self.table.get(nr))
            .and_then(Option::as_ref)
    }
}

fn triggers<R: RngCore + ?Sized>(rng: &mut R, prob: &Probability) -> bool {
    prob.p > 0.0 && rng.gen::<f64>() < prob.p
}

fn placement<R: RngCore + ?Sized>(rng: &mut R, prob: &Probability) -> Timing {
    if prob.after_bias >= 1.0 || (prob.after_bias > 0.0 && rng.gen::<f64>() < prob.after_bias) {
        Timing::After
    } else {
        Timing::Before
    }
}

/// Deterministic generator for `(seed, tid)`.
pub fn stream_for(seed: u64, tid: Tid) -> ChaCha20Rng {
    let mut rng = rng_from_seed(seed);
    rng.set_stream(tid as u32 as u64);
    rng
}

fn rng_from_seed(seed: u64) -> ChaCha20Rng {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    ChaCha20Rng::from_seed(key)
}
