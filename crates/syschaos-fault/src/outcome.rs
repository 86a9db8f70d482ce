//! Per-syscall outcome definitions.
//!
//! An [`Outcome`] describes everything that may happen to one syscall while
//! a session is running: how likely it is to fail, how likely it is to be
//! delayed, which errno values it fails with, and which individual call
//! instances qualify at all ([`Eligibility`]).
//!
//! All types here are plain data.  Range checks live in
//! [`Plan`](crate::plan::Plan) validation so a bad value is reported with
//! the full path of the offending field.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A positive errno value, e.g. `libc::EIO`.
pub type Errno = i32;

/// Largest errno the kernel ABI can return (`-4095..=-1`).
pub const MAX_ERRNO: Errno = 4095;

/// Number of argument registers carried by a syscall.
pub const SYSCALL_ARGS: usize = 6;

// ═══════════════════════════════════════════════════════════════════════
//  Probability
// ═══════════════════════════════════════════════════════════════════════

/// Chance of an event together with its placement relative to the real
/// syscall.
///
/// `after_bias` is the probability that a triggered effect lands *after*
/// the real call has executed.  `0.0` always places it before (the call is
/// suppressed or delayed up front), `1.0` always after.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Probability {
    /// Probability that the effect triggers, in `[0, 1]`.
    pub p: f64,
    /// Probability that a triggered effect is placed after the syscall.
    #[serde(default)]
    pub after_bias: f64,
}

impl Probability {
    /// An effect that never triggers.
    pub const NEVER: Probability = Probability {
        p: 0.0,
        after_bias: 0.0,
    };

    /// An effect that triggers with probability `p`, always before the call.
    pub fn new(p: f64) -> Self {
        Self { p, after_bias: 0.0 }
    }

    /// Set the after-bias.
    pub fn with_after_bias(mut self, after_bias: f64) -> Self {
        self.after_bias = after_bias;
        self
    }

    /// Whether this effect can ever trigger.
    pub fn is_active(&self) -> bool {
        self.p > 0.0
    }
}

impl Default for Probability {
    fn default() -> Self {
        Self::NEVER
    }
}

/// One candidate synthetic error and its relative weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorWeight {
    pub errno: Errno,
    pub weight: f64,
}

impl ErrorWeight {
    pub fn new(errno: Errno, weight: f64) -> Self {
        Self { errno, weight }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Call context & eligibility
// ═══════════════════════════════════════════════════════════════════════

/// Register-level view of one intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallContext {
    /// Syscall number.
    pub nr: i64,
    /// Raw argument registers in ABI order.
    pub args: [u64; SYSCALL_ARGS],
}

impl CallContext {
    pub fn new(nr: i64, args: [u64; SYSCALL_ARGS]) -> Self {
        Self { nr, args }
    }

    /// The first argument read as a file descriptor.
    ///
    /// Truncates to `i32` the way the kernel does, so `AT_FDCWD` and other
    /// negative sentinels come back negative.
    pub fn fd(&self) -> i32 {
        self.args[0] as i32
    }
}

/// Set of standard descriptors (stdin, stdout, stderr).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StdioSet {
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
}

impl StdioSet {
    pub const NONE: StdioSet = StdioSet {
        stdin: false,
        stdout: false,
        stderr: false,
    };

    pub const ALL: StdioSet = StdioSet {
        stdin: true,
        stdout: true,
        stderr: true,
    };

    /// Whether `fd` is one of the standard descriptors in this set.
    pub fn contains(&self, fd: i32) -> bool {
        match fd {
            0 => self.stdin,
            1 => self.stdout,
            2 => self.stderr,
            _ => false,
        }
    }
}

/// A caller-supplied eligibility check.
///
/// Implemented for every `Fn(&CallContext) -> bool + Send + Sync`, so a
/// closure can be passed directly to [`CallPredicate::new`].
pub trait EligibilityCheck: Send + Sync {
    fn is_eligible(&self, call: &CallContext) -> bool;
}

impl<F> EligibilityCheck for F
where
    F: Fn(&CallContext) -> bool + Send + Sync,
{
    fn is_eligible(&self, call: &CallContext) -> bool {
        self(call)
    }
}

/// Shared handle to an [`EligibilityCheck`].
///
/// Any state the predicate needs is captured by the check itself.
#[derive(Clone)]
pub struct CallPredicate(Arc<dyn EligibilityCheck>);

impl CallPredicate {
    pub fn new(check: impl EligibilityCheck + 'static) -> Self {
        Self(Arc::new(check))
    }

    pub fn is_eligible(&self, call: &CallContext) -> bool {
        self.0.is_eligible(call)
    }
}

impl fmt::Debug for CallPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallPredicate(..)")
    }
}

/// Which call instances of a syscall qualify for injection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Eligibility {
    /// Every call qualifies.
    #[default]
    Always,
    /// Calls whose descriptor argument is not one of the listed standard
    /// descriptors.
    DescriptorExcluding {
        #[serde(default)]
        excluded: StdioSet,
    },
    /// Calls whose descriptor argument is not stdin, stdout or stderr.
    DescriptorNotStd,
    /// Calls accepted by a caller-supplied predicate.
    ///
    /// Only substrates that can run arbitrary code at interception time
    /// accept this variant.
    #[serde(skip)]
    Custom(CallPredicate),
}

impl Eligibility {
    /// Shorthand for [`Eligibility::Custom`].
    pub fn custom(check: impl EligibilityCheck + 'static) -> Self {
        Eligibility::Custom(CallPredicate::new(check))
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Eligibility::Custom(_))
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Eligibility::Always => "always",
            Eligibility::DescriptorExcluding { .. } => "descriptor-excluding",
            Eligibility::DescriptorNotStd => "descriptor-not-std",
            Eligibility::Custom(_) => "custom",
        }
    }

    /// Evaluate against one call.
    pub fn admits(&self, call: &CallContext) -> bool {
        match self {
            Eligibility::Always => true,
            Eligibility::DescriptorExcluding { excluded } => !excluded.contains(call.fd()),
            Eligibility::DescriptorNotStd => !StdioSet::ALL.contains(call.fd()),
            Eligibility::Custom(predicate) => predicate.is_eligible(call),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Outcome
// ═══════════════════════════════════════════════════════════════════════

/// Failure and delay behaviour for one syscall.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    /// Chance of failing the call with one of `errors`.
    #[serde(default)]
    pub fail: Probability,
    /// Chance of delaying the call.
    #[serde(default)]
    pub delay: Probability,
    /// Upper bound for a sampled delay (microseconds, inclusive).
    #[serde(default)]
    pub max_delay_usec: u32,
    #[serde(default)]
    pub eligibility: Eligibility,
    /// Candidate errors, chosen by weight when the call fails.
    #[serde(default)]
    pub errors: Vec<ErrorWeight>,
}

impl Outcome {
    /// Fail with `errno` at probability `p`, before the call executes.
    pub fn failing(p: f64, errno: Errno) -> Self {
        Self {
            fail: Probability::new(p),
            errors: vec![ErrorWeight::new(errno, 1.0)],
            ..Default::default()
        }
    }

    /// Delay by up to `max_delay_usec` at probability `p`.
    pub fn delaying(p: f64, max_delay_usec: u32) -> Self {
        Self {
            delay: Probability::new(p),
            max_delay_usec,
            ..Default::default()
        }
    }

    pub fn with_fail(mut self, fail: Probability) -> Self {
        self.fail = fail;
        self
    }

    pub fn with_delay(mut self, delay: Probability, max_delay_usec: u32) -> Self {
        self.delay = delay;
        self.max_delay_usec = max_delay_usec;
        self
    }

    pub fn with_eligibility(mut self, eligibility: Eligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    pub fn with_errors(mut self, errors: impl IntoIterator<Item = ErrorWeight>) -> Self {
        self.errors = errors.into_iter().collect();
        self
    }

    /// Append one weighted error.
    pub fn or_error(mut self, errno: Errno, weight: f64) -> Self {
        self.errors.push(ErrorWeight::new(errno, weight));
        self
    }
}

/// An [`Outcome`] bound to one syscall number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyscallOutcome {
    pub syscall: i64,
    pub outcome: Outcome,
}

impl SyscallOutcome {
    pub fn new(syscall: i64, outcome: Outcome) -> Self {
        Self { syscall, outcome }
    }
}
