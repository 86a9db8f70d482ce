//! Injection plans: which syscalls, which threads, what outcome.
//!
//! A [`Plan`] is assembled with [`PlanBuilder`] (or loaded from JSON) and is
//! immutable afterwards.  Both paths run [`Plan::validate`], so a `Plan`
//! value in hand is always internally consistent.

use crate::outcome::{Outcome, SyscallOutcome, MAX_ERRNO};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Syscall numbers at or above this bound are rejected.
pub const MAX_SYSCALL: i64 = 512;

/// A plan failed validation.
///
/// `field` is the path of the first offending field, e.g.
/// `syscall_outcomes[1].outcome.fail.p`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid plan field `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors loading or saving a plan as JSON.
#[derive(Error, Debug)]
pub enum PlanFormatError {
    #[error("malformed plan: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plan uses a custom predicate or thread selector, which cannot be serialized")]
    NotSerializable,
}

/// How member threads are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ThreadDiscovery {
    /// Membership changes only through explicit calls.
    #[default]
    None,
    /// Rescan the process's threads every `interval_usec` microseconds.
    Poll { interval_usec: u32 },
}

impl ThreadDiscovery {
    pub fn poll(interval: Duration) -> Self {
        ThreadDiscovery::Poll {
            interval_usec: interval.as_micros().min(u32::MAX as u128) as u32,
        }
    }

    /// Poll interval, if polling.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            ThreadDiscovery::None => None,
            ThreadDiscovery::Poll { interval_usec } => {
                Some(Duration::from_micros(*interval_usec as u64))
            }
        }
    }
}

/// Decides whether a thread may become a member.
///
/// Consulted on the control path only (add and discovery), never while a
/// call is being intercepted.
pub trait ThreadSelector: Send + Sync {
    fn admits(&self, tid: i32) -> bool;
}

impl<F> ThreadSelector for F
where
    F: Fn(i32) -> bool + Send + Sync,
{
    fn admits(&self, tid: i32) -> bool {
        self(tid)
    }
}

/// Shared handle to a [`ThreadSelector`].
#[derive(Clone)]
pub struct ThreadFilter(Arc<dyn ThreadSelector>);

impl ThreadFilter {
    pub fn new(selector: impl ThreadSelector + 'static) -> Self {
        Self(Arc::new(selector))
    }

    pub fn admits(&self, tid: i32) -> bool {
        self.0.admits(tid)
    }
}

impl fmt::Debug for ThreadFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ThreadFilter(..)")
    }
}

/// A validated, immutable injection plan.
///
/// # Example
///
/// ```
/// use syschaos_fault::outcome::Outcome;
/// use syschaos_fault::plan::{PlanBuilder, ThreadDiscovery};
///
/// let plan = PlanBuilder::new()
///     .discovery(ThreadDiscovery::Poll { interval_usec: 1_000 })
///     .seed(7)
///     .outcome(1, Outcome::failing(0.25, 5))
///     .build()
///     .unwrap();
///
/// assert_eq!(plan.syscall_outcomes().len(), 1);
/// assert!(plan.outcome_for(1).is_some());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawPlan", into = "RawPlan")]
pub struct Plan {
    discovery: ThreadDiscovery,
    syscall_outcomes: Vec<SyscallOutcome>,
    seed: Option<u64>,
    selector: Option<ThreadFilter>,
}

impl Plan {
    pub fn discovery(&self) -> ThreadDiscovery {
        self.discovery
    }

    pub fn syscall_outcomes(&self) -> &[SyscallOutcome] {
        &self.syscall_outcomes
    }

    /// Fixed decision seed, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// The same plan with its decision seed replaced.
    pub fn reseeded(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn selector(&self) -> Option<&ThreadFilter> {
        self.selector.as_ref()
    }

    /// Whether `tid` passes the thread selector (always true without one).
    pub fn admits_thread(&self, tid: i32) -> bool {
        self.selector.as_ref().map_or(true, |s| s.admits(tid))
    }

    pub fn outcome_for(&self, syscall: i64) -> Option<&Outcome> {
        self.syscall_outcomes
            .iter()
            .find(|so| so.syscall == syscall)
            .map(|so| &so.outcome)
    }

    /// Syscall numbers in plan order.
    pub fn syscalls(&self) -> impl Iterator<Item = i64> + '_ {
        self.syscall_outcomes.iter().map(|so| so.syscall)
    }

    /// Whether any outcome needs a caller-supplied predicate.
    pub fn uses_custom_eligibility(&self) -> bool {
        self.syscall_outcomes
            .iter()
            .any(|so| so.outcome.eligibility.is_custom())
    }

    /// Check every field; report the first offender.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let ThreadDiscovery::Poll { interval_usec: 0 } = self.discovery {
            return Err(ValidationError::new(
                "discovery.interval_usec",
                "poll interval must be greater than zero",
            ));
        }

        let mut seen = HashSet::new();
        for (i, so) in self.syscall_outcomes.iter().enumerate() {
            let path = format!("syscall_outcomes[{}]", i);
            if !(0..MAX_SYSCALL).contains(&so.syscall) {
                return Err(ValidationError::new(
                    format!("{}.syscall", path),
                    format!("syscall number {} outside 0..{}", so.syscall, MAX_SYSCALL),
                ));
            }
            if !seen.insert(so.syscall) {
                return Err(ValidationError::new(
                    format!("{}.syscall", path),
                    format!("syscall {} configured more than once", so.syscall),
                ));
            }
            validate_outcome(&so.outcome, &format!("{}.outcome", path))?;
        }
        Ok(())
    }

    /// Parse and validate a JSON plan.
    pub fn from_json(json: &str) -> Result<Self, PlanFormatError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, PlanFormatError> {
        if self.selector.is_some() || self.uses_custom_eligibility() {
            return Err(PlanFormatError::NotSerializable);
        }
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn validate_outcome(outcome: &Outcome, path: &str) -> Result<(), ValidationError> {
    for (name, prob) in [("fail", &outcome.fail), ("delay", &outcome.delay)] {
        check_unit(prob.p, &format!("{}.{}.p", path, name))?;
        check_unit(prob.after_bias, &format!("{}.{}.after_bias", path, name))?;
    }

    let mut sum = 0.0;
    for (i, ew) in outcome.errors.iter().enumerate() {
        let field = format!("{}.errors[{}]", path, i);
        if !(1..=MAX_ERRNO).contains(&ew.errno) {
            return Err(ValidationError::new(
                format!("{}.errno", field),
                format!("errno {} outside 1..={}", ew.errno, MAX_ERRNO),
            ));
        }
        if !ew.weight.is_finite() || ew.weight < 0.0 {
            return Err(ValidationError::new(
                format!("{}.weight", field),
                format!("weight {} must be finite and non-negative", ew.weight),
            ));
        }
        sum += ew.weight;
    }
    if !outcome.errors.is_empty() && sum <= 0.0 {
        return Err(ValidationError::new(
            format!("{}.errors", path),
            "error weights must have a positive sum",
        ));
    }
    Ok(())
}

fn check_unit(value: f64, field: &str) -> Result<(), ValidationError> {
    // NaN fails the range check too.
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::new(field, format!("{} is outside [0, 1]", value)))
    }
}

/// Builder for [`Plan`].
#[derive(Debug, Default)]
pub struct PlanBuilder {
    discovery: ThreadDiscovery,
    syscall_outcomes: Vec<SyscallOutcome>,
    seed: Option<u64>,
    selector: Option<ThreadFilter>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discovery(mut self, discovery: ThreadDiscovery) -> Self {
        self.discovery = discovery;
        self
    }

    /// Fix the decision seed for reproducible runs.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Restrict membership to threads accepted by `selector`.
    pub fn selector(mut self, selector: impl ThreadSelector + 'static) -> Self {
        self.selector = Some(ThreadFilter::new(selector));
        self
    }

    /// Configure `outcome` for `syscall`.
    pub fn outcome(mut self, syscall: i64, outcome: Outcome) -> Self {
        self.syscall_outcomes
            .push(SyscallOutcome::new(syscall, outcome));
        self
    }

    pub fn build(self) -> Result<Plan, ValidationError> {
        let plan = Plan {
            discovery: self.discovery,
            syscall_outcomes: self.syscall_outcomes,
            seed: self.seed,
            selector: self.selector,
        };
        plan.validate()?;
        Ok(plan)
    }
}

/// Serialized shape of a [`Plan`].
#[derive(Serialize, Deserialize)]
struct RawPlan {
    #[serde(default)]
    discovery: ThreadDiscovery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    syscall_outcomes: Vec<SyscallOutcome>,
}

impl TryFrom<RawPlan> for Plan {
    type Error = ValidationError;

    fn try_from(raw: RawPlan) -> Result<Self, Self::Error> {
        let plan = Plan {
            discovery: raw.discovery,
            syscall_outcomes: raw.syscall_outcomes,
            seed: raw.seed,
            selector: None,
        };
        plan.validate()?;
        Ok(plan)
    }
}

impl From<Plan> for RawPlan {
    fn from(plan: Plan) -> Self {
        RawPlan {
            discovery: plan.discovery,
            seed: plan.seed,
            syscall_outcomes: plan.syscall_outcomes,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} syscall(s), discovery ", self.syscall_outcomes.len())?;
        match self.discovery {
            ThreadDiscovery::None => write!(f, "none")?,
            ThreadDiscovery::Poll { interval_usec } => write!(f, "poll/{}us", interval_usec)?,
        }
        if let Some(seed) = self.seed {
            write!(f, ", seed {}", seed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{CallContext, Eligibility, ErrorWeight, Probability};

    #[test]
    fn builder_produces_valid_plan() {
        let plan = PlanBuilder::new()
            .outcome(1, Outcome::failing(1.0, 5))
            .outcome(18, Outcome::delaying(0.5, 100))
            .build()
            .unwrap();
        assert_eq!(plan.syscalls().collect::<Vec<_>>(), vec![1, 18]);
        assert_eq!(plan.discovery(), ThreadDiscovery::None);
        assert!(plan.seed().is_none());
    }

    #[test]
    fn rejects_probability_above_one() {
        let err = PlanBuilder::new()
            .outcome(1, Outcome::failing(1.0, 5))
            .outcome(3, Outcome::failing(1.5, 5))
            .build()
            .unwrap_err();
        assert_eq!(err.field, "syscall_outcomes[1].outcome.fail.p");
    }

    #[test]
    fn rejects_nan_after_bias() {
        let outcome = Outcome::delaying(0.5, 10)
            .with_delay(Probability::new(0.5).with_after_bias(f64::NAN), 10);
        let err = PlanBuilder::new().outcome(0, outcome).build().unwrap_err();
        assert_eq!(err.field, "syscall_outcomes[0].outcome.delay.after_bias");
    }

    #[test]
    fn rejects_duplicate_syscall() {
        let err = PlanBuilder::new()
            .outcome(1, Outcome::failing(0.1, 5))
            .outcome(1, Outcome::failing(0.2, 5))
            .build()
            .unwrap_err();
        assert_eq!(err.field, "syscall_outcomes[1].syscall");
        assert!(err.reason.contains("more than once"));
    }

    #[test]
    fn rejects_out_of_range_syscall() {
        let err = PlanBuilder::new()
            .outcome(-1, Outcome::default())
            .build()
            .unwrap_err();
        assert_eq!(err.field, "syscall_outcomes[0].syscall");
    }

    #[test]
    fn rejects_negative_weight() {
        let outcome = Outcome::default().with_errors([
            ErrorWeight::new(5, 1.0),
            ErrorWeight::new(28, -0.5),
        ]);
        let err = PlanBuilder::new().outcome(1, outcome).build().unwrap_err();
        assert_eq!(err.field, "syscall_outcomes[0].outcome.errors[1].weight");
    }

    #[test]
    fn rejects_zero_weight_sum() {
        let outcome = Outcome::default().with_errors([ErrorWeight::new(5, 0.0)]);
        let err = PlanBuilder::new().outcome(1, outcome).build().unwrap_err();
        assert_eq!(err.field, "syscall_outcomes[0].outcome.errors");
    }

    #[test]
    fn rejects_bad_errno() {
        let err = PlanBuilder::new()
            .outcome(1, Outcome::failing(1.0, 0))
            .build()
            .unwrap_err();
        assert_eq!(err.field, "syscall_outcomes[0].outcome.errors[0].errno");
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let err = PlanBuilder::new()
            .discovery(ThreadDiscovery::Poll { interval_usec: 0 })
            .build()
            .unwrap_err();
        assert_eq!(err.field, "discovery.interval_usec");
    }

    #[test]
    fn empty_error_list_is_allowed() {
        // Failure can never be expressed, but the plan is consistent.
        PlanBuilder::new()
            .outcome(1, Outcome::default().with_fail(Probability::new(1.0)))
            .build()
            .unwrap();
    }

    #[test]
    fn selector_filters_threads() {
        let plan = PlanBuilder::new()
            .selector(|tid: i32| tid % 2 == 0)
            .build()
            .unwrap();
        assert!(plan.admits_thread(10));
        assert!(!plan.admits_thread(11));
        assert!(PlanBuilder::new().build().unwrap().admits_thread(11));
    }

    #[test]
    fn json_round_trip_keeps_outcomes() {
        let plan = PlanBuilder::new()
            .discovery(ThreadDiscovery::Poll { interval_usec: 500 })
            .seed(99)
            .outcome(
                1,
                Outcome::failing(0.5, 5)
                    .or_error(28, 2.0)
                    .with_eligibility(Eligibility::DescriptorNotStd),
            )
            .build()
            .unwrap();
        let json = plan.to_json().unwrap();
        let back = Plan::from_json(&json).unwrap();
        assert_eq!(back.discovery(), plan.discovery());
        assert_eq!(back.seed(), Some(99));
        let outcome = back.outcome_for(1).unwrap();
        assert_eq!(outcome.errors.len(), 2);
        assert!(matches!(outcome.eligibility, Eligibility::DescriptorNotStd));
    }

    #[test]
    fn json_is_validated_on_load() {
        let json = r#"{
            "syscall_outcomes": [
                { "syscall": 1, "outcome": { "fail": { "p": 2.0 } } }
            ]
        }"#;
        let err = Plan::from_json(json).unwrap_err();
        assert!(err.to_string().contains("syscall_outcomes[0].outcome.fail.p"));
    }

    #[test]
    fn custom_plans_refuse_serialization() {
        let plan = PlanBuilder::new()
            .outcome(
                1,
                Outcome::failing(1.0, 5).with_eligibility(Eligibility::custom(
                    |_: &CallContext| true,
                )),
            )
            .build()
            .unwrap();
        assert!(plan.uses_custom_eligibility());
        assert!(matches!(
            plan.to_json(),
            Err(PlanFormatError::NotSerializable)
        ));
    }

    #[test]
    fn display_summarizes() {
        let plan = PlanBuilder::new()
            .discovery(ThreadDiscovery::poll(Duration::from_millis(2)))
            .seed(3)
            .outcome(1, Outcome::default())
            .build()
            .unwrap();
        assert_eq!(plan.to_string(), "1 syscall(s), discovery poll/2000us, seed 3");
    }

    #[test]
    fn reseeded_replaces_only_the_seed() {
        let plan = PlanBuilder::new()
            .seed(3)
            .outcome(1, Outcome::failing(1.0, 5))
            .build()
            .unwrap()
            .reseeded(11);
        assert_eq!(plan.seed(), Some(11));
        assert!(plan.outcome_for(1).is_some());
    }
}
