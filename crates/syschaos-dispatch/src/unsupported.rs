//! Stand-in for platforms without syscall user dispatch.

use crate::substrate::{Capabilities, Substrate, SubstrateError};
use std::sync::Arc;
use syschaos_fault::engine::{DecisionEngine, Tid};

const REASON: &str = "syscall user dispatch requires Linux on x86_64";

/// Never constructed: [`acquire`](DispatchSubstrate::acquire) always fails.
#[derive(Debug)]
pub struct DispatchSubstrate {
    _claim: (),
}

impl DispatchSubstrate {
    pub fn acquire() -> Result<Self, SubstrateError> {
        Err(SubstrateError::Unsupported(REASON.to_string()))
    }

    pub fn probe() -> Result<(), SubstrateError> {
        Err(SubstrateError::Unsupported(REASON.to_string()))
    }
}

impl Substrate for DispatchSubstrate {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            custom_eligibility: false,
        }
    }

    fn hook(&self, _syscall: i64) -> Result<(), SubstrateError> {
        Err(SubstrateError::Unsupported(REASON.to_string()))
    }

    fn unhook(&self, _syscall: i64) {}

    fn activate(&self, _engine: Arc<DecisionEngine>) -> Result<(), SubstrateError> {
        Err(SubstrateError::Unsupported(REASON.to_string()))
    }

    fn deactivate(&self) {}

    fn arm(&self, _tid: Tid) -> Result<(), SubstrateError> {
        Err(SubstrateError::Unsupported(REASON.to_string()))
    }

    fn disarm(&self, _tid: Tid) -> Result<(), SubstrateError> {
        Ok(())
    }
}
