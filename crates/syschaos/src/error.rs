//! Error types for session lifecycle, membership and harness configuration.

use std::io;
use std::path::PathBuf;
use syschaos_dispatch::SubstrateError;
use syschaos_fault::engine::{CompileError, Tid};
use syschaos_fault::plan::PlanFormatError;
use syschaos_fault::ValidationError;
use thiserror::Error;

/// Why a session could not start.  Nothing is left installed.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("invalid plan: {0}")]
    Invalid(#[from] ValidationError),

    #[error("out of memory while compiling the plan")]
    AllocationFailed,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("failed to start session: {0}")]
    StartFailed(String),
}

impl From<CompileError> for StartError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Invalid(e) => StartError::Invalid(e),
            CompileError::Allocation(_) => StartError::AllocationFailed,
        }
    }
}

impl From<SubstrateError> for StartError {
    fn from(err: SubstrateError) -> Self {
        match err {
            SubstrateError::Unsupported(reason) => StartError::Unsupported(reason),
            other => StartError::StartFailed(other.to_string()),
        }
    }
}

/// Errors from membership operations on a session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is stopped")]
    Stopped,

    #[error("thread {0} does not exist")]
    NoSuchThread(Tid),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("thread discovery failed")]
    Discovery(#[source] io::Error),
}

/// Errors reading the harness environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read plan {path}")]
    ReadPlan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse plan {path}")]
    ParsePlan {
        path: PathBuf,
        #[source]
        source: PlanFormatError,
    },
}
