//! Harness configuration from the environment.
//!
//! | Variable | Meaning |
//! |---|---|
//! | `SYSCHAOS_DISABLE` | `y`, `yes`, `1` or `true` turns injection off (negative-control runs) |
//! | `SYSCHAOS_ERRNO` | errno a scenario should inject and expect, as a number or a name like `EIO` |
//! | `SYSCHAOS_SEED` | fixed decision seed |
//! | `SYSCHAOS_PLAN` | path of a JSON plan |

use crate::error::{ConfigError, StartError};
use crate::session::Session;
use log::info;
use std::env;
use std::fs;
use std::path::PathBuf;
use syschaos_fault::{Errno, Plan};

pub const DISABLE_VAR: &str = "SYSCHAOS_DISABLE";
pub const ERRNO_VAR: &str = "SYSCHAOS_ERRNO";
pub const SEED_VAR: &str = "SYSCHAOS_SEED";
pub const PLAN_VAR: &str = "SYSCHAOS_PLAN";

/// Settings a test harness reads from its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessConfig {
    pub disabled: bool,
    pub errno: Option<Errno>,
    pub seed: Option<u64>,
    pub plan_path: Option<PathBuf>,
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = HarnessConfig::default();

        if let Some(value) = lookup(DISABLE_VAR) {
            config.disabled = parse_flag(&value).ok_or_else(|| ConfigError::Invalid {
                var: DISABLE_VAR,
                value: value.clone(),
                reason: "expected y/yes/1/true or n/no/0/false".to_string(),
            })?;
        }
        if let Some(value) = lookup(ERRNO_VAR) {
            config.errno = Some(parse_errno(&value).ok_or_else(|| ConfigError::Invalid {
                var: ERRNO_VAR,
                value: value.clone(),
                reason: "expected an errno number in 1..=4095 or a name like EIO".to_string(),
            })?);
        }
        if let Some(value) = lookup(SEED_VAR) {
            config.seed = Some(value.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    var: SEED_VAR,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?);
        }
        config.plan_path = lookup(PLAN_VAR).filter(|p| !p.is_empty()).map(PathBuf::from);
        Ok(config)
    }

    /// The configured errno, or `default`.
    pub fn errno_or(&self, default: Errno) -> Errno {
        self.errno.unwrap_or(default)
    }

    /// Load the plan named by `SYSCHAOS_PLAN`, if set.
    pub fn load_plan(&self) -> Result<Option<Plan>, ConfigError> {
        let Some(path) = &self.plan_path else {
            return Ok(None);
        };
        let json = fs::read_to_string(path).map_err(|source| ConfigError::ReadPlan {
            path: path.clone(),
            source,
        })?;
        let plan = Plan::from_json(&json).map_err(|source| ConfigError::ParsePlan {
            path: path.clone(),
            source,
        })?;
        Ok(Some(plan))
    }

    /// Apply environment overrides to `plan`.
    pub fn prepare(&self, plan: Plan) -> Plan {
        match self.seed {
            Some(seed) => plan.reseeded(seed),
            None => plan,
        }
    }

    /// Start a session for `plan`, or return `None` when injection is
    /// disabled.
    pub fn start_session(&self, plan: Plan) -> Result<Option<Session>, StartError> {
        if self.disabled {
            info!("{} is set; fault injection disabled", DISABLE_VAR);
            return Ok(None);
        }
        Session::start(self.prepare(plan)).map(Some)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "1" | "true" => Some(true),
        "" | "n" | "no" | "0" | "false" => Some(false),
        _ => None,
    }
}

const ERRNO_NAMES: &[(&str, Errno)] = &[
    ("EPERM", libc::EPERM),
    ("ENOENT", libc::ENOENT),
    ("ESRCH", libc::ESRCH),
    ("EINTR", libc::EINTR),
    ("EIO", libc::EIO),
    ("ENXIO", libc::ENXIO),
    ("E2BIG", libc::E2BIG),
    ("EBADF", libc::EBADF),
    ("ECHILD", libc::ECHILD),
    ("EAGAIN", libc::EAGAIN),
    ("ENOMEM", libc::ENOMEM),
    ("EACCES", libc::EACCES),
    ("EFAULT", libc::EFAULT),
    ("EBUSY", libc::EBUSY),
    ("EEXIST", libc::EEXIST),
    ("EXDEV", libc::EXDEV),
    ("ENODEV", libc::ENODEV),
    ("ENOTDIR", libc::ENOTDIR),
    ("EISDIR", libc::EISDIR),
    ("EINVAL", libc::EINVAL),
    ("ENFILE", libc::ENFILE),
    ("EMFILE", libc::EMFILE),
    ("ENOTTY", libc::ENOTTY),
    ("EFBIG", libc::EFBIG),
    ("ENOSPC", libc::ENOSPC),
    ("ESPIPE", libc::ESPIPE),
    ("EROFS", libc::EROFS),
    ("EMLINK", libc::EMLINK),
    ("EPIPE", libc::EPIPE),
    ("ERANGE", libc::ERANGE),
    ("EDEADLK", libc::EDEADLK),
    ("ENAMETOOLONG", libc::ENAMETOOLONG),
    ("ENOSYS", libc::ENOSYS),
    ("ENOTEMPTY", libc::ENOTEMPTY),
    ("EDQUOT", libc::EDQUOT),
    ("ECONNREFUSED", libc::ECONNREFUSED),
    ("ECONNRESET", libc::ECONNRESET),
    ("ECONNABORTED", libc::ECONNABORTED),
    ("ETIMEDOUT", libc::ETIMEDOUT),
    ("EHOSTUNREACH", libc::EHOSTUNREACH),
    ("ENETUNREACH", libc::ENETUNREACH),
    ("EADDRINUSE", libc::EADDRINUSE),
    ("ENOTCONN", libc::ENOTCONN),
    ("EINPROGRESS", libc::EINPROGRESS),
];

/// Parse an errno given as a number or a symbolic name.
pub fn parse_errno(value: &str) -> Option<Errno> {
    let value = value.trim();
    let errno = match value.parse::<Errno>() {
        Ok(n) => n,
        Err(_) => {
            let upper = value.to_ascii_uppercase();
            ERRNO_NAMES
                .iter()
                .find(|(name, _)| *name == upper)
                .map(|&(_, errno)| errno)?
        }
    };
    (1..=syschaos_fault::outcome::MAX_ERRNO)
        .contains(&errno)
        .then_some(errno)
}

/// Symbolic name of `errno`, if it is a well-known one.
pub fn errno_name(errno: Errno) -> Option<&'static str> {
    ERRNO_NAMES
        .iter()
        .find(|&&(_, e)| e == errno)
        .map(|&(name, _)| name)
}
