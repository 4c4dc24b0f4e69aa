//! Runtime configuration from `REQROUTE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::policy::PolicyConfig;
use crate::router::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{var}: invalid value '{value}'")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub policy: PolicyConfig,
    /// Shared status record file.
    pub status_path: PathBuf,
    pub janitor_interval: Duration,
    /// Status flags reset after this long without activity.
    pub idle_reset: Duration,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            status_path: std::env::temp_dir().join("requisition-router.status"),
            janitor_interval: Duration::from_secs(300),
            idle_reset: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from `lookup`, falling back to defaults for unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let text = |var: &str, default: String| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        let policy = PolicyConfig {
            first_line_prefix: text(
                "REQROUTE_FIRST_LINE_PREFIX",
                defaults.policy.first_line_prefix,
            ),
            first_line_group: text("REQROUTE_FIRST_LINE_GROUP", defaults.policy.first_line_group),
            second_line_group: text(
                "REQROUTE_SECOND_LINE_GROUP",
                defaults.policy.second_line_group,
            ),
            senior_clerk_role: text(
                "REQROUTE_SENIOR_CLERK_ROLE",
                defaults.policy.senior_clerk_role,
            ),
            delegate_role: text("REQROUTE_DELEGATE_ROLE", defaults.policy.delegate_role),
            deputy_limit: parsed(&lookup, "REQROUTE_DEPUTY_LIMIT")?
                .unwrap_or(defaults.policy.deputy_limit),
        };

        let status_path = lookup("REQROUTE_STATUS_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.status_path);

        let secs = |var: &'static str, default: Duration| {
            parsed::<u64>(&lookup, var).map(|v| v.map(Duration::from_secs).unwrap_or(default))
        };
        let janitor_interval = secs("REQROUTE_JANITOR_INTERVAL_SECS", defaults.janitor_interval)?;
        let idle_reset = secs("REQROUTE_IDLE_RESET_SECS", defaults.idle_reset)?;

        let attempts = parsed::<u32>(&lookup, "REQROUTE_NOTIFY_ATTEMPTS")?
            .unwrap_or(defaults.retry.attempts);
        if attempts == 0 {
            return Err(ConfigError {
                var: "REQROUTE_NOTIFY_ATTEMPTS",
                value: attempts.to_string(),
            });
        }
        let backoff = parsed::<u64>(&lookup, "REQROUTE_NOTIFY_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.backoff);

        if janitor_interval.is_zero() {
            return Err(ConfigError {
                var: "REQROUTE_JANITOR_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            policy,
            status_path,
            janitor_interval,
            idle_reset,
            retry: RetryPolicy { attempts, backoff },
        })
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var).map(|v| v.trim().to_string()) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| ConfigError { var, value: v }),
    }
}
