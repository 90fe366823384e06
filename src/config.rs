//! Supervisor configuration
//!
//! Defaults match a small interactive deployment. `from_env` lets the
//! binaries override them without a config file.

use crate::error::SupervisorError;
use crate::models::{HandlerId, PreferenceField};
use crate::retry::{Backoff, RetryPolicy, DEFAULT_RETRY_CEILING};
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_TURNS: u32 = 32;
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Turns a session may use before it fails with BUDGET
    pub max_turns: u32,
    pub retry: RetryPolicy,
    /// Upper bound for a single handler invocation
    pub handler_timeout: Duration,
    pub required_preferences: Vec<PreferenceField>,
}

impl SupervisorConfig {
    pub fn default_required_preferences() -> Vec<PreferenceField> {
        vec![
            PreferenceField::Destination,
            PreferenceField::Days,
            PreferenceField::Budget,
        ]
    }

    /// Read overrides from `SUPERVISOR_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(max_turns) = read_var::<u32>("SUPERVISOR_MAX_TURNS")? {
            if max_turns == 0 {
                return Err(SupervisorError::Config(
                    "SUPERVISOR_MAX_TURNS must be at least 1".into(),
                ));
            }
            config.max_turns = max_turns;
        }

        if let Some(ceiling) = read_var::<u32>("SUPERVISOR_RETRY_CEILING")? {
            config.retry.default_ceiling = ceiling.max(1);
        }

        if let Some(secs) = read_var::<u64>("SUPERVISOR_HANDLER_TIMEOUT_SECS")? {
            config.handler_timeout = Duration::from_secs(secs.max(1));
        }

        let backoff_ms = read_var::<u64>("SUPERVISOR_BACKOFF_MS")?.unwrap_or(DEFAULT_BACKOFF_MS);
        let mode = env::var("SUPERVISOR_BACKOFF").unwrap_or_else(|_| "fixed".to_string());
        config.retry.backoff = parse_backoff(&mode, backoff_ms)?;

        if let Ok(fields) = env::var("SUPERVISOR_REQUIRED_PREFERENCES") {
            config.required_preferences = parse_required_preferences(&fields)?;
        }

        Ok(config)
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn with_retry_ceiling(mut self, handler: HandlerId, ceiling: u32) -> Self {
        self.retry = self.retry.with_ceiling(handler, ceiling);
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            retry: RetryPolicy {
                default_ceiling: DEFAULT_RETRY_CEILING,
                ..Default::default()
            },
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            required_preferences: Self::default_required_preferences(),
        }
    }
}

fn read_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SupervisorError::Config(format!("{} has invalid value '{}'", key, raw))),
        _ => Ok(None),
    }
}

pub fn parse_backoff(mode: &str, base_ms: u64) -> Result<Backoff> {
    let base = Duration::from_millis(base_ms);
    match mode.trim().to_lowercase().as_str() {
        "fixed" => Ok(Backoff::Fixed(base)),
        "exponential" => Ok(Backoff::Exponential {
            base,
            max: base.saturating_mul(16),
        }),
        other => Err(SupervisorError::Config(format!(
            "unknown backoff mode '{}' (expected fixed or exponential)",
            other
        ))),
    }
}

/// Comma-separated preference names, e.g. `destination,days,budget`
pub fn parse_required_preferences(raw: &str) -> Result<Vec<PreferenceField>> {
    let mut fields = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let field = PreferenceField::parse(name).ok_or_else(|| {
            SupervisorError::Config(format!("unknown preference field '{}'", name))
        })?;
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
    Ok(fields)
}
