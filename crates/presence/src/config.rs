//! Presence tracker configuration.

use std::str::FromStr;
use std::time::Duration;

use vigil_core::error::CoreError;
use vigil_core::presence::{
    StatusThresholds, DEFAULT_ACTIVITY_THROTTLE_SECS, DEFAULT_AFK_AFTER_MINS,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_RESTING_AFTER_MINS, DEFAULT_SLEEPING_AFTER_MINS,
};
use vigil_core::reactivation::DEFAULT_MAX_ATTEMPTS;

/// Default periodic refresh of the presence query.
const DEFAULT_QUERY_REFETCH_SECS: u64 = 30;

/// Timing and policy for one tracked user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub thresholds: StatusThresholds,
    /// Minimum gap between persisted activity timestamps.
    pub activity_throttle: Duration,
    /// How often the status is re-evaluated.
    pub poll_interval: Duration,
    /// Freshness window of the cached presence record.
    pub stale_time: Duration,
    /// Periodic refresh of the cached record; `None` relies on the change
    /// feed alone.
    pub refetch_interval: Option<Duration>,
    /// Failed reactivation attempts before the challenge locks.
    pub max_attempts: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            thresholds: StatusThresholds::default(),
            activity_throttle: Duration::from_secs(DEFAULT_ACTIVITY_THROTTLE_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            stale_time: Duration::ZERO,
            refetch_interval: Some(Duration::from_secs(DEFAULT_QUERY_REFETCH_SECS)),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl PresenceConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default |
    /// |-----------------------------|---------|
    /// | `ACTIVITY_THROTTLE_SECS`    | `60`    |
    /// | `PRESENCE_POLL_SECS`        | `30`    |
    /// | `QUERY_STALE_SECS`          | `0`     |
    /// | `QUERY_REFETCH_SECS`        | `30` (`0` disables) |
    /// | `AFK_AFTER_MINS`            | `180`   |
    /// | `RESTING_AFTER_MINS`        | `240`   |
    /// | `SLEEPING_AFTER_MINS`       | `300`   |
    /// | `REACTIVATION_MAX_ATTEMPTS` | `3`     |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// [`PresenceConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let throttle_secs = parse_var(&lookup, "ACTIVITY_THROTTLE_SECS", DEFAULT_ACTIVITY_THROTTLE_SECS)?;
        let poll_secs = parse_var(&lookup, "PRESENCE_POLL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        let stale_secs = parse_var(&lookup, "QUERY_STALE_SECS", 0u64)?;
        let refetch_secs = parse_var(&lookup, "QUERY_REFETCH_SECS", DEFAULT_QUERY_REFETCH_SECS)?;
        let afk = parse_var(&lookup, "AFK_AFTER_MINS", DEFAULT_AFK_AFTER_MINS)?;
        let resting = parse_var(&lookup, "RESTING_AFTER_MINS", DEFAULT_RESTING_AFTER_MINS)?;
        let sleeping = parse_var(&lookup, "SLEEPING_AFTER_MINS", DEFAULT_SLEEPING_AFTER_MINS)?;
        let max_attempts = parse_var(&lookup, "REACTIVATION_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;

        let config = Self {
            thresholds: StatusThresholds::from_minutes(afk, resting, sleeping)?,
            activity_throttle: Duration::from_secs(throttle_secs),
            poll_interval: Duration::from_secs(poll_secs),
            stale_time: Duration::from_secs(stale_secs),
            refetch_interval: (refetch_secs > 0).then(|| Duration::from_secs(refetch_secs)),
            max_attempts,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.thresholds.validate()?;
        if self.poll_interval.is_zero() {
            return Err(CoreError::Validation(
                "PRESENCE_POLL_SECS must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::Validation(
                "REACTIVATION_MAX_ATTEMPTS must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, CoreError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{name} has an invalid value: '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = PresenceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PresenceConfig::default());
    }

    #[test]
    fn overrides_and_disabled_refetch() {
        let config = PresenceConfig::from_lookup(lookup(&[
            ("ACTIVITY_THROTTLE_SECS", "10"),
            ("QUERY_REFETCH_SECS", "0"),
            ("AFK_AFTER_MINS", "1"),
            ("RESTING_AFTER_MINS", "2"),
            ("SLEEPING_AFTER_MINS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.activity_throttle, Duration::from_secs(10));
        assert_eq!(config.refetch_interval, None);
        assert_eq!(config.thresholds.sleeping_after, chrono::Duration::minutes(3));
    }

    #[test]
    fn rejects_garbage_and_bad_ordering() {
        assert_matches!(
            PresenceConfig::from_lookup(lookup(&[("PRESENCE_POLL_SECS", "soon")])),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            PresenceConfig::from_lookup(lookup(&[("AFK_AFTER_MINS", "500")])),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            PresenceConfig::from_lookup(lookup(&[("REACTIVATION_MAX_ATTEMPTS", "0")])),
            Err(CoreError::Validation(_))
        );
    }
}
