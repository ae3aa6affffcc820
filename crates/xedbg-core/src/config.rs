//! Processor configuration.
//!
//! Values come from builder methods or from `XEDBG_*` environment variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `XEDBG_BREAK_ON_START` | pause as soon as the guest is launched | `false` |
//! | `XEDBG_MAX_STACK_FRAMES` | frames captured per thread on pause | `64` |
//! | `XEDBG_STEP_TIMEOUT_MS` | bound on stepping waits (`0` or unset waits forever) | unset |
//! | `XEDBG_SAFE_POINT_SCAN_LIMIT` | instructions scanned for a safe point | `256` |

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::stack::MAX_STACK_FRAMES;

/// Environment variable enabling break-on-start.
pub const ENV_BREAK_ON_START: &str = "XEDBG_BREAK_ON_START";
/// Environment variable for the captured frame limit.
pub const ENV_MAX_STACK_FRAMES: &str = "XEDBG_MAX_STACK_FRAMES";
/// Environment variable for the stepping timeout in milliseconds.
pub const ENV_STEP_TIMEOUT_MS: &str = "XEDBG_STEP_TIMEOUT_MS";
/// Environment variable for the safe point scan limit.
pub const ENV_SAFE_POINT_SCAN_LIMIT: &str = "XEDBG_SAFE_POINT_SCAN_LIMIT";

/// Configuration error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError
{
    /// A variable held a value that does not parse.
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue
    {
        /// Variable name
        key: &'static str,
        /// Offending value
        value: String,
    },
}

/// Tunables of a [`Processor`](crate::Processor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig
{
    /// Pause immediately when the guest is launched.
    pub break_on_start: bool,
    /// Maximum frames captured per thread when execution pauses.
    pub max_stack_frames: usize,
    /// Upper bound on waiting for a stepped thread; `None` waits forever.
    pub step_timeout: Option<Duration>,
    /// Maximum instructions scanned forward when looking for a safe point.
    pub safe_point_scan_limit: usize,
}

impl Default for ProcessorConfig
{
    fn default() -> Self
    {
        Self {
            break_on_start: false,
            max_stack_frames: MAX_STACK_FRAMES,
            step_timeout: None,
            safe_point_scan_limit: 256,
        }
    }
}

impl ProcessorConfig
{
    /// Read configuration from the process environment.
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for values that do not parse.
    pub fn from_env() -> Result<Self, ConfigError>
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through `lookup`, starting from the defaults.
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for values that do not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_BREAK_ON_START) {
            config.break_on_start = parse_bool(ENV_BREAK_ON_START, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_STACK_FRAMES) {
            config.max_stack_frames = parse_number(ENV_MAX_STACK_FRAMES, &value)?;
        }
        if let Some(value) = lookup(ENV_STEP_TIMEOUT_MS) {
            let millis: u64 = parse_number(ENV_STEP_TIMEOUT_MS, &value)?;
            config.step_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(value) = lookup(ENV_SAFE_POINT_SCAN_LIMIT) {
            config.safe_point_scan_limit = parse_number(ENV_SAFE_POINT_SCAN_LIMIT, &value)?;
        }

        Ok(config)
    }

    /// Set break-on-start.
    #[must_use]
    pub fn with_break_on_start(mut self, break_on_start: bool) -> Self
    {
        self.break_on_start = break_on_start;
        self
    }

    /// Set the captured frame limit.
    #[must_use]
    pub fn with_max_stack_frames(mut self, max_stack_frames: usize) -> Self
    {
        self.max_stack_frames = max_stack_frames;
        self
    }

    /// Bound stepping waits.
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self
    {
        self.step_timeout = Some(timeout);
        self
    }

    /// Set the safe point scan limit.
    #[must_use]
    pub fn with_safe_point_scan_limit(mut self, limit: usize) -> Self
    {
        self.safe_point_scan_limit = limit;
        self
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError>
{
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
{
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>
    {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset()
    {
        let config = ProcessorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ProcessorConfig::default());
        assert_eq!(config.max_stack_frames, 64);
        assert_eq!(config.step_timeout, None);
    }

    #[test]
    fn test_values_from_lookup()
    {
        let config = ProcessorConfig::from_lookup(lookup(&[
            (ENV_BREAK_ON_START, "yes"),
            (ENV_MAX_STACK_FRAMES, "16"),
            (ENV_STEP_TIMEOUT_MS, "250"),
            (ENV_SAFE_POINT_SCAN_LIMIT, "8"),
        ]))
        .unwrap();
        assert!(config.break_on_start);
        assert_eq!(config.max_stack_frames, 16);
        assert_eq!(config.step_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.safe_point_scan_limit, 8);
    }

    #[test]
    fn test_zero_timeout_waits_forever()
    {
        let config = ProcessorConfig::from_lookup(lookup(&[(ENV_STEP_TIMEOUT_MS, "0")])).unwrap();
        assert_eq!(config.step_timeout, None);
    }

    #[test]
    fn test_invalid_value_is_reported()
    {
        let err = ProcessorConfig::from_lookup(lookup(&[(ENV_MAX_STACK_FRAMES, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: ENV_MAX_STACK_FRAMES,
                value: "lots".to_string()
            }
        );
    }
}
