//! Runtime settings for the bridge.
//!
//! All timing bounds that govern cancellation and liveness are policy, not
//! design constants: the stop grace period in particular is tuned against
//! whatever outer watchdog supervises the host application, so it is loaded
//! from configuration rather than hard-coded.
//!
//! Settings are layered from an optional TOML file and `RIG_SCRIPT_*`
//! environment variables. Durations use the humantime format (`"250ms"`,
//! `"2s"`).

use crate::error::{AppResult, BridgeError};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Timing and safety policy for script sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long a session may keep running after `request_stop` before
    /// termination is forced.
    #[serde(with = "humantime_serde")]
    pub stop_grace_period: Duration,

    /// How often the control context re-checks cancellation while waiting for
    /// the script to complete.
    #[serde(with = "humantime_serde")]
    pub completion_poll_interval: Duration,

    /// How often blocking capability calls re-check the interruption flag.
    #[serde(with = "humantime_serde")]
    pub interrupt_poll_interval: Duration,

    /// Engine operation ceiling per run; 0 disables the limit.
    pub max_script_operations: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stop_grace_period: Duration::from_secs(1),
            completion_poll_interval: Duration::from_millis(50),
            interrupt_poll_interval: Duration::from_millis(10),
            max_script_operations: 1_000_000,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus environment overrides.
    ///
    /// Environment variables use the `RIG_SCRIPT_` prefix, e.g.
    /// `RIG_SCRIPT_STOP_GRACE_PERIOD=2s`.
    pub fn new(config_path: Option<&str>) -> AppResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix("RIG_SCRIPT").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would stall the control loop or the interrupt polls.
    pub fn validate(&self) -> AppResult<()> {
        if self.completion_poll_interval.is_zero() {
            return Err(BridgeError::Configuration(
                "completion_poll_interval must be non-zero".to_string(),
            ));
        }
        if self.interrupt_poll_interval.is_zero() {
            return Err(BridgeError::Configuration(
                "interrupt_poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_defaults() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.stop_grace_period, Duration::from_secs(1));
        assert_eq!(settings.completion_poll_interval, Duration::from_millis(50));
        assert_eq!(settings.max_script_operations, 1_000_000);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("RIG_SCRIPT_STOP_GRACE_PERIOD", "2s");
        std::env::set_var("RIG_SCRIPT_MAX_SCRIPT_OPERATIONS", "500");
        let settings = Settings::new(None).unwrap();
        std::env::remove_var("RIG_SCRIPT_STOP_GRACE_PERIOD");
        std::env::remove_var("RIG_SCRIPT_MAX_SCRIPT_OPERATIONS");

        assert_eq!(settings.stop_grace_period, Duration::from_secs(2));
        assert_eq!(settings.max_script_operations, 500);
    }

    #[test]
    #[serial]
    fn test_file_source() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "stop_grace_period = \"750ms\"\ninterrupt_poll_interval = \"5ms\""
        )
        .unwrap();

        let settings = Settings::new(file.path().to_str()).unwrap();
        assert_eq!(settings.stop_grace_period, Duration::from_millis(750));
        assert_eq!(settings.interrupt_poll_interval, Duration::from_millis(5));
        // Untouched fields keep their defaults.
        assert_eq!(settings.completion_poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let settings = Settings {
            completion_poll_interval: Duration::ZERO,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(BridgeError::Configuration(_))
        ));
    }
}
