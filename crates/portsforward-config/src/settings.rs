//! Process-wide forwarding settings
//!
//! Built once at startup and shared read-only (`Arc<ForwardSettings>`) with the
//! watcher, the listener manager and every stream pump.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::rule::DEFAULT_RULE_LINE;

const KIB: u64 = 1024;

/// Secondary destination receiving a copy of one traffic direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub host: String,
    pub port: u16,
}

impl MirrorTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build a target from optional CLI values, checking host/port pairing
    pub fn from_parts(
        host: Option<String>,
        port: Option<u16>,
        label: &str,
    ) -> Result<Option<Self>, ConfigError> {
        match (host.filter(|h| !h.is_empty()), port.filter(|p| *p != 0)) {
            (None, None) => Ok(None),
            (Some(host), Some(port)) => Ok(Some(Self { host, port })),
            (Some(_), None) => Err(ConfigError::Invalid(format!(
                "When {} mirror host is defined, its port must be defined in range 1-65535",
                label
            ))),
            (None, Some(_)) => Err(ConfigError::Invalid(format!(
                "{} mirror port defined but no {} mirror host",
                label, label
            ))),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for MirrorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Aggregate budget shared by all connections of one listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerRate {
    pub bytes_per_sec: u64,
    pub burst: u64,
}

impl Default for ServerRate {
    fn default() -> Self {
        Self {
            bytes_per_sec: 100_000 * KIB,
            burst: 20_000 * KIB,
        }
    }
}

/// Global forwarding configuration
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    /// Rules file watched for changes
    pub rules_path: PathBuf,
    pub poll_interval: Duration,
    /// Size of the read buffer used by each stream pump
    pub buffer_size: usize,
    /// Append upstream (source to destination) bytes to this file
    pub up_tap_path: Option<PathBuf>,
    /// Append downstream (destination to source) bytes to this file
    pub down_tap_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_to_console: bool,
    pub mirror_up: Option<MirrorTarget>,
    pub mirror_down: Option<MirrorTarget>,
    /// Line written to an absent or empty rules file
    pub default_rule: String,
    /// Cap on concurrent connections per rule, `None` for unbounded
    pub max_connections_per_rule: Option<usize>,
    pub server_rate: ServerRate,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            rules_path: PathBuf::from("portsforward.conf"),
            poll_interval: Duration::from_secs(10),
            buffer_size: 1024,
            up_tap_path: None,
            down_tap_path: None,
            log_file: None,
            log_to_console: false,
            mirror_up: None,
            mirror_down: None,
            default_rule: DEFAULT_RULE_LINE.to_string(),
            max_connections_per_rule: None,
            server_rate: ServerRate::default(),
        }
    }
}

impl ForwardSettings {
    pub fn with_rules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = path.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_taps(mut self, up: Option<PathBuf>, down: Option<PathBuf>) -> Self {
        self.up_tap_path = up;
        self.down_tap_path = down;
        self
    }

    pub fn with_mirrors(mut self, up: Option<MirrorTarget>, down: Option<MirrorTarget>) -> Self {
        self.mirror_up = up;
        self.mirror_down = down;
        self
    }

    pub fn with_max_connections_per_rule(mut self, max: Option<usize>) -> Self {
        self.max_connections_per_rule = max;
        self
    }

    /// Seed rule built from the single-forward CLI options
    ///
    /// Falls back to [`DEFAULT_RULE_LINE`] fields for whatever is missing.
    pub fn with_seed_rule(
        mut self,
        source_port: Option<u16>,
        destination_host: Option<String>,
        destination_port: Option<u16>,
    ) -> Self {
        if source_port.is_none() && destination_host.is_none() && destination_port.is_none() {
            return self;
        }
        let defaults: Vec<&str> = DEFAULT_RULE_LINE.split(',').collect();
        self.default_rule = format!(
            "{},{},{},{}",
            source_port.map_or_else(|| defaults[0].to_string(), |p| p.to_string()),
            destination_host.unwrap_or_else(|| defaults[1].to_string()),
            destination_port.map_or_else(|| defaults[2].to_string(), |p| p.to_string()),
            defaults[3]
        );
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < 1 {
            return Err(ConfigError::Invalid(
                "Buffer size needs to be >= 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Poll interval must be greater than zero".to_string(),
            ));
        }
        for (label, mirror) in [("upstream", &self.mirror_up), ("downstream", &self.mirror_down)] {
            if let Some(mirror) = mirror {
                if mirror.host.is_empty() || mirror.port == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "{} mirror needs both a host and a port in range 1-65535",
                        label
                    )));
                }
            }
        }
        if self.max_connections_per_rule == Some(0) {
            return Err(ConfigError::Invalid(
                "Max connections per rule must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ForwardSettings::default();
        assert_eq!(settings.rules_path, PathBuf::from("portsforward.conf"));
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.buffer_size, 1024);
        assert_eq!(settings.default_rule, DEFAULT_RULE_LINE);
        assert!(settings.mirror_up.is_none());
        assert!(settings.max_connections_per_rule.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let settings = ForwardSettings::default().with_buffer_size(0);
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_admission_bound_rejected() {
        let settings = ForwardSettings::default().with_max_connections_per_rule(Some(0));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_mirror_pairing() {
        assert_eq!(MirrorTarget::from_parts(None, None, "upstream").unwrap(), None);
        assert_eq!(
            MirrorTarget::from_parts(Some("mirror".into()), Some(9000), "upstream").unwrap(),
            Some(MirrorTarget::new("mirror", 9000))
        );
        assert!(MirrorTarget::from_parts(Some("mirror".into()), None, "upstream").is_err());
        assert!(MirrorTarget::from_parts(None, Some(9000), "downstream").is_err());
    }

    #[test]
    fn test_seed_rule_overrides_default_fields() {
        let settings =
            ForwardSettings::default().with_seed_rule(Some(3000), Some("10.0.0.5".into()), None);
        assert_eq!(settings.default_rule, "3000,10.0.0.5,22000,1500");

        let untouched = ForwardSettings::default().with_seed_rule(None, None, None);
        assert_eq!(untouched.default_rule, DEFAULT_RULE_LINE);
    }
}
