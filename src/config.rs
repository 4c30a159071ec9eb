//! Scheduler configuration.
//!
//! Read once at `init` from an optional JSON file. Anything unreadable or
//! invalid falls back to the defaults below; configuration problems are never
//! fatal.

use crate::error::{Error, Result};
use crate::policy::PolicyKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Policy used when no starting policy is given, and the fallback for
    /// meta-policies before their first selection.
    pub default_policy: String,
    /// Policy (or meta-policy) active at start.
    pub starting_policy: Option<String>,

    pub hash_buckets: usize,
    /// Upper bound on an idle wait for new requests.
    pub idle_timeout_ms: u64,
    /// A policy's `schedule()` returns to the core at least this often.
    pub refresh_interval_ms: u64,

    pub aioli_quantum_bytes: u64,
    pub mlf_quantum_bytes: u64,
    /// Cap on sub-requests per aggregate, applied on top of each policy's own limit.
    pub max_aggregation_size: usize,

    // Meta-policy reselection
    pub select_period_ms: u64,
    pub min_requests_before_selection: u64,
    /// Armed-bandit probability floor, in percent.
    pub min_selection_probability: u32,
    /// Bandwidth samples older than this no longer count.
    pub performance_validity_ms: u64,

    /// Time-window policy window size.
    pub time_window_ns: u64,

    // Waiting decision
    pub shift_wait_ns: u64,
    pub aggregation_wait_ns: u64,
    pub max_predicted_wait_ns: u64,
    pub trace_predict: bool,

    // Default access-time model
    pub access_latency_ns: u64,
    pub access_ns_per_byte: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_policy: "AIOLI".to_string(),
            starting_policy: None,
            hash_buckets: 64,
            idle_timeout_ms: 10,
            refresh_interval_ms: 100,
            aioli_quantum_bytes: 8192,
            mlf_quantum_bytes: 8192,
            max_aggregation_size: 16,
            select_period_ms: 1000,
            min_requests_before_selection: 16,
            min_selection_probability: 5,
            performance_validity_ms: 60_000,
            time_window_ns: 1_000_000,
            shift_wait_ns: 1_350_000,
            aggregation_wait_ns: 900_000,
            max_predicted_wait_ns: 10_000_000,
            trace_predict: false,
            access_latency_ns: 100_000,
            access_ns_per_byte: 1.0,
        }
    }
}

impl SchedulerConfig {
    /// Strict loader: any read, parse, or validation problem is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SchedulerConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loader used by `init`: problems are logged and the defaults used.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::load(path) {
            Ok(config) => {
                info!("Loaded scheduler configuration from {}", path.display());
                config
            }
            Err(e) => {
                warn!(
                    "Ignoring scheduler configuration {}: {}; using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hash_buckets == 0 {
            return Err(Error::InvalidConfiguration(
                "hash_buckets must be positive".to_string(),
            ));
        }
        if self.aioli_quantum_bytes == 0 || self.mlf_quantum_bytes == 0 {
            return Err(Error::InvalidConfiguration(
                "quantum sizes must be positive".to_string(),
            ));
        }
        if self.max_aggregation_size == 0 {
            return Err(Error::InvalidConfiguration(
                "max_aggregation_size must be positive".to_string(),
            ));
        }
        if self.min_selection_probability > 100 {
            return Err(Error::InvalidConfiguration(
                "min_selection_probability is a percentage".to_string(),
            ));
        }
        if !self.access_ns_per_byte.is_finite() || self.access_ns_per_byte < 0.0 {
            return Err(Error::InvalidConfiguration(
                "access_ns_per_byte must be a non-negative number".to_string(),
            ));
        }

        let default = PolicyKind::from_name(&self.default_policy)?;
        if default.descriptor().is_dynamic {
            return Err(Error::InvalidConfiguration(format!(
                "default policy {} cannot be a meta-policy",
                self.default_policy
            )));
        }
        if let Some(start) = &self.starting_policy {
            PolicyKind::from_name(start)?;
        }
        Ok(())
    }

    pub fn default_policy_kind(&self) -> PolicyKind {
        PolicyKind::from_name(&self.default_policy).unwrap_or(PolicyKind::Aioli)
    }

    pub fn starting_policy_kind(&self) -> PolicyKind {
        self.starting_policy
            .as_deref()
            .and_then(|name| PolicyKind::from_name(name).ok())
            .unwrap_or_else(|| self.default_policy_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert_eq!(
            SchedulerConfig::default().starting_policy_kind(),
            PolicyKind::Aioli
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "default_policy": "mlf", "starting_policy": "ARMED_BANDIT", "hash_buckets": 8 }}"#
        )
        .unwrap();

        let config = SchedulerConfig::load(file.path()).unwrap();
        assert_eq!(config.hash_buckets, 8);
        assert_eq!(config.default_policy_kind(), PolicyKind::Mlf);
        assert_eq!(config.starting_policy_kind(), PolicyKind::ArmedBandit);
        assert_eq!(config.aioli_quantum_bytes, 8192);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "hash_buckets": 0 }}"#).unwrap();
        assert!(matches!(
            SchedulerConfig::load(file.path()),
            Err(Error::InvalidConfiguration(_))
        ));
        assert_eq!(
            SchedulerConfig::load_or_default(Some(file.path())),
            SchedulerConfig::default()
        );
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let config = SchedulerConfig {
            default_policy: "ELEVATOR".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            default_policy: "DYN_TREE".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = SchedulerConfig::load_or_default(Some(Path::new("/nonexistent/iosched.json")));
        assert_eq!(config, SchedulerConfig::default());
    }
}
