//! Deployment configuration and content-addressed versioning.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Configuration for autoscaling metric collection and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingConfig {
    /// How often the replica pushes a windowed load average to the controller.
    pub metrics_interval_s: Duration,
    /// Width of the averaging window used for each push.
    pub look_back_period_s: Duration,
}

impl AutoscalingConfig {
    pub fn new(metrics_interval_s: Duration, look_back_period_s: Duration) -> Self {
        Self {
            metrics_interval_s,
            look_back_period_s,
        }
    }
}

/// Output encoding for the component logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEncoding {
    Text,
    Json,
}

/// Logging configuration, reconfigurable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive applied to the component logger (e.g. "info" or "debug").
    pub log_level: String,
    pub encoding: LogEncoding,
    /// When false, per-request access log lines are suppressed.
    pub enable_access_log: bool,
    /// Directory used to derive the advertised log file path, if any.
    pub logs_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            encoding: LogEncoding::Text,
            enable_access_log: true,
            logs_dir: None,
        }
    }
}

/// Deployment configuration consumed by the replica core.
///
/// Mutable at runtime via `reconfigure`; all fields are compared against the
/// previously stored config to decide which subsystems need to be updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Ceiling on concurrently executing requests. Must be positive.
    pub max_ongoing_requests: usize,
    /// Opaque config forwarded to the user's reconfigure hook.
    pub user_config: Option<serde_json::Value>,
    pub autoscaling_config: Option<AutoscalingConfig>,
    /// Poll period used while draining ongoing requests during graceful shutdown.
    pub graceful_shutdown_wait_loop_s: Duration,
    pub logging_config: LoggingConfig,
}

impl DeploymentConfig {
    pub fn builder() -> DeploymentConfigBuilder {
        DeploymentConfigBuilder::new()
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        DeploymentConfigBuilder::new().build()
    }
}

/// Builder for [`DeploymentConfig`].
pub struct DeploymentConfigBuilder {
    max_ongoing_requests: usize,
    user_config: Option<serde_json::Value>,
    autoscaling_config: Option<AutoscalingConfig>,
    graceful_shutdown_wait_loop_s: Duration,
    logging_config: LoggingConfig,
}

impl DeploymentConfigBuilder {
    pub fn new() -> Self {
        Self {
            max_ongoing_requests: 5,
            user_config: None,
            autoscaling_config: None,
            graceful_shutdown_wait_loop_s: Duration::from_secs(2),
            logging_config: LoggingConfig::default(),
        }
    }

    /// Sets the ceiling on concurrently executing requests.
    ///
    /// Values below 1 are clamped to 1.
    ///
    /// Default: 5
    pub fn max_ongoing_requests(mut self, max: usize) -> Self {
        self.max_ongoing_requests = max.max(1);
        self
    }

    /// Sets the opaque config forwarded to the user's reconfigure hook.
    pub fn user_config(mut self, config: serde_json::Value) -> Self {
        self.user_config = Some(config);
        self
    }

    pub fn autoscaling_config(mut self, config: AutoscalingConfig) -> Self {
        self.autoscaling_config = Some(config);
        self
    }

    /// Sets the graceful shutdown drain poll period.
    ///
    /// Default: 2s
    pub fn graceful_shutdown_wait_loop_s(mut self, period: Duration) -> Self {
        self.graceful_shutdown_wait_loop_s = period;
        self
    }

    pub fn logging_config(mut self, config: LoggingConfig) -> Self {
        self.logging_config = config;
        self
    }

    pub fn build(self) -> DeploymentConfig {
        DeploymentConfig {
            max_ongoing_requests: self.max_ongoing_requests,
            user_config: self.user_config,
            autoscaling_config: self.autoscaling_config,
            graceful_shutdown_wait_loop_s: self.graceful_shutdown_wait_loop_s,
            logging_config: self.logging_config,
        }
    }
}

impl Default for DeploymentConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Content-addressed version tag paired with the deployment config.
///
/// Regenerated whenever the config changes via `reconfigure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub code_version: String,
    pub config_hash: u64,
}

impl DeploymentVersion {
    pub fn new(code_version: impl Into<String>, config: &DeploymentConfig) -> Self {
        Self {
            code_version: code_version.into(),
            config_hash: hash_config(config),
        }
    }

    /// Derives a new version from an existing one after a config change.
    ///
    /// The code version is carried over; only the config hash is recomputed.
    pub fn from_previous(previous: &DeploymentVersion, config: &DeploymentConfig) -> Self {
        Self {
            code_version: previous.code_version.clone(),
            config_hash: hash_config(config),
        }
    }
}

fn hash_config(config: &DeploymentConfig) -> u64 {
    // The JSON rendering of the config is stable for a given value, which is
    // all that is needed to detect config changes.
    let serialized = serde_json::to_string(config).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    serialized.hash(&mut hasher);
    hasher.finish()
}
