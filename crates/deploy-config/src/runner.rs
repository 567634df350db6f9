//! Orchestrator/Runner configuration knobs, loaded from a KDL file.
//!
//! Example `orchestrator.kdl`:
//!
//! ```kdl
//! orchestrator {
//!     default-timeout-secs 600
//!     health-check-retries 3
//!     health-check-delay-secs 5
//! }
//! runner {
//!     instance-timeout-secs 300
//!     lease-timeout-secs 60
//!     batch-delay-secs 30
//! }
//! ```
//!
//! Any knob left unspecified (or the whole file, if absent) falls back
//! to the documented default.

use kdl::KdlDocument;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Knobs a Runner is constructed with. Inherited from `OrchestratorConfig`
/// defaults; there is no per-request override in the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub instance_timeout: Duration,
    pub lease_timeout: Duration,
    pub batch_delay: Duration,
    pub canary_validation_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            instance_timeout: Duration::from_secs(5 * 60),
            lease_timeout: Duration::from_secs(60),
            batch_delay: Duration::from_secs(30),
            canary_validation_delay: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Orchestrator-wide configuration. `health_check_retries`/
/// `health_check_delay` are carried through but not consumed by the
/// algorithms in this core (reserved, per spec §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub default_timeout: Duration,
    pub health_check_retries: u32,
    pub health_check_delay: Duration,
    pub shutdown_grace: Duration,
    pub runner: RunnerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10 * 60),
            health_check_retries: 3,
            health_check_delay: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            runner: RunnerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse configuration from KDL text, falling back to defaults for
    /// any knob the document doesn't set.
    pub fn from_kdl(text: &str) -> ConfigResult<Self> {
        let doc: KdlDocument = text.parse()?;
        let mut config = Self::default();

        if let Some(secs) = get_i64(&doc, "orchestrator", "default-timeout-secs")? {
            config.default_timeout = secs_to_duration("default-timeout-secs", secs)?;
        }
        if let Some(retries) = get_i64(&doc, "orchestrator", "health-check-retries")? {
            config.health_check_retries = retries.max(0) as u32;
        }
        if let Some(secs) = get_i64(&doc, "orchestrator", "health-check-delay-secs")? {
            config.health_check_delay = secs_to_duration("health-check-delay-secs", secs)?;
        }
        if let Some(secs) = get_i64(&doc, "orchestrator", "shutdown-grace-secs")? {
            config.shutdown_grace = secs_to_duration("shutdown-grace-secs", secs)?;
        }

        if let Some(secs) = get_i64(&doc, "runner", "instance-timeout-secs")? {
            config.runner.instance_timeout = secs_to_duration("instance-timeout-secs", secs)?;
        }
        if let Some(secs) = get_i64(&doc, "runner", "lease-timeout-secs")? {
            config.runner.lease_timeout = secs_to_duration("lease-timeout-secs", secs)?;
        }
        if let Some(secs) = get_i64(&doc, "runner", "batch-delay-secs")? {
            config.runner.batch_delay = secs_to_duration("batch-delay-secs", secs)?;
        }
        if let Some(secs) = get_i64(&doc, "runner", "canary-validation-delay-secs")? {
            config.runner.canary_validation_delay =
                secs_to_duration("canary-validation-delay-secs", secs)?;
        }
        if let Some(secs) = get_i64(&doc, "runner", "poll-interval-secs")? {
            config.runner.poll_interval = secs_to_duration("poll-interval-secs", secs)?;
        }

        Ok(config)
    }

    /// Load configuration from a file on disk; a missing file is not an
    /// error, it just yields the documented defaults.
    pub fn load(path: &std::path::Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_kdl(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }
}

fn secs_to_duration(field: &str, secs: i64) -> ConfigResult<Duration> {
    if secs < 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "must be non-negative".to_string(),
        });
    }
    Ok(Duration::from_secs(secs as u64))
}

fn get_i64(doc: &KdlDocument, section: &str, field: &str) -> ConfigResult<Option<i64>> {
    let Some(node) = doc.get(section) else {
        return Ok(None);
    };
    let Some(children) = node.children() else {
        return Ok(None);
    };
    let Some(field_node) = children.get(field) else {
        return Ok(None);
    };
    let value = field_node
        .get(0)
        .ok_or_else(|| ConfigError::MissingField(format!("{section}.{field}")))?;
    value
        .as_i64()
        .ok_or_else(|| ConfigError::InvalidValue {
            field: format!("{section}.{field}"),
            message: "expected an integer".to_string(),
        })
        .map(Some)
}
