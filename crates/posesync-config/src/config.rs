//! Session configuration: named tolerances and timing constants.

use crate::error::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration supplied when a session starts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub tick: TickConfig,
    #[serde(default)]
    pub precision: PrecisionConfig,
    #[serde(default)]
    pub correction: CorrectionConfig,
    #[serde(default)]
    pub ownership: OwnershipConfig,
    #[serde(default)]
    pub anchor: AnchorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
}

/// Fixed-rate tick driving validation and correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Ticks per second (independent of render frame rate)
    pub rate_hz: f64,
    /// In degraded mode validation only runs every Nth tick
    pub degraded_divisor: u32,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            rate_hz: 15.0,
            degraded_divisor: 2,
        }
    }
}

impl TickConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }
}

/// Default connection tolerances and the hysteresis band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    pub default_position_tolerance_m: f64,
    pub default_rotation_tolerance_deg: f64,
    pub default_min_connection_precision: f64,
    /// Lower edge of the Degraded band, as a fraction of the minimum precision
    pub degraded_ratio: f64,
    /// Errors beyond this multiple of tolerance jump straight to Violated
    pub immediate_violation_factor: f64,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            default_position_tolerance_m: 0.0001,
            default_rotation_tolerance_deg: 0.01,
            default_min_connection_precision: 0.999,
            degraded_ratio: 0.5,
            immediate_violation_factor: 5.0,
        }
    }
}

/// Bounds on a single corrective step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    pub max_step_m: f64,
    pub max_step_deg: f64,
    /// No correction is proposed for an object its owner moved this recently
    pub grace_period_ms: u64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            max_step_m: 0.01,
            max_step_deg: 2.0,
            grace_period_ms: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipConfig {
    /// Ownership lapses when the owner's heartbeat is older than this
    pub timeout_ms: u64,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self { timeout_ms: 3000 }
    }
}

/// Anchor estimation (local tracking frame to shared world).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Number of recent estimates used for drift estimation
    pub drift_window: usize,
    /// Correspondences older than this (relative to the newest) are dropped
    pub staleness_window_ms: u64,
    /// Half-life of the weight carried by the running estimate
    pub decay_half_life_ms: u64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            drift_window: 20,
            staleness_window_ms: 5000,
            decay_half_life_ms: 1000,
        }
    }
}

/// Health thresholds driving degraded-mode decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// A connection Violated for longer than this is escalated
    pub sustained_violation_ms: u64,
    pub max_drift_rate_mps: f64,
    pub max_sync_latency_ms: f64,
    pub max_correction_rate_hz: f64,
    /// Metrics must fall below threshold * ratio before leaving degraded mode
    pub recovery_ratio: f64,
    /// Tolerances are multiplied by this while degraded
    pub degraded_tolerance_multiplier: f64,
    /// Sliding window for rate metrics
    pub metrics_window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sustained_violation_ms: 2000,
            max_drift_rate_mps: 0.002,
            max_sync_latency_ms: 250.0,
            max_correction_rate_hz: 30.0,
            recovery_ratio: 0.8,
            degraded_tolerance_multiplier: 2.0,
            metrics_window_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub broadcast_capacity: usize,
    pub command_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            command_capacity: 1024,
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document; missing sections take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        config.validate()?;
        info!("Loaded session config from {}", path.display());
        Ok(config)
    }

    /// Per-user configuration file location, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "posesync").map(|dirs| dirs.config_dir().join("session.toml"))
    }

    /// Load `path` if given, else the per-user file if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(default),
            _ => {
                debug!("No session config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject any configuration the tick loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        positive("tick.rate_hz", self.tick.rate_hz)?;
        if self.tick.rate_hz > 240.0 {
            return Err(ConfigError::OutOfRange {
                field: "tick.rate_hz",
                value: self.tick.rate_hz,
                expected: "(0, 240]",
            });
        }
        positive_int("tick.degraded_divisor", self.tick.degraded_divisor as u64)?;

        let p = &self.precision;
        positive("precision.default_position_tolerance_m", p.default_position_tolerance_m)?;
        positive("precision.default_rotation_tolerance_deg", p.default_rotation_tolerance_deg)?;
        unit_interval(
            "precision.default_min_connection_precision",
            p.default_min_connection_precision,
        )?;
        unit_interval("precision.degraded_ratio", p.degraded_ratio)?;
        positive("precision.immediate_violation_factor", p.immediate_violation_factor)?;
        if p.immediate_violation_factor <= 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "precision.immediate_violation_factor",
                value: p.immediate_violation_factor,
                expected: "> 1",
            });
        }

        positive("correction.max_step_m", self.correction.max_step_m)?;
        positive("correction.max_step_deg", self.correction.max_step_deg)?;
        positive_int("correction.grace_period_ms", self.correction.grace_period_ms)?;

        positive_int("ownership.timeout_ms", self.ownership.timeout_ms)?;

        positive_int("anchor.drift_window", self.anchor.drift_window as u64)?;
        positive_int("anchor.staleness_window_ms", self.anchor.staleness_window_ms)?;
        positive_int("anchor.decay_half_life_ms", self.anchor.decay_half_life_ms)?;

        let m = &self.monitor;
        positive_int("monitor.sustained_violation_ms", m.sustained_violation_ms)?;
        positive("monitor.max_drift_rate_mps", m.max_drift_rate_mps)?;
        positive("monitor.max_sync_latency_ms", m.max_sync_latency_ms)?;
        positive("monitor.max_correction_rate_hz", m.max_correction_rate_hz)?;
        unit_interval("monitor.recovery_ratio", m.recovery_ratio)?;
        positive("monitor.degraded_tolerance_multiplier", m.degraded_tolerance_multiplier)?;
        positive_int("monitor.metrics_window_ms", m.metrics_window_ms)?;

        positive_int("channels.broadcast_capacity", self.channels.broadcast_capacity as u64)?;
        positive_int("channels.command_capacity", self.channels.command_capacity as u64)?;
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}

fn positive_int(field: &'static str, value: u64) -> Result<()> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive {
            field,
            value: value as f64,
        })
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<()> {
    positive(field, value)?;
    if value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            expected: "(0, 1]",
        })
    }
}
