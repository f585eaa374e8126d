//! Configuration management for posesync sessions.
//!
//! A [`SessionConfig`] is a plain struct of named tolerances and timing
//! constants. It can be built in code, parsed from TOML, or discovered in the
//! per-user config directory. [`SessionConfig::validate`] is run before a
//! session starts so bad values fail fast instead of inside the tick loop.

pub mod config;
pub mod error;

pub use config::{
    AnchorConfig, ChannelConfig, CorrectionConfig, MonitorConfig, OwnershipConfig,
    PrecisionConfig, SessionConfig, TickConfig,
};
pub use error::{ConfigError, Result};
