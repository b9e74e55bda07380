//! Configuration Module
//!
//! Typed relay settings loaded from environment variables.

mod settings;

pub use settings::{
    BackpressurePolicy, ConfigError, RelayConfig, RestSettings, ServerSettings, UpstreamSettings,
};
