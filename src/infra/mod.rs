//! Infrastructure - configuration, broker properties, and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `properties` - Broker client properties (key=value file)
//! - `metrics` - Lock-free swipe and delivery counters

pub mod config;
pub mod metrics;
pub mod properties;

// Re-export commonly used types
pub use config::Config;
pub use metrics::Metrics;
pub use properties::Properties;
