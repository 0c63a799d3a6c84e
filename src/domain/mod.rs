//! Domain models - core types and error classification
//!
//! This module contains the canonical data types used throughout the system:
//! - `BadgeEvent` - the record published once per swipe
//! - `ReaderObservation` - per-reader state tracked by the monitors
//! - `EventState` - driver-reported reader state bitmask
//! - `BadgeError` - typed failures and the policy that classifies them

pub mod error;
pub mod types;

// Re-export commonly used types at module level
pub use error::{BadgeError, DriverError, DriverOp, ErrorKind, FailureAction, FAILURE_POLICY};
pub use types::{epoch_ms, format_epoch_ms, BadgeEvent, EventState, KnownState, ReaderObservation};
