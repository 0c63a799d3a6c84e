//! Error types and the failure policy
//!
//! Every failure the daemon can hit is classified into an [`ErrorKind`], and
//! each kind maps to exactly one [`FailureAction`] in [`FAILURE_POLICY`].
//! Driver, publish-initiation and configuration failures terminate the
//! process; delivery failures are logged and the loop carries on.

use std::fmt;

/// Result type alias for badge reader operations
pub type Result<T> = std::result::Result<T, BadgeError>;

/// Driver operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOp {
    Establish,
    ListReaders,
    StatusChange,
    Connect,
    Transmit,
    Disconnect,
    Release,
}

impl DriverOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverOp::Establish => "establish",
            DriverOp::ListReaders => "list_readers",
            DriverOp::StatusChange => "status_change",
            DriverOp::Connect => "connect",
            DriverOp::Transmit => "transmit",
            DriverOp::Disconnect => "disconnect",
            DriverOp::Release => "release",
        }
    }
}

impl fmt::Display for DriverOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by the smart-card driver
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct DriverError {
    pub operation: DriverOp,
    pub message: String,
}

impl DriverError {
    pub fn new(operation: DriverOp, message: impl Into<String>) -> Self {
        Self { operation, message: message.into() }
    }
}

/// Top-level error for the badge pipeline
#[derive(Debug, thiserror::Error)]
pub enum BadgeError {
    /// Card driver failed (context, enumeration, wait, connect, transmit).
    #[error("driver failure: {0}")]
    Driver(#[from] DriverError),

    /// Broker could not be handed the event at all.
    #[error("publish failure on topic {topic}: {message}")]
    Publish { topic: String, message: String },

    /// Broker reported that an event was not delivered.
    #[error("delivery failure on topic {topic}: {message}")]
    Delivery { topic: String, message: String },

    /// Config or properties file missing, unreadable or malformed.
    #[error("configuration failure: {message}")]
    Configuration { message: String },
}

impl BadgeError {
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish { topic: topic.into(), message: message.into() }
    }

    pub fn delivery(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery { topic: topic.into(), message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BadgeError::Driver(_) => ErrorKind::Driver,
            BadgeError::Publish { .. } => ErrorKind::Publish,
            BadgeError::Delivery { .. } => ErrorKind::Delivery,
            BadgeError::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// What the daemon does when it meets this error
    pub fn action(&self) -> FailureAction {
        self.kind().action()
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.action() {
            FailureAction::Terminate => 1,
            FailureAction::LogAndContinue => 0,
        }
    }
}

/// Error classification used by the failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Driver,
    Publish,
    Delivery,
    Configuration,
}

impl ErrorKind {
    pub fn action(self) -> FailureAction {
        FAILURE_POLICY
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, action)| *action)
            .unwrap_or(FailureAction::Terminate)
    }
}

/// Reaction to a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Print the error and exit with code 1
    Terminate,
    /// Log and keep monitoring
    LogAndContinue,
}

/// Failure policy table
pub const FAILURE_POLICY: [(ErrorKind, FailureAction); 4] = [
    (ErrorKind::Driver, FailureAction::Terminate),
    (ErrorKind::Publish, FailureAction::Terminate),
    (ErrorKind::Delivery, FailureAction::LogAndContinue),
    (ErrorKind::Configuration, FailureAction::Terminate),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table() {
        assert_eq!(ErrorKind::Driver.action(), FailureAction::Terminate);
        assert_eq!(ErrorKind::Publish.action(), FailureAction::Terminate);
        assert_eq!(ErrorKind::Configuration.action(), FailureAction::Terminate);
        assert_eq!(ErrorKind::Delivery.action(), FailureAction::LogAndContinue);
    }

    #[test]
    fn test_driver_error_is_fatal() {
        let err: BadgeError = DriverError::new(DriverOp::StatusChange, "reader unplugged").into();
        assert_eq!(err.kind(), ErrorKind::Driver);
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "driver failure: status_change failed: reader unplugged");
    }

    #[test]
    fn test_delivery_error_is_soft() {
        let err = BadgeError::delivery("badge-reader", "broker unreachable");
        assert_eq!(err.action(), FailureAction::LogAndContinue);
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn test_configuration_error_message() {
        let err = BadgeError::configuration("line 3: missing '='");
        assert_eq!(err.to_string(), "configuration failure: line 3: missing '='");
        assert_eq!(err.exit_code(), 1);
    }
}
