//! Smart-card driver abstraction
//!
//! The session loop only talks to readers through these traits. A driver
//! establishes a [`CardContext`]; the context enumerates readers, waits for
//! status changes and opens [`CardConnection`]s.
//!
//! All calls are blocking. `get_status_change` with `timeout = None` suspends
//! the calling thread until some reader's state differs from the
//! `current_state` handed in; there is no polling interval and no way to
//! cancel it short of process shutdown.

use crate::domain::{DriverError, ReaderObservation};
use std::time::Duration;

/// Sharing mode requested when connecting to a card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    Exclusive,
    Shared,
}

/// Transmission protocols accepted when connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocols {
    T0,
    T1,
    /// Let the reader negotiate
    Any,
}

/// What happens to the card when the connection is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    LeaveCard,
    ResetCard,
    UnpowerCard,
    EjectCard,
}

/// Entry point to the driver: produces a fresh context
pub trait CardDriver: Send + Sync {
    type Context: CardContext;

    fn establish(&self) -> Result<Self::Context, DriverError>;
}

/// An open driver context
pub trait CardContext: Send + 'static {
    type Card: CardConnection;

    /// Names of the currently attached readers. No readers is `Ok(vec![])`.
    fn list_readers(&self) -> Result<Vec<String>, DriverError>;

    /// Block until any observation's reader state differs from its
    /// `current_state`, then write the new states into `event_state`.
    /// `None` waits forever.
    fn get_status_change(
        &self,
        observations: &mut [ReaderObservation],
        timeout: Option<Duration>,
    ) -> Result<(), DriverError>;

    fn connect(
        &self,
        reader: &str,
        share: ShareMode,
        protocols: Protocols,
    ) -> Result<Self::Card, DriverError>;

    fn release(self) -> Result<(), DriverError>;
}

/// An open connection to a card
pub trait CardConnection: Send + 'static {
    /// Send an APDU and return the raw response (including status word)
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, DriverError>;

    fn disconnect(self, disposition: Disposition) -> Result<(), DriverError>;
}
