//! Services - the badge capture pipeline
//!
//! This module contains the core logic:
//! - `presence` - Blocks until a card is placed on any reader
//! - `identity` - Reader enumeration and UID extraction
//! - `publisher` - Hands badge events to the broker and tallies delivery
//! - `removal` - Blocks until the card leaves its reader
//! - `session` - The capture loop tying the above together

pub mod identity;
pub mod presence;
pub mod publisher;
pub mod removal;
pub mod session;

// Re-export commonly used types
pub use identity::{extract_identity, IdentityExtractor, GET_UID_APDU};
pub use presence::wait_for_presence;
pub use publisher::{EventPublisher, PublishOutcome};
pub use removal::wait_for_removal;
pub use session::{CycleOutcome, Session, SessionState, Swipe};
