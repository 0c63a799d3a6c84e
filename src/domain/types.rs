//! Shared types for the badge reader

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Render epoch milliseconds as RFC 3339 UTC, for logs
pub fn format_epoch_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

/// Reader state bitmask as reported by the smart-card driver.
///
/// The low 16 bits mirror the PC/SC `SCARD_STATE_*` constants. The high 16
/// bits hold the reader's event counter, bumped by the driver on every card
/// insertion or removal. Both halves must be echoed back as the baseline of
/// the next wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct EventState(pub u32);

impl EventState {
    pub const UNAWARE: EventState = EventState(0x0000);
    pub const IGNORE: EventState = EventState(0x0001);
    pub const CHANGED: EventState = EventState(0x0002);
    pub const UNKNOWN: EventState = EventState(0x0004);
    pub const UNAVAILABLE: EventState = EventState(0x0008);
    pub const EMPTY: EventState = EventState(0x0010);
    pub const PRESENT: EventState = EventState(0x0020);
    pub const ATRMATCH: EventState = EventState(0x0040);
    pub const EXCLUSIVE: EventState = EventState(0x0080);
    pub const INUSE: EventState = EventState(0x0100);
    pub const MUTE: EventState = EventState(0x0200);

    /// State flags, without the event counter
    pub const STATE_MASK: u32 = 0xFFFF;

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn event_count(self) -> u32 {
        self.0 >> 16
    }

    #[inline]
    pub fn with_event_count(self, count: u32) -> EventState {
        EventState((self.0 & Self::STATE_MASK) | (count << 16))
    }

    #[inline]
    pub fn contains(self, other: EventState) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.contains(EventState::PRESENT)
    }

    /// Drop the CHANGED flag, leaving the state (and event counter) as it
    /// should be echoed back to the driver on the next wait.
    #[inline]
    pub fn acknowledged(self) -> EventState {
        EventState(self.0 & !EventState::CHANGED.0)
    }
}

impl std::ops::BitOr for EventState {
    type Output = EventState;

    fn bitor(self, rhs: EventState) -> EventState {
        EventState(self.0 | rhs.0)
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Coarse reading of a reader's acknowledged state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownState {
    Unaware,
    Present,
    Absent,
    Unknown,
}

impl KnownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnownState::Unaware => "unaware",
            KnownState::Present => "present",
            KnownState::Absent => "absent",
            KnownState::Unknown => "unknown",
        }
    }
}

impl From<EventState> for KnownState {
    fn from(state: EventState) -> Self {
        if state == EventState::UNAWARE {
            KnownState::Unaware
        } else if state.is_present() {
            KnownState::Present
        } else if state.contains(EventState::EMPTY) {
            KnownState::Absent
        } else {
            KnownState::Unknown
        }
    }
}

/// Per-reader record tracked during one monitoring phase.
///
/// `current_state` is what the monitor has acknowledged and is handed to the
/// driver as the baseline to wait against; `event_state` is written by the
/// driver when a status-change wait returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderObservation {
    pub name: String,
    pub current_state: EventState,
    pub event_state: EventState,
}

impl ReaderObservation {
    pub fn unaware(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current_state: EventState::UNAWARE,
            event_state: EventState::UNAWARE,
        }
    }

    /// Build a fresh observation set, one per reader, all unaware
    pub fn for_readers(readers: &[String]) -> Vec<Self> {
        readers.iter().map(Self::unaware).collect()
    }

    /// Accept the last reported event state as the new baseline.
    /// Only called after a status-change wait has returned.
    #[inline]
    pub fn acknowledge(&mut self) {
        self.current_state = self.event_state.acknowledged();
    }

    #[inline]
    pub fn last_known(&self) -> KnownState {
        KnownState::from(self.current_state)
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.event_state.is_present()
    }
}

/// Badge swipe event as published to the broker.
///
/// Wire format is exactly `{"badge":"<lowercase hex>","time":<epoch ms>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeEvent {
    pub badge: String,
    pub time: i64,
}

impl BadgeEvent {
    pub fn new(badge: impl Into<String>, time: i64) -> Self {
        Self { badge: badge.into(), time }
    }

    /// Serialize to compact JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
