//! Session loop - one badge swipe per cycle, forever
//!
//! ```text
//! Idle -> Enumerating -> AwaitingPresence -> Connected -> Extracting
//!      -> Publishing -> AwaitingRemoval -> Idle
//! ```
//!
//! Every cycle establishes a fresh driver context and re-lists readers, so
//! readers plugged in between swipes are picked up. With no reader attached
//! the cycle ends straight away. The two monitor waits are unbounded and run
//! on the blocking pool with the context moved in and back out. At most one
//! card connection is open at a time: it is disconnected with a card reset
//! before the cycle ends, on error paths as well.

use crate::domain::{epoch_ms, format_epoch_ms, BadgeError, DriverError, DriverOp};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::driver::{CardConnection, CardContext, CardDriver, Disposition};
use crate::services::identity::{connect_exclusive, enumerate_readers, IdentityExtractor};
use crate::services::presence::wait_for_presence;
use crate::services::publisher::{EventPublisher, PublishOutcome};
use crate::services::removal::wait_for_removal;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Enumerating,
    AwaitingPresence,
    Connected,
    Extracting,
    Publishing,
    AwaitingRemoval,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Enumerating => "enumerating",
            SessionState::AwaitingPresence => "awaiting_presence",
            SessionState::Connected => "connected",
            SessionState::Extracting => "extracting",
            SessionState::Publishing => "publishing",
            SessionState::AwaitingRemoval => "awaiting_removal",
        }
    }

    /// Successor on a completed swipe
    pub fn next(self) -> SessionState {
        match self {
            SessionState::Idle => SessionState::Enumerating,
            SessionState::Enumerating => SessionState::AwaitingPresence,
            SessionState::AwaitingPresence => SessionState::Connected,
            SessionState::Connected => SessionState::Extracting,
            SessionState::Extracting => SessionState::Publishing,
            SessionState::Publishing => SessionState::AwaitingRemoval,
            SessionState::AwaitingRemoval => SessionState::Idle,
        }
    }

    /// Legal moves: forward one step, or back to Idle from anywhere
    pub fn can_transition_to(self, to: SessionState) -> bool {
        to == self.next() || to == SessionState::Idle
    }
}

/// Result of one session cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No reader attached; nothing waited on
    NoReaders,
    Swiped(Swipe),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swipe {
    pub reader: String,
    pub badge: String,
    pub time: i64,
    pub publish: PublishOutcome,
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct Session<D: CardDriver> {
    driver: D,
    publisher: EventPublisher,
    extractor: IdentityExtractor,
    metrics: Arc<Metrics>,
    topic: String,
    empty_poll_interval: Duration,
    clock: Clock,
    last_time: Option<i64>,
    state: SessionState,
}

impl<D: CardDriver> Session<D> {
    pub fn new(driver: D, publisher: EventPublisher, config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            driver,
            publisher,
            extractor: IdentityExtractor::new(config.strip_status_word()),
            metrics,
            topic: config.topic().to_string(),
            empty_poll_interval: Duration::from_millis(config.empty_poll_interval_ms()),
            clock: Arc::new(epoch_ms),
            last_time: None,
            state: SessionState::Idle,
        }
    }

    /// Replace the wall clock used to stamp events
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run cycles until one fails. Only returns on a fatal error.
    pub async fn run(&mut self) -> Result<Infallible, BadgeError> {
        info!(topic = %self.topic, "session_started");
        loop {
            self.run_cycle().await?;
        }
    }

    /// Run one full cycle, from enumeration back to Idle
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, BadgeError> {
        self.metrics.record_cycle();
        self.transition(SessionState::Enumerating);
        let result = self.establish_and_run().await;
        self.transition(SessionState::Idle);

        if result.as_ref().is_ok_and(|o| *o == CycleOutcome::NoReaders) {
            self.metrics.record_idle_cycle();
            if !self.empty_poll_interval.is_zero() {
                tokio::time::sleep(self.empty_poll_interval).await;
            }
        }
        result
    }

    async fn establish_and_run(&mut self) -> Result<CycleOutcome, BadgeError> {
        let ctx = self.driver.establish()?;
        let (ctx, result) = self.cycle_with_context(ctx).await;
        match (ctx, result) {
            (Some(ctx), Ok(outcome)) => {
                ctx.release()?;
                Ok(outcome)
            }
            (Some(ctx), Err(e)) => {
                if let Err(release) = ctx.release() {
                    warn!(error = %release, "context_release_failed");
                }
                Err(e)
            }
            (None, result) => result,
        }
    }

    /// Everything between establishing and releasing the context. The
    /// context comes back unless a blocking task lost it.
    async fn cycle_with_context(
        &mut self,
        ctx: D::Context,
    ) -> (Option<D::Context>, Result<CycleOutcome, BadgeError>) {
        let readers = match enumerate_readers(&ctx) {
            Ok(readers) => readers,
            Err(e) => return (Some(ctx), Err(e.into())),
        };
        if readers.is_empty() {
            return (Some(ctx), Ok(CycleOutcome::NoReaders));
        }

        self.transition(SessionState::AwaitingPresence);
        let watched = readers.clone();
        let (ctx, found) =
            match run_blocking(ctx, move |ctx| wait_for_presence(ctx, &watched)).await {
                Ok(returned) => returned,
                Err(e) => return (None, Err(e)),
            };
        let index = match found {
            Ok(index) => index,
            Err(e) => return (Some(ctx), Err(e.into())),
        };
        let reader = readers[index].clone();
        info!(reader = %reader, index = %index, "card_present");

        self.transition(SessionState::Connected);
        let mut card = match connect_exclusive(&ctx, &reader) {
            Ok(card) => card,
            Err(e) => return (Some(ctx), Err(e.into())),
        };

        let (ctx, result) = self.swipe(ctx, &mut card, readers, index).await;

        let result = match (card.disconnect(Disposition::ResetCard), result) {
            (Ok(()), result) => result,
            (Err(e), Ok(_)) => Err(e.into()),
            (Err(e), Err(original)) => {
                warn!(error = %e, "card_disconnect_failed");
                Err(original)
            }
        };
        if result.is_ok() {
            debug!(reader = %reader, "card_released");
        }
        (ctx, result)
    }

    /// Extract, publish, and wait for the card to leave
    async fn swipe(
        &mut self,
        ctx: D::Context,
        card: &mut <D::Context as CardContext>::Card,
        readers: Vec<String>,
        index: usize,
    ) -> (Option<D::Context>, Result<CycleOutcome, BadgeError>) {
        self.transition(SessionState::Extracting);
        let badge = match self.extractor.extract(card) {
            Ok(badge) => badge,
            Err(e) => return (Some(ctx), Err(e.into())),
        };
        let time = self.next_timestamp();
        let reader = readers[index].clone();
        info!(
            reader = %reader,
            badge = %badge,
            time = %time,
            captured_at = %format_epoch_ms(time),
            "badge_captured"
        );
        self.metrics.record_swipe();

        self.transition(SessionState::Publishing);
        let publish = match self.publisher.publish(&self.topic, &badge, time).await {
            Ok(outcome) => outcome,
            Err(e) => return (Some(ctx), Err(e)),
        };
        if !publish.is_confirmed() {
            warn!(
                badge = %badge,
                delivered = %publish.delivered,
                failed = %publish.failed,
                unconfirmed = %publish.unconfirmed,
                "badge_not_confirmed"
            );
        }

        self.transition(SessionState::AwaitingRemoval);
        let (ctx, removed) =
            match run_blocking(ctx, move |ctx| wait_for_removal(ctx, &readers, index)).await {
                Ok(returned) => returned,
                Err(e) => return (None, Err(e)),
            };
        if let Err(e) = removed {
            return (Some(ctx), Err(e.into()));
        }
        info!(reader = %reader, "card_removed");

        (Some(ctx), Ok(CycleOutcome::Swiped(Swipe { reader, badge, time, publish })))
    }

    /// Capture instant in epoch ms, never earlier than the previous one
    fn next_timestamp(&mut self) -> i64 {
        let now = (self.clock)();
        let time = match self.last_time {
            Some(last) if now < last => {
                warn!(now = %now, last = %last, "clock_went_backwards");
                last
            }
            _ => now,
        };
        self.last_time = Some(time);
        time
    }

    fn transition(&mut self, to: SessionState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "illegal transition {} -> {}",
            self.state.as_str(),
            to.as_str()
        );
        debug!(from = %self.state.as_str(), to = %to.as_str(), "session_transition");
        self.state = to;
    }
}

/// Run a blocking driver call on the blocking pool, handing the context
/// back with its result. If the task panics or is cancelled the context is
/// lost (its destructor releases it) and the outer error is returned.
async fn run_blocking<C, T, F>(ctx: C, f: F) -> Result<(C, Result<T, DriverError>), BadgeError>
where
    C: CardContext,
    T: Send + 'static,
    F: FnOnce(&C) -> Result<T, DriverError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || {
        let result = f(&ctx);
        (ctx, result)
    });
    task.await.map_err(|e| {
        DriverError::new(DriverOp::StatusChange, format!("driver task failed: {}", e)).into()
    })
}
