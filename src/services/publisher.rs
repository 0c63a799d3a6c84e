//! Event publisher - hands one badge event to the broker and waits for
//! confirmation
//!
//! Each call builds a fresh broker client, produces a single message,
//! drains delivery reports in a separate task while flushing, then closes
//! the client. Delivery failures are logged and counted but never returned
//! as errors: only failing to hand the message over at all is an error.

use crate::domain::{BadgeError, BadgeEvent};
use crate::infra::metrics::Metrics;
use crate::io::broker::{BrokerConnector, DeliveryReports};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// What became of the messages produced by one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub failed: usize,
    /// Still outstanding when the flush timed out
    pub unconfirmed: usize,
}

impl PublishOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.delivered > 0 && self.failed == 0 && self.unconfirmed == 0
    }
}

#[derive(Debug, Default)]
struct DrainTally {
    delivered: usize,
    failed: usize,
}

pub struct EventPublisher {
    connector: Arc<dyn BrokerConnector>,
    metrics: Arc<Metrics>,
    flush_timeout: Duration,
    drain_grace: Duration,
}

impl EventPublisher {
    pub fn new(connector: Arc<dyn BrokerConnector>, metrics: Arc<Metrics>) -> Self {
        Self {
            connector,
            metrics,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Publish one badge event to `topic`
    pub async fn publish(
        &self,
        topic: &str,
        badge: &str,
        observed_at_ms: i64,
    ) -> Result<PublishOutcome, BadgeError> {
        let started = Instant::now();
        let event = BadgeEvent::new(badge, observed_at_ms);
        let message = event.to_json().map_err(|e| BadgeError::publish(topic, e.to_string()))?;
        info!(topic = %topic, message = %message, "badge_message");

        let mut client =
            self.connector.connect().await.map_err(|e| BadgeError::publish(topic, e.0))?;
        let reports = client
            .delivery_reports()
            .ok_or_else(|| BadgeError::publish(topic, "delivery report stream unavailable"))?;
        let drain = tokio::spawn(drain_reports(reports, self.metrics.clone()));

        if let Err(e) = client.produce(topic, message.into_bytes()).await {
            client.close().await;
            drain.abort();
            return Err(BadgeError::publish(topic, e.0));
        }

        let unconfirmed = client.flush(self.flush_timeout).await;
        if unconfirmed > 0 {
            warn!(
                topic = %topic,
                unconfirmed = %unconfirmed,
                timeout_ms = %self.flush_timeout.as_millis(),
                "publish_flush_timeout"
            );
            self.metrics.record_unconfirmed(unconfirmed as u64);
        }
        client.close().await;

        // Closing ended the report stream; give the drain a moment to log
        // what is left, then abandon it.
        let tally = await_drain(drain, self.drain_grace).await;

        let latency_us = started.elapsed().as_micros() as u64;
        self.metrics.record_publish_latency(latency_us);

        // Failures reported on close are the unconfirmed messages, already
        // counted above
        let failed = tally.failed.saturating_sub(unconfirmed);
        if failed > 0 {
            self.metrics.record_delivery_failed(failed as u64);
        }

        Ok(PublishOutcome { delivered: tally.delivered, failed, unconfirmed })
    }
}

async fn drain_reports(mut reports: DeliveryReports, metrics: Arc<Metrics>) -> DrainTally {
    let mut tally = DrainTally::default();
    while let Some(report) = reports.recv().await {
        match &report.result {
            Ok(()) => {
                tally.delivered += 1;
                metrics.record_delivery_confirmed();
                info!(topic = %report.topic, value = %report.payload_str(), "badge_delivered");
            }
            Err(detail) => {
                tally.failed += 1;
                let err = BadgeError::delivery(report.topic.as_str(), detail.as_str());
                error!(error = %err, value = %report.payload_str(), "badge_delivery_failed");
            }
        }
    }
    tally
}

async fn await_drain(
    mut drain: tokio::task::JoinHandle<DrainTally>,
    grace: Duration,
) -> DrainTally {
    match tokio::time::timeout(grace, &mut drain).await {
        Ok(Ok(tally)) => tally,
        Ok(Err(e)) => {
            warn!(error = %e, "delivery_drain_failed");
            DrainTally::default()
        }
        Err(_) => {
            warn!(grace_ms = %grace.as_millis(), "delivery_drain_abandoned");
            drain.abort();
            DrainTally::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::{DeliveryBehavior, MockBroker};

    fn publisher(broker: &MockBroker) -> (EventPublisher, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let publisher = EventPublisher::new(Arc::new(broker.clone()), metrics.clone());
        (publisher, metrics)
    }

    #[tokio::test]
    async fn test_publish_confirmed() {
        let broker = MockBroker::confirming();
        let (publisher, metrics) = publisher(&broker);

        let outcome = publisher.publish("badge-reader", "041a2b3c", 1_700_000_000_000).await.unwrap();

        assert!(outcome.is_confirmed());
        assert_eq!(outcome, PublishOutcome { delivered: 1, failed: 0, unconfirmed: 0 });
        assert_eq!(
            broker.produced(),
            vec![(
                "badge-reader".to_string(),
                r#"{"badge":"041a2b3c","time":1700000000000}"#.to_string()
            )]
        );
        assert_eq!(metrics.deliveries_confirmed(), 1);
    }

    #[tokio::test]
    async fn test_one_client_per_event() {
        let broker = MockBroker::confirming();
        let (publisher, _metrics) = publisher(&broker);

        publisher.publish("t", "01", 1).await.unwrap();
        publisher.publish("t", "02", 2).await.unwrap();

        assert_eq!(broker.connects(), 2);
        assert_eq!(broker.closes(), 2);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_not_an_error() {
        let broker = MockBroker::new(DeliveryBehavior::Fail("partition leader unavailable".into()));
        let (publisher, metrics) = publisher(&broker);

        let outcome = publisher.publish("badge-reader", "041a2b3c", 5).await.unwrap();

        assert_eq!(outcome, PublishOutcome { delivered: 0, failed: 1, unconfirmed: 0 });
        assert_eq!(metrics.deliveries_failed(), 1);
        // No retry
        assert_eq!(broker.produced().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_timeout_bounds_wait() {
        let broker = MockBroker::new(DeliveryBehavior::Silent);
        let (publisher, metrics) = publisher(&broker);
        let publisher = publisher.with_flush_timeout(Duration::from_millis(20));

        let started = Instant::now();
        let outcome = publisher.publish("t", "ab", 1).await.unwrap();

        assert_eq!(outcome, PublishOutcome { delivered: 0, failed: 0, unconfirmed: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(broker.closes(), 1);

        // Counted once, as unconfirmed
        let summary = metrics.report();
        assert_eq!(summary.deliveries_unconfirmed, 1);
        assert_eq!(summary.deliveries_failed, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_publish_error() {
        let broker = MockBroker::refusing("no route to broker");
        let (publisher, _metrics) = publisher(&broker);

        let err = publisher.publish("badge-reader", "041a2b3c", 5).await.unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::Publish);
        assert_eq!(err.exit_code(), 1);
        assert!(broker.produced().is_empty());
    }
}
