//! MQTT producer for badge events
//!
//! Implements the broker traits over `rumqttc`. Messages go out at QoS 1 and
//! a PUBACK from the broker counts as delivery confirmation. Each client owns
//! its own event loop task; the first connection error fails every
//! outstanding message and ends the client (no reconnect, since a client
//! lives for a single event).
//!
//! Recognized properties:
//! - `bootstrap.servers` - `host:port[,host:port...]`, first entry used
//! - `client.id` - defaults to `badge-reader-<pid>`
//! - `sasl.username` / `sasl.password` - broker credentials
//! - `keep.alive.ms` - keep-alive interval, at least 5000

use crate::domain::BadgeError;
use crate::infra::properties::Properties;
use crate::io::broker::{
    BrokerClient, BrokerConnector, DeliveryReport, DeliveryReports, ProduceError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_MS: u64 = 30_000;
const MIN_KEEP_ALIVE_MS: u64 = 5_000;
const REQUEST_CAPACITY: usize = 16;
/// How long `close` lets the event loop send DISCONNECT before aborting it
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

const KNOWN_KEYS: [&str; 5] =
    ["bootstrap.servers", "client.id", "sasl.username", "sasl.password", "keep.alive.ms"];

/// Validated MQTT connection settings
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    client_id: String,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
}

impl MqttConnector {
    /// Build connection settings from broker properties
    pub fn from_properties(props: &Properties) -> Result<Self, BadgeError> {
        let servers = props
            .get("bootstrap.servers")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BadgeError::configuration("bootstrap.servers is not set"))?;
        let (host, port) = parse_server(servers)?;

        let client_id = props
            .get("client.id")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("badge-reader-{}", std::process::id()));

        let credentials = match (props.get("sasl.username"), props.get("sasl.password")) {
            (Some(user), Some(pass)) => Some((user.to_string(), pass.to_string())),
            (None, None) => None,
            _ => {
                return Err(BadgeError::configuration(
                    "sasl.username and sasl.password must be set together",
                ))
            }
        };

        let keep_alive_ms = match props.get("keep.alive.ms") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                BadgeError::configuration(format!("keep.alive.ms is not a number: {}", raw))
            })?,
            None => DEFAULT_KEEP_ALIVE_MS,
        };
        if keep_alive_ms < MIN_KEEP_ALIVE_MS {
            return Err(BadgeError::configuration(format!(
                "keep.alive.ms must be at least {}",
                MIN_KEEP_ALIVE_MS
            )));
        }

        for key in props.keys().filter(|k| !KNOWN_KEYS.contains(k)) {
            debug!(key = %key, "broker_property_ignored");
        }

        Ok(Self {
            host,
            port,
            client_id,
            credentials,
            keep_alive: Duration::from_millis(keep_alive_ms),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username.clone(), password.clone());
        }
        options
    }
}

fn parse_server(servers: &str) -> Result<(String, u16), BadgeError> {
    let first = servers.split(',').map(str::trim).find(|s| !s.is_empty()).unwrap_or_default();
    match first.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                BadgeError::configuration(format!("invalid port in bootstrap.servers: {}", first))
            })?;
            if host.is_empty() {
                return Err(BadgeError::configuration(format!(
                    "missing host in bootstrap.servers: {}",
                    first
                )));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((first.to_string(), DEFAULT_PORT)),
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerClient>, ProduceError> {
        let (client, eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (outstanding_tx, outstanding_rx) = watch::channel(0usize);

        let tracker = Arc::new(Mutex::new(Tracker::new(reports_tx, outstanding_tx)));
        let loop_handle = tokio::spawn(drive_event_loop(eventloop, tracker.clone()));

        debug!(host = %self.host, port = %self.port, client_id = %self.client_id, "mqtt_producer_created");

        Ok(Box::new(MqttProducer {
            client,
            tracker,
            reports: Some(reports_rx),
            outstanding: outstanding_rx,
            loop_handle: Some(loop_handle),
        }))
    }
}

struct Pending {
    seq: u64,
    topic: String,
    payload: Vec<u8>,
}

/// Bookkeeping shared between the producer and its event loop task
struct Tracker {
    next_seq: u64,
    /// Handed to rumqttc, packet id not yet assigned
    queued: VecDeque<Pending>,
    /// Written to the socket, waiting for PUBACK
    inflight: HashMap<u16, Pending>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
    outstanding: watch::Sender<usize>,
    /// Set once the connection has failed or the client was closed
    failure: Option<String>,
}

impl Tracker {
    fn new(
        reports: mpsc::UnboundedSender<DeliveryReport>,
        outstanding: watch::Sender<usize>,
    ) -> Self {
        Self {
            next_seq: 0,
            queued: VecDeque::new(),
            inflight: HashMap::new(),
            reports: Some(reports),
            outstanding,
            failure: None,
        }
    }

    /// Register a message about to be handed to rumqttc. Returns `None` when
    /// the client is already dead, in which case the failure has been
    /// reported.
    fn enqueue(&mut self, topic: &str, payload: Vec<u8>) -> Option<u64> {
        if let Some(reason) = self.failure.clone() {
            self.report(DeliveryReport::failed(topic, payload, reason));
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.push_back(Pending { seq, topic: topic.to_string(), payload });
        self.update_outstanding();
        Some(seq)
    }

    /// Withdraw a message rumqttc refused. False if it was already settled.
    fn cancel(&mut self, seq: u64) -> bool {
        let before = self.queued.len();
        self.queued.retain(|p| p.seq != seq);
        let removed = self.queued.len() != before;
        self.update_outstanding();
        removed
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(pending) = self.queued.pop_front() {
            self.inflight.insert(pkid, pending);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(pending) = self.inflight.remove(&pkid) {
            self.report(DeliveryReport::delivered(pending.topic, pending.payload));
            self.update_outstanding();
        }
    }

    fn fail_all(&mut self, reason: &str) {
        if self.failure.is_none() {
            self.failure = Some(reason.to_string());
        }
        let mut drained: Vec<Pending> = self.inflight.drain().map(|(_, p)| p).collect();
        drained.extend(self.queued.drain(..));
        drained.sort_by_key(|p| p.seq);
        for pending in drained {
            self.report(DeliveryReport::failed(pending.topic, pending.payload, reason));
        }
        self.update_outstanding();
    }

    fn report(&self, report: DeliveryReport) {
        if let Some(tx) = &self.reports {
            let _ = tx.send(report);
        }
    }

    fn update_outstanding(&self) {
        self.outstanding.send_replace(self.queued.len() + self.inflight.len());
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, tracker: Arc<Mutex<Tracker>>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!("mqtt_producer_connected");
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                tracker.lock().sent(pkid);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                tracker.lock().acked(ack.pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt_producer_disconnected");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt_producer_connection_error");
                tracker.lock().fail_all(&e.to_string());
                return;
            }
        }
    }
}

/// One-shot MQTT client
pub struct MqttProducer {
    client: AsyncClient,
    tracker: Arc<Mutex<Tracker>>,
    reports: Option<DeliveryReports>,
    outstanding: watch::Receiver<usize>,
    loop_handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl BrokerClient for MqttProducer {
    fn delivery_reports(&mut self) -> Option<DeliveryReports> {
        self.reports.take()
    }

    async fn produce(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), ProduceError> {
        let Some(seq) = self.tracker.lock().enqueue(topic, payload.clone()) else {
            return Ok(());
        };

        if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, false, payload).await {
            let mut tracker = self.tracker.lock();
            // A dead event loop has already reported the message as failed
            if tracker.failure.is_none() && tracker.cancel(seq) {
                return Err(ProduceError(e.to_string()));
            }
        }
        Ok(())
    }

    async fn flush(&mut self, timeout: Duration) -> usize {
        let mut outstanding = self.outstanding.clone();
        let settled = matches!(
            tokio::time::timeout(timeout, outstanding.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if settled {
            0
        } else {
            let remaining = *outstanding.borrow();
            remaining
        }
    }

    async fn close(&mut self) {
        {
            let mut tracker = self.tracker.lock();
            let remaining = tracker.queued.len() + tracker.inflight.len();
            if remaining > 0 {
                info!(remaining = %remaining, "mqtt_producer_closing_with_outstanding");
            }
            tracker.fail_all("client closed before acknowledgement");
            // Ends the delivery report stream
            tracker.reports = None;
        }

        let _ = self.client.try_disconnect();
        if let Some(mut handle) = self.loop_handle.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

impl Drop for MqttProducer {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(content: &str) -> Properties {
        Properties::parse(content).unwrap()
    }

    #[test]
    fn test_from_properties_defaults() {
        let connector = MqttConnector::from_properties(&props("bootstrap.servers=broker.local")).unwrap();
        assert_eq!(connector.host(), "broker.local");
        assert_eq!(connector.port(), 1883);
        assert!(connector.client_id().starts_with("badge-reader-"));
        assert_eq!(connector.keep_alive, Duration::from_secs(30));
        assert!(connector.credentials.is_none());
    }

    #[test]
    fn test_from_properties_full() {
        let connector = MqttConnector::from_properties(&props(
            "bootstrap.servers = mq1:8883, mq2:8883\n\
             client.id = lobby-reader\n\
             sasl.username = reader\n\
             sasl.password = s3cr=t\n\
             keep.alive.ms = 10000\n\
             acks = all\n",
        ))
        .unwrap();
        assert_eq!(connector.host(), "mq1");
        assert_eq!(connector.port(), 8883);
        assert_eq!(connector.client_id(), "lobby-reader");
        assert_eq!(connector.credentials, Some(("reader".to_string(), "s3cr=t".to_string())));
        assert_eq!(connector.keep_alive, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_servers_is_configuration_error() {
        let err = MqttConnector::from_properties(&props("client.id=x")).unwrap_err();
        assert_eq!(err.to_string(), "configuration failure: bootstrap.servers is not set");
    }

    #[test]
    fn test_bad_port_rejected() {
        assert!(MqttConnector::from_properties(&props("bootstrap.servers=host:abc")).is_err());
        assert!(MqttConnector::from_properties(&props("bootstrap.servers=:1883")).is_err());
    }

    #[test]
    fn test_half_credentials_rejected() {
        let err = MqttConnector::from_properties(&props(
            "bootstrap.servers=localhost:1883\nsasl.username=reader",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("sasl.username and sasl.password"));
    }

    #[test]
    fn test_short_keep_alive_rejected() {
        let err = MqttConnector::from_properties(&props(
            "bootstrap.servers=localhost:1883\nkeep.alive.ms=100",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("keep.alive.ms"));
    }

    #[test]
    fn test_tracker_ack_flow() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = watch::channel(0usize);
        let mut tracker = Tracker::new(tx, out_tx);

        let seq = tracker.enqueue("badges", b"{}".to_vec());
        assert_eq!(seq, Some(0));
        assert_eq!(*out_rx.borrow(), 1);

        tracker.sent(7);
        // Unknown packet id is ignored
        tracker.acked(8);
        assert_eq!(*out_rx.borrow(), 1);

        tracker.acked(7);
        assert_eq!(*out_rx.borrow(), 0);
        let report = rx.try_recv().unwrap();
        assert!(report.is_delivered());
        assert_eq!(report.topic, "badges");
    }

    #[test]
    fn test_tracker_fail_all_reports_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = watch::channel(0usize);
        let mut tracker = Tracker::new(tx, out_tx);

        tracker.enqueue("t", b"a".to_vec());
        tracker.enqueue("t", b"b".to_vec());
        tracker.sent(1);
        tracker.fail_all("connection refused");

        assert_eq!(*out_rx.borrow(), 0);
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.payload, b"a".to_vec());
        assert_eq!(second.payload, b"b".to_vec());
        assert_eq!(first.result, Err("connection refused".to_string()));

        // Once dead, new messages fail straight away
        assert_eq!(tracker.enqueue("t", b"c".to_vec()), None);
        assert!(!rx.try_recv().unwrap().is_delivered());
    }

    /// Producer whose event loop is never polled
    fn idle_producer() -> MqttProducer {
        let (client, _eventloop) =
            AsyncClient::new(MqttOptions::new("flush-test", "127.0.0.1", 1883), REQUEST_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = watch::channel(0usize);
        MqttProducer {
            client,
            tracker: Arc::new(Mutex::new(Tracker::new(tx, out_tx))),
            reports: Some(rx),
            outstanding: out_rx,
            loop_handle: None,
        }
    }

    #[tokio::test]
    async fn test_flush_returns_outstanding_after_timeout() {
        let mut producer = idle_producer();
        producer.tracker.lock().enqueue("badges", b"{}".to_vec());

        assert_eq!(producer.flush(Duration::from_millis(20)).await, 1);

        producer.tracker.lock().sent(1);
        producer.tracker.lock().acked(1);
        assert_eq!(producer.flush(Duration::from_millis(20)).await, 0);
    }

    #[test]
    fn test_tracker_cancel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = watch::channel(0usize);
        let mut tracker = Tracker::new(tx, out_tx);

        let seq = tracker.enqueue("t", b"a".to_vec()).unwrap();
        assert!(tracker.cancel(seq));
        assert!(!tracker.cancel(seq));
        assert_eq!(*out_rx.borrow(), 0);
    }
}
