//! Scripted card driver and in-memory broker
//!
//! These stand in for PC/SC and MQTT in tests and in the `badge-sim`
//! binary. The driver follows PC/SC status-change semantics: a wait returns
//! immediately when any observation's `current_state` differs from the
//! reader's actual state, otherwise it "blocks" by applying the next
//! scripted step. An exhausted script fails the wait, so a test can never
//! hang on it. Like pcsclite, each reader carries an event counter bumped on
//! every insertion or removal; a caller that does not echo it back sees the
//! wait return over and over, which the mock turns into an error.

use crate::domain::{DriverError, DriverOp, EventState, ReaderObservation};
use crate::io::broker::{
    BrokerClient, BrokerConnector, DeliveryReport, DeliveryReports, ProduceError,
};
use crate::io::driver::{
    CardConnection, CardContext, CardDriver, Disposition, Protocols, ShareMode,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Counter-only returns tolerated in a row before a wait fails
const MAX_SPURIOUS_RETURNS: usize = 16;

/// One scripted hardware change, applied when a wait would block
#[derive(Debug, Clone)]
pub enum Step {
    /// Card with the given transmit response placed on a reader
    Insert { reader: String, response: Vec<u8> },
    /// Card taken off a reader
    Remove { reader: String },
    /// Several changes observed by a single wait
    Batch(Vec<Step>),
    /// The wait itself fails
    Fail(String),
}

impl Step {
    pub fn insert(reader: impl Into<String>, response: impl Into<Vec<u8>>) -> Self {
        Step::Insert { reader: reader.into(), response: response.into() }
    }

    pub fn remove(reader: impl Into<String>) -> Self {
        Step::Remove { reader: reader.into() }
    }
}

#[derive(Debug, Default)]
struct DriverState {
    readers: Vec<String>,
    /// Actual state per reader
    states: HashMap<String, EventState>,
    /// Transmit response of the card on each reader
    cards: HashMap<String, Vec<u8>>,
    /// Event counter per reader
    counters: HashMap<String, u32>,
    script: VecDeque<Step>,
    /// Consecutive waits that returned only because of a counter mismatch
    spurious_returns: usize,
    fail_transmit: Option<String>,
    wait_calls: usize,
    contexts_established: usize,
    contexts_released: usize,
    open_connections: usize,
    max_open_connections: usize,
    connects: Vec<String>,
    apdus: Vec<Vec<u8>>,
    disconnects: Vec<Disposition>,
}

impl DriverState {
    fn apply(&mut self, step: Step) -> Result<(), DriverError> {
        match step {
            Step::Insert { reader, response } => {
                self.states.insert(reader.clone(), EventState::PRESENT);
                *self.counters.entry(reader.clone()).or_default() += 1;
                self.cards.insert(reader, response);
            }
            Step::Remove { reader } => {
                self.states.insert(reader.clone(), EventState::EMPTY);
                *self.counters.entry(reader.clone()).or_default() += 1;
                self.cards.remove(&reader);
            }
            Step::Batch(steps) => {
                for step in steps {
                    self.apply(step)?;
                }
            }
            Step::Fail(message) => return Err(DriverError::new(DriverOp::StatusChange, message)),
        }
        Ok(())
    }

    /// State flags plus event counter
    fn actual(&self, reader: &str) -> EventState {
        let state = self.states.get(reader).copied().unwrap_or(EventState::UNKNOWN);
        state.with_event_count(self.counters.get(reader).copied().unwrap_or_default())
    }
}

/// Scripted driver. Clones share state, so a test can keep one handle for
/// assertions while the session owns another.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<DriverState>>,
}

impl MockDriver {
    /// Driver with the given readers attached, all empty
    pub fn with_readers<I, S>(readers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let readers: Vec<String> = readers.into_iter().map(Into::into).collect();
        let states = readers.iter().map(|r| (r.clone(), EventState::EMPTY)).collect();
        Self {
            state: Arc::new(Mutex::new(DriverState { readers, states, ..Default::default() })),
        }
    }

    /// Append steps to the script
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) -> &Self {
        self.state.lock().script.extend(steps);
        self
    }

    /// Make every transmit fail with `message`
    pub fn fail_transmit(&self, message: impl Into<String>) -> &Self {
        self.state.lock().fail_transmit = Some(message.into());
        self
    }

    pub fn remaining_steps(&self) -> usize {
        self.state.lock().script.len()
    }

    pub fn wait_calls(&self) -> usize {
        self.state.lock().wait_calls
    }

    pub fn contexts_established(&self) -> usize {
        self.state.lock().contexts_established
    }

    pub fn contexts_released(&self) -> usize {
        self.state.lock().contexts_released
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    pub fn max_open_connections(&self) -> usize {
        self.state.lock().max_open_connections
    }

    pub fn connects(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    pub fn apdus(&self) -> Vec<Vec<u8>> {
        self.state.lock().apdus.clone()
    }

    pub fn disconnects(&self) -> Vec<Disposition> {
        self.state.lock().disconnects.clone()
    }
}

impl CardDriver for MockDriver {
    type Context = MockContext;

    fn establish(&self) -> Result<MockContext, DriverError> {
        self.state.lock().contexts_established += 1;
        Ok(MockContext { state: self.state.clone() })
    }
}

pub struct MockContext {
    state: Arc<Mutex<DriverState>>,
}

impl CardContext for MockContext {
    type Card = MockCard;

    fn list_readers(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.state.lock().readers.clone())
    }

    fn get_status_change(
        &self,
        observations: &mut [ReaderObservation],
        _timeout: Option<Duration>,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.wait_calls += 1;

        loop {
            let changed = observations
                .iter()
                .any(|obs| obs.current_state.acknowledged() != state.actual(&obs.name));
            if changed {
                let flags_changed = observations.iter().any(|obs| {
                    obs.current_state.acknowledged().bits() & EventState::STATE_MASK
                        != state.actual(&obs.name).bits() & EventState::STATE_MASK
                });
                if flags_changed {
                    state.spurious_returns = 0;
                } else {
                    state.spurious_returns += 1;
                    if state.spurious_returns > MAX_SPURIOUS_RETURNS {
                        return Err(DriverError::new(
                            DriverOp::StatusChange,
                            "status wait spinning: event counter not echoed back",
                        ));
                    }
                }
                for obs in observations.iter_mut() {
                    let actual = state.actual(&obs.name);
                    obs.event_state = if obs.current_state.acknowledged() != actual {
                        actual | EventState::CHANGED
                    } else {
                        actual
                    };
                }
                return Ok(());
            }

            let step = state.script.pop_front().ok_or_else(|| {
                DriverError::new(DriverOp::StatusChange, "mock script exhausted")
            })?;
            state.apply(step)?;
        }
    }

    fn connect(
        &self,
        reader: &str,
        _share: ShareMode,
        _protocols: Protocols,
    ) -> Result<MockCard, DriverError> {
        let mut state = self.state.lock();
        let response = state
            .cards
            .get(reader)
            .cloned()
            .ok_or_else(|| DriverError::new(DriverOp::Connect, format!("no card in {}", reader)))?;
        state.connects.push(reader.to_string());
        state.open_connections += 1;
        state.max_open_connections = state.max_open_connections.max(state.open_connections);
        Ok(MockCard { state: self.state.clone(), response })
    }

    fn release(self) -> Result<(), DriverError> {
        self.state.lock().contexts_released += 1;
        Ok(())
    }
}

pub struct MockCard {
    state: Arc<Mutex<DriverState>>,
    response: Vec<u8>,
}

impl CardConnection for MockCard {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, DriverError> {
        let mut state = self.state.lock();
        state.apdus.push(apdu.to_vec());
        if let Some(message) = &state.fail_transmit {
            return Err(DriverError::new(DriverOp::Transmit, message.clone()));
        }
        Ok(self.response.clone())
    }

    fn disconnect(self, disposition: Disposition) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.open_connections -= 1;
        state.disconnects.push(disposition);
        Ok(())
    }
}

/// How the in-memory broker answers produced messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryBehavior {
    Confirm,
    Fail(String),
    /// Never answer; flush times out
    Silent,
}

#[derive(Debug, Default)]
struct BrokerState {
    produced: Vec<(String, Vec<u8>)>,
    connects: usize,
    closes: usize,
}

/// In-memory broker
#[derive(Debug, Clone)]
pub struct MockBroker {
    behavior: DeliveryBehavior,
    refuse_connect: Option<String>,
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new(behavior: DeliveryBehavior) -> Self {
        Self { behavior, refuse_connect: None, state: Arc::default() }
    }

    pub fn confirming() -> Self {
        Self::new(DeliveryBehavior::Confirm)
    }

    /// Broker whose clients cannot be constructed
    pub fn refusing(message: impl Into<String>) -> Self {
        Self { refuse_connect: Some(message.into()), ..Self::confirming() }
    }

    /// Produced messages as (topic, payload text)
    pub fn produced(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .produced
            .iter()
            .map(|(t, p)| (t.clone(), String::from_utf8_lossy(p).into_owned()))
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerClient>, ProduceError> {
        if let Some(message) = &self.refuse_connect {
            return Err(ProduceError(message.clone()));
        }
        self.state.lock().connects += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(MockClient {
            behavior: self.behavior.clone(),
            state: self.state.clone(),
            tx: Some(tx),
            rx: Some(rx),
            outstanding: Vec::new(),
        }))
    }
}

struct MockClient {
    behavior: DeliveryBehavior,
    state: Arc<Mutex<BrokerState>>,
    tx: Option<mpsc::UnboundedSender<DeliveryReport>>,
    rx: Option<DeliveryReports>,
    outstanding: Vec<(String, Vec<u8>)>,
}

impl MockClient {
    fn report(&self, report: DeliveryReport) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(report);
        }
    }
}

#[async_trait]
impl BrokerClient for MockClient {
    fn delivery_reports(&mut self) -> Option<DeliveryReports> {
        self.rx.take()
    }

    async fn produce(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), ProduceError> {
        if self.tx.is_none() {
            return Err(ProduceError("client closed".to_string()));
        }
        self.state.lock().produced.push((topic.to_string(), payload.clone()));
        match &self.behavior {
            DeliveryBehavior::Confirm => self.report(DeliveryReport::delivered(topic, payload)),
            DeliveryBehavior::Fail(error) => {
                self.report(DeliveryReport::failed(topic, payload, error.clone()))
            }
            DeliveryBehavior::Silent => self.outstanding.push((topic.to_string(), payload)),
        }
        Ok(())
    }

    async fn flush(&mut self, timeout: Duration) -> usize {
        if !self.outstanding.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        self.outstanding.len()
    }

    async fn close(&mut self) {
        for (topic, payload) in std::mem::take(&mut self.outstanding) {
            self.report(DeliveryReport::failed(topic, payload, "client closed before acknowledgement"));
        }
        self.tx = None;
        self.state.lock().closes += 1;
    }
}
