//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `driver` - Smart-card driver traits (context, reader wait, card connection)
//! - `pcsc` - PC/SC implementation of the driver traits
//! - `broker` - Broker client traits and delivery reports
//! - `mqtt_producer` - MQTT implementation of the broker traits
//! - `mock` - Scripted driver and in-memory broker for tests and simulation

pub mod broker;
pub mod driver;
pub mod mock;
pub mod mqtt_producer;
pub mod pcsc;

// Re-export commonly used types
pub use broker::{BrokerClient, BrokerConnector, DeliveryReport, ProduceError};
pub use driver::{CardConnection, CardContext, CardDriver, Disposition, Protocols, ShareMode};
pub use mqtt_producer::MqttConnector;
pub use pcsc::PcscDriver;
