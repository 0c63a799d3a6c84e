//! Badge reader daemon
//!
//! Watches every attached smart-card reader, reads the UID of each badge
//! placed on one, and publishes `{"badge":"<hex>","time":<ms>}` to the
//! broker. Runs until a fatal failure, then exits with status 1.
//!
//! Module structure:
//! - `domain/` - Badge events, reader observations, error policy
//! - `io/` - Card driver (PC/SC) and broker client (MQTT)
//! - `services/` - Presence, identity, publishing, removal, session loop
//! - `infra/` - Config, broker properties, metrics

use badge_reader::domain::BadgeError;
use badge_reader::infra::config::DEFAULT_CONFIG_PATH;
use badge_reader::infra::{Config, Metrics, Properties};
use badge_reader::io::{MqttConnector, PcscDriver};
use badge_reader::services::{EventPublisher, Session};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Badge reader - publishes smart-card swipes to a message broker
#[derive(Parser, Debug)]
#[command(name = "badge-reader", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the broker properties file from the config
    #[arg(short, long)]
    properties: Option<String>,
}

#[tokio::main]
async fn main() {
    // Default: INFO, use RUST_LOG=debug to see session transitions
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "badge-reader starting");

    let err = match run(args).await {
        Ok(never) => match never {},
        Err(e) => e,
    };
    error!(kind = ?err.kind(), error = %err, "badge_reader_fatal");
    eprintln!("badge-reader: {}", err);
    std::process::exit(err.exit_code());
}

async fn run(args: Args) -> Result<std::convert::Infallible, BadgeError> {
    let config = Config::load_from_path(&args.config)?;

    let properties_file = args.properties.as_deref().unwrap_or(config.properties_file());
    let properties = Properties::from_file(properties_file)?;
    let connector = MqttConnector::from_properties(&properties)?;

    info!(
        config_file = %config.config_file(),
        properties_file = %properties_file,
        broker_host = %connector.host(),
        broker_port = %connector.port(),
        client_id = %connector.client_id(),
        topic = %config.topic(),
        flush_timeout_ms = %config.flush_timeout_ms(),
        strip_status_word = %config.strip_status_word(),
        "config_loaded"
    );

    let metrics = Arc::new(Metrics::new());

    // Start metrics reporter (lock-free reads)
    let metrics_interval = config.metrics_interval_secs();
    if metrics_interval > 0 {
        let reporter = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                reporter.report().log();
            }
        });
    }

    let publisher = EventPublisher::new(Arc::new(connector), metrics.clone())
        .with_flush_timeout(Duration::from_millis(config.flush_timeout_ms()))
        .with_drain_grace(Duration::from_millis(config.drain_grace_ms()));

    let mut session = Session::new(PcscDriver::new(), publisher, &config, metrics);
    session.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_flag_overrides_default() {
        let args = Args::try_parse_from(["badge-reader", "--config", "config/lobby.toml"]).unwrap();
        assert_eq!(args.config, "config/lobby.toml");
        assert!(args.properties.is_none());

        let args = Args::try_parse_from(["badge-reader", "-c", "dock.toml", "-p", "dock.props"])
            .unwrap();
        assert_eq!(args.config, "dock.toml");
        assert_eq!(args.properties.as_deref(), Some("dock.props"));
    }

    #[test]
    fn test_config_defaults_without_flag() {
        // CONFIG_FILE is not set in the test environment
        if std::env::var("CONFIG_FILE").is_err() {
            let args = Args::try_parse_from(["badge-reader"]).unwrap();
            assert_eq!(args.config, DEFAULT_CONFIG_PATH);
        }
    }
}
