//! Badge simulator - runs the capture loop against a scripted reader
//!
//! Each UID given on the command line is placed on a reader and taken off
//! again, round-robin across the simulated readers. Events go to the broker
//! from the properties file, or to an in-memory broker with `--dry-run`.
//!
//! Usage:
//!   cargo run --bin badge-sim -- --readers 2 041a2b3c deadbeef
//!   cargo run --bin badge-sim -- --dry-run --fail-delivery 041a2b3c

use anyhow::Context;
use badge_reader::infra::{Config, Metrics, Properties};
use badge_reader::io::mock::{DeliveryBehavior, MockBroker, MockDriver, Step};
use badge_reader::io::{BrokerConnector, MqttConnector};
use badge_reader::services::{CycleOutcome, EventPublisher, Session};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "badge-sim")]
#[command(about = "Simulated badge swipes through the real capture loop")]
struct Args {
    /// Badge UIDs to swipe, as hex
    #[arg(required = true)]
    uids: Vec<String>,

    /// Number of simulated readers
    #[arg(long, default_value = "1")]
    readers: usize,

    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE", default_value = badge_reader::infra::config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Broker properties file (overrides the config)
    #[arg(short, long)]
    properties: Option<String>,

    /// Publish to an in-memory broker instead of a real one
    #[arg(long)]
    dry_run: bool,

    /// With --dry-run, report every delivery as failed
    #[arg(long)]
    fail_delivery: bool,

    /// Strip a trailing 90 00 from the simulated UID responses
    #[arg(long)]
    strip_status_word: bool,
}

fn reader_name(index: usize) -> String {
    format!("Sim Reader {:02}", index)
}

/// Insert/remove steps for each UID, round-robin across readers
fn swipe_script(uids: &[Vec<u8>], readers: usize) -> Vec<Step> {
    uids.iter()
        .enumerate()
        .flat_map(|(i, uid)| {
            let reader = reader_name(i % readers);
            [Step::insert(reader.clone(), uid.clone()), Step::remove(reader)]
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.readers > 0, "--readers must be at least 1");

    let uids = args
        .uids
        .iter()
        .map(|u| hex::decode(u).with_context(|| format!("invalid hex UID: {}", u)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut config = Config::load_from_path(&args.config)?;
    if args.strip_status_word {
        config = config.with_strip_status_word(true);
    }

    let broker = MockBroker::new(if args.fail_delivery {
        DeliveryBehavior::Fail("simulated delivery failure".to_string())
    } else {
        DeliveryBehavior::Confirm
    });
    let connector: Arc<dyn BrokerConnector> = if args.dry_run {
        Arc::new(broker.clone())
    } else {
        let path = args.properties.as_deref().unwrap_or(config.properties_file());
        let properties = Properties::from_file(path)?;
        Arc::new(MqttConnector::from_properties(&properties)?)
    };

    let driver = MockDriver::with_readers((0..args.readers).map(reader_name));
    driver.script(swipe_script(&uids, args.readers));

    let metrics = Arc::new(Metrics::new());
    let publisher = EventPublisher::new(connector, metrics.clone())
        .with_flush_timeout(Duration::from_millis(config.flush_timeout_ms()))
        .with_drain_grace(Duration::from_millis(config.drain_grace_ms()));
    let mut session = Session::new(driver.clone(), publisher, &config, metrics.clone());

    info!(swipes = %uids.len(), readers = %args.readers, dry_run = %args.dry_run, "sim_started");

    while driver.remaining_steps() > 0 {
        if let CycleOutcome::Swiped(swipe) = session.run_cycle().await? {
            info!(
                reader = %swipe.reader,
                badge = %swipe.badge,
                time = %swipe.time,
                confirmed = %swipe.publish.is_confirmed(),
                "sim_swipe"
            );
        }
    }

    metrics.report().log();
    if args.dry_run {
        for (topic, payload) in broker.produced() {
            println!("{} {}", topic, payload);
        }
    }
    Ok(())
}
