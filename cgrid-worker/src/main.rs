//! cgrid charging-post worker.
//!
//! One process per post. Subscribes to its command topic, answers
//! availability queries and PREPARE votes, applies COMMIT/ABORT decisions,
//! and runs the time-passage sweep that turns ended COMMITTED reservations
//! into charged notices.

use std::sync::Arc;

use chrono::{Duration as TimeDelta, Utc};
use clap::Parser;
use parking_lot::Mutex;
use rumqttc::QoS;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use cgrid_core::fabric::Fabric;
use cgrid_core::post::PostState;
use cgrid_core::types::{topics, WorkerCommand};
use cgrid_core::{CgridResult, WorkerConfig};

/// cgrid charging-post worker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Post id, e.g. CP001
    #[arg(short, long, default_value = "CP001")]
    id: String,

    /// Operator owning this post
    #[arg(short, long)]
    operator: String,

    /// MQTT broker URL
    #[arg(long, default_value = "tcp://localhost:1883")]
    mqtt_broker: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = WorkerConfig::new(args.id, args.operator).with_mqtt_broker(args.mqtt_broker);
    config.validate()?;

    run(config).await?;
    Ok(())
}

async fn run(config: WorkerConfig) -> CgridResult<()> {
    let client_id = format!("cp-{}-{}", config.operator_name, config.worker_id);
    let fabric = Fabric::connect(&config.mqtt_broker_url, &client_id).await?;

    let post = Arc::new(Mutex::new(PostState::new(config.worker_id.clone())));

    let command_topic = topics::worker_command(&config.operator_name, &config.worker_id);
    let response_topic = topics::worker_response(&config.operator_name, &config.worker_id);
    let event_topic = topics::worker_event(&config.operator_name, &config.worker_id);

    let mut commands = fabric.subscribe(&command_topic, QoS::AtLeastOnce, 16).await?;
    info!(
        "post {} started, listening on {command_topic}",
        config.worker_id
    );

    spawn_sweep(&config, fabric.clone(), post.clone(), event_topic);

    while let Some(message) = commands.recv().await {
        let command = match WorkerCommand::from_bytes(&message.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("post {}: undecodable command: {e}", config.worker_id);
                continue;
            }
        };

        let reply = post.lock().handle_command(command, Utc::now());
        if let Some(reply) = reply {
            if let Err(e) = fabric.publish(&response_topic, QoS::AtLeastOnce, &reply).await {
                warn!("post {}: failed to publish reply: {e}", config.worker_id);
            }
        }
    }

    Ok(())
}

/// Fixed-tick sweep: charge ended reservations and expire stale PREPARED
/// entries whose coordinator never decided.
fn spawn_sweep(
    config: &WorkerConfig,
    fabric: Fabric,
    post: Arc<Mutex<PostState>>,
    event_topic: String,
) {
    let sweep_interval = config.sweep_interval;
    let prepared_ttl = TimeDelta::seconds(config.prepared_ttl.as_secs() as i64);
    let charge_cost = config.charge_cost;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        // The first tick fires immediately; skip it so a restart does not
        // instantly re-publish events.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let events = post.lock().sweep(Utc::now(), prepared_ttl, charge_cost);
            for event in events {
                if let Err(e) = fabric.publish(&event_topic, QoS::AtLeastOnce, &event).await {
                    warn!("failed to publish charged notice: {e}");
                }
            }
        }
    });
}
