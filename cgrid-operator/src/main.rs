//! cgrid operator binary.
//!
//! One instance per city: it answers route requests, coordinates the
//! transactions it receives, and votes as participant for remote
//! coordinators.

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cgrid_core::OperatorConfig;
use cgrid_operator::operator::Operator;

/// cgrid charging-network operator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Operator name, e.g. SolAtlantico
    #[arg(short, long)]
    name: String,

    /// City whose charging posts this operator owns
    #[arg(short, long)]
    city: String,

    /// City capacity (posts usable at any instant)
    #[arg(long, default_value = "2")]
    posts: usize,

    /// Comma-separated ids of this city's post workers
    #[arg(short, long, value_delimiter = ',')]
    workers: Vec<String>,

    /// Port of the participant HTTP API
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// MQTT broker URL
    #[arg(long, default_value = "tcp://localhost:1883")]
    mqtt_broker: String,

    /// Service registry base URL
    #[arg(long, default_value = "http://localhost:9000")]
    registry: String,

    /// Externally reachable base URL of this API (defaults to
    /// http://<name>:<port>)
    #[arg(long)]
    api_url: Option<String>,

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

    let mut config = OperatorConfig::new(args.name, args.city, args.workers)
        .with_posts_quantity(args.posts)
        .with_http_port(args.port)
        .with_mqtt_broker(args.mqtt_broker)
        .with_registry(args.registry);
    if let Some(api_url) = args.api_url {
        config = config.with_advertise_url(api_url);
    }
    config.validate()?;

    info!(
        "starting operator {} for {} ({} posts)",
        config.operator_name, config.owned_city, config.posts_quantity
    );

    let operator = Operator::bootstrap(config).await?;
    operator.run().await?;
    Ok(())
}
