use clap::Parser;
use pg_fanout::{Config, Pipeline, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// PostgreSQL WAL change-data-capture fan-out daemon.
#[derive(Parser, Debug)]
#[command(name = "pg-fanout", version, about)]
struct Args {
    /// Emit logs as JSON objects
    #[arg(short, long)]
    json_logs: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-fanout v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("\nA listener and at least one processor must be configured:");
            eprintln!("  LISTENER_URL         - PostgreSQL replication connection string");
            eprintln!("  BUS_SERVERS          - Comma-separated list of Kafka brokers");
            eprintln!("  TOPIC_NAME           - Kafka topic for WAL events");
            eprintln!("  READER_GROUP_ID      - consume from Kafka instead of PostgreSQL");
            eprintln!("  SEARCH_STORE_URL     - search store to index into");
            eprintln!("  TRANSLATOR_STORE_URL - schema log store for translation");
            std::process::exit(1);
        }
    };

    info!(
        postgres_listener = config.listener.postgres.is_some(),
        kafka_listener = config.listener.kafka.is_some(),
        kafka_sink = config.processor.kafka.is_some(),
        search_sink = config.processor.search.is_some(),
        translator = config.processor.translator.is_some(),
        "Configuration summary"
    );

    if let Err(e) = Pipeline::new(config)?.run().await {
        error!("Replication stream failed: {}", e);
        return Err(e);
    }
    info!("Replication stream completed");
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let filter = match (verbose, EnvFilter::try_from_default_env()) {
        (true, _) => EnvFilter::new("pg_fanout=debug,info"),
        (false, Ok(from_env)) => from_env,
        (false, Err(_)) => EnvFilter::new("pg_fanout=info,warn"),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
