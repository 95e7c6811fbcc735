use outbox_relay::config::RelayConfig;
use outbox_relay::relay::RelayService;
use sqlx::postgres::PgPoolOptions;
use std::env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage:");
        eprintln!("  outbox-relay-cli run");
        eprintln!("  outbox-relay-cli trigger");
        eprintln!("  outbox-relay-cli stats");
        std::process::exit(1);
    }

    let config = match RelayConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("ERROR: invalid configuration: {e:#}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = PgPoolOptions::new()
        .max_connections(config.database_connection_pool_size as u32)
        .connect(&config.database_url)
        .await?;

    match args[1].as_str() {
        "run" => {
            tracing::info!("starting outbox relay");
            let relay = RelayService::start(config, pool).await?;
            tokio::signal::ctrl_c().await?;
            relay.shutdown().await;
        }
        "trigger" => {
            let relay = RelayService::start(config, pool).await?;
            let result = relay.manual_trigger.trigger_once().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            relay.shutdown().await;
        }
        "stats" => {
            let relay = RelayService::start(config, pool).await?;
            let stats = relay.manual_trigger.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            relay.shutdown().await;
        }
        other => {
            eprintln!("Unknown subcommand: {other}");
            std::process::exit(1);
        }
    }

    Ok(())
}
