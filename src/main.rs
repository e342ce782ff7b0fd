use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aws_sqs_local::sqs::server;
use aws_sqs_local::sqs::{EngineConfig, SqsState, Sweeper};

#[derive(Parser)]
#[command(name = "aws-sqs-local", about = "Local Amazon SQS service")]
struct Args {
    #[arg(long, env = "SQS_PORT", default_value = "9324")]
    port: u16,
    #[arg(long, env = "SQS_REGION", default_value = "us-east-1")]
    region: String,
    #[arg(long, env = "SQS_ACCOUNT_ID", default_value = "000000000000")]
    account_id: String,
    /// How often expired deliveries are returned to their queues
    #[arg(long, env = "SQS_SWEEP_INTERVAL_MS", default_value = "1000")]
    sweep_interval_ms: u64,
    #[arg(long, env = "SQS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("aws_sqs_local={}", args.log_level))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = EngineConfig::new(args.account_id.clone(), args.region.clone(), args.port);
    config.sweep_interval = Duration::from_millis(args.sweep_interval_ms);
    let sweep_interval = config.sweep_interval;

    let state = Arc::new(SqsState::new(config));
    let sweeper = Sweeper::start(state.clone(), sweep_interval);

    let app = server::create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!(port = args.port, region = %args.region, "aws-sqs-local listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    sweeper.stop().await;
    info!("Shut down");
    Ok(())
}
