//! Payment service entry point.

use std::process::ExitCode;

use broker::{AmqpChannel, BrokerConfig};
use pipeline::{InMemoryPaymentService, run_payment_stage};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BrokerConfig::from_env();

    let (connection, channel) = match AmqpChannel::connect(&config.amqp_url).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up broker channel");
            return ExitCode::FAILURE;
        }
    };

    let result = run_payment_stage(
        channel.clone(),
        InMemoryPaymentService::new(),
        common::shutdown_signal(),
    )
    .await;

    if let Err(e) = channel.close().await {
        tracing::warn!(error = %e, "failed to close channel");
    }
    if let Err(e) = connection.close(200, "shutdown").await {
        tracing::warn!(error = %e, "failed to close connection");
    }

    match result {
        Ok(report) => {
            tracing::info!(?report, "payment service shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "payment service failed");
            ExitCode::FAILURE
        }
    }
}
