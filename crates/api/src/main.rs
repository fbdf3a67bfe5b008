//! Order service entry point.

use std::process::ExitCode;
use std::sync::Arc;

use api::config::Config;
use api::routes::orders::AppState;
use broker::AmqpChannel;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = match prometheus_builder.install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to install Prometheus recorder");
            return ExitCode::FAILURE;
        }
    };

    // 3. Connect to the broker and start the order publisher
    let (connection, channel) = match AmqpChannel::connect(&config.broker.amqp_url).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up broker channel");
            return ExitCode::FAILURE;
        }
    };
    let (orders, publishing) =
        match api::start_order_publisher(channel.clone(), &config.broker).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(error = %e, "failed to start order publisher");
                return ExitCode::FAILURE;
            }
        };

    // 4. Build the application
    let app = api::create_app(Arc::new(AppState::new(orders)), metrics_handle);

    // 5. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting order service");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind address");
            return ExitCode::FAILURE;
        }
    };
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(common::shutdown_signal())
        .await;

    // 6. The router owned the last order sender; wait for the publisher to drain
    let mut exit = ExitCode::SUCCESS;
    if let Err(e) = served {
        tracing::error!(error = %e, "server error");
        exit = ExitCode::FAILURE;
    }
    match publishing.await {
        Ok(Ok(report)) => tracing::info!(?report, "order publisher drained"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "order publisher failed");
            exit = ExitCode::FAILURE;
        }
        Err(e) => {
            tracing::error!(error = %e, "order publisher task panicked");
            exit = ExitCode::FAILURE;
        }
    }

    if let Err(e) = channel.close().await {
        tracing::warn!(error = %e, "failed to close channel");
    }
    if let Err(e) = connection.close(200, "shutdown").await {
        tracing::warn!(error = %e, "failed to close connection");
    }

    tracing::info!("order service shut down gracefully");
    exit
}
