//! Clawlet broker entrypoint.
//!
//! Starts the JSON-over-HTTP binding of the tool surface (default), or the
//! stdio tool-protocol binding when launched with the `stdio` argument.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the HTTP binding address (default 127.0.0.1:3000)
//! - `DEMO_MODE=true` disables all non-read operations
//! - `CLAWLET_DIR` overrides the state directory (default `<cwd>/.clawlet`)

use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use clawlet::broker::PaymentBroker;
use clawlet::config::Config;
use clawlet::manager::WalletManager;
use clawlet::store::StateStore;
use clawlet::tools::Tools;
use clawlet::{handlers, stdio, telemetry};

#[tokio::main]
async fn main() {
    dotenv().ok();
    telemetry::init();

    let config = Config::from_env();
    let store = match StateStore::open(&config.data_dir) {
        Ok(store) => Arc::new(store),
        Err(error) => {
            tracing::error!("Failed to open state store: {error}");
            std::process::exit(1);
        }
    };
    let manager = Arc::new(WalletManager::new(store.clone()));
    let broker = Arc::new(PaymentBroker::new(store.clone(), manager.clone()));
    let tools = Arc::new(Tools::new(
        store,
        manager,
        broker.clone(),
        config.demo_mode,
    ));

    let _sweeper = broker.spawn_sweeper();

    if std::env::args().nth(1).as_deref() == Some("stdio") {
        if let Err(error) = stdio::run(tools).await {
            tracing::error!("stdio binding error: {error}");
            std::process::exit(1);
        }
        return;
    }

    let app = handlers::router(tools)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::info!(
                            "status={} elapsed={}ms",
                            response.status().as_u16(),
                            latency.as_millis()
                        );
                    },
                ),
        )
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::from((config.host, config.port));
    tracing::info!("Starting broker at http://{addr}");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!("Failed to bind to {addr}: {error}");
            std::process::exit(1);
        }
    };

    if let Err(error) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {error}");
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {error}");
    }
    tracing::info!("Shutting down");
}
