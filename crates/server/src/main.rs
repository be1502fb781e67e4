mod app;
mod config;
mod metrics;
mod util;

use app::{AppState, RelayApp};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tracing::{error, info};

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("DUOCHAT_CONFIG").unwrap_or_else(|_| "duochat.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let state = AppState::init(config).await.expect("state");
        if let Some(metrics_bind) = state.config.metrics_bind.clone() {
            tokio::spawn(metrics::serve_metrics(
                metrics_bind,
                Arc::clone(&state.metrics),
            ));
        }
        let listener = TcpListener::bind(&state.config.bind).await.expect("bind");
        info!(address = %state.config.bind, "duochat relay listening");
        let relay = RelayApp::new(state);
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let relay = relay.clone();
                    tokio::spawn(async move {
                        relay.process_connect(stream, remote).await;
                    });
                }
                Err(err) => {
                    error!("accept failed: {}", err);
                }
            }
        }
    });
}
