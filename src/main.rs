#![allow(dead_code)]

mod canvas;
mod codec;
mod config;
mod layer;
mod protocol;
mod roster;
mod routes;
mod services;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{Config, DataMode};
use crate::services::broker::{BrokerPeer, RedisBroker};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env());
    let server_id = Uuid::new_v4();

    // Fatal: the data directory must exist before snapshots load.
    if config.data_mode() == DataMode::Fs {
        if let Some(dir) = config.fs_data_dir() {
            std::fs::create_dir_all(dir).expect("failed to create data directory");
        }
    }

    // Broker peer (non-fatal: single-host mode if the connection fails).
    let peer = match &config.redis_host {
        Some(host) => match RedisBroker::connect(&config).await {
            Ok(broker) => {
                tracing::info!(%host, port = config.redis_port, "broker connected");
                Some(Arc::new(BrokerPeer::new(Arc::new(broker), &config, server_id)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "broker connection failed — continuing single-host");
                None
            }
        },
        None => None,
    };

    let state = state::AppState::new(server_id, Arc::clone(&config), peer.clone());

    // Startup gates on snapshot restore: every layer is loaded or
    // confirmed absent before the listener binds.
    services::snapshot::load_all(&state).await;

    if state.config.data_mode() != DataMode::None {
        let _flush = services::snapshot::spawn_flush_task(state.clone());
    }

    if let Some(peer) = peer {
        tokio::spawn(peer.run(state.clone()));
    }

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(%server_id, port = config.port, title = %config.title, "reichat-server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server failed");

    // Drain pending layer snapshots before exit.
    services::snapshot::flush_dirty(&state).await;
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
