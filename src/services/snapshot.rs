//! Snapshot store — layer persistence.
//!
//! DESIGN
//! ======
//! Each layer persists as one encoded snapshot, either a file under the
//! data directory or a key on the broker; the backend is fixed at
//! construction and the broker wins over the filesystem. A background
//! task drains the dirty-layer set on an interval: encode under the lock,
//! write lock-free, and put the index back on failure so the next cycle
//! retries. Nothing else is persisted.
//!
//! ERROR HANDLING
//! ==============
//! Load problems are never fatal: an unreadable or mis-sized snapshot is
//! logged and the layer starts blank. Only the startup inability to
//! create the data directory aborts the process, and that check lives in
//! `main`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::codec;
use crate::config::{env_parse, DataMode};
use crate::roster::SocketMessage;
use crate::services::broker::Broker;
use crate::state::AppState;

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// The broker handle doubling as the key-value backend, when present.
fn kv_broker(state: &AppState) -> Option<Arc<dyn Broker>> {
    state.peer.as_ref().map(|peer| peer.broker())
}

// =============================================================================
// LOAD
// =============================================================================

/// Restore every layer from the active backend. Startup gates on this:
/// the listener binds only after each layer is either populated or
/// confirmed absent.
pub async fn load_all(state: &AppState) {
    match state.config.data_mode() {
        DataMode::None => return,
        DataMode::Fs | DataMode::Broker => {}
    }

    for n in 0..state.config.layer_count {
        match read_snapshot(state, n).await {
            Some(bytes) => apply_snapshot(state, n, bytes).await,
            None => info!(layer = n, "no stored snapshot; layer starts blank"),
        }
    }
    info!("layer snapshots ready");
}

async fn read_snapshot(state: &AppState, n: usize) -> Option<Vec<u8>> {
    match state.config.data_mode() {
        DataMode::None => None,
        DataMode::Fs => {
            let dir = state.config.fs_data_dir()?;
            let path = state.config.layer_file(dir, n);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "snapshot read failed");
                    None
                }
            }
        }
        DataMode::Broker => {
            let broker = kv_broker(state)?;
            let key = state.config.layer_key(n);
            match broker.get(&key).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, key, "snapshot get failed");
                    None
                }
            }
        }
    }
}

/// Decode and install one snapshot, then force-disconnect every attached
/// socket so clients re-sync from scratch.
async fn apply_snapshot(state: &AppState, n: usize, bytes: Vec<u8>) {
    let decoded = match codec::decode(&bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, layer = n, "stored snapshot undecodable; layer starts blank");
            return;
        }
    };
    if decoded.width != state.config.canvas_width || decoded.height != state.config.canvas_height {
        warn!(
            layer = n,
            stored_width = decoded.width,
            stored_height = decoded.height,
            "stored snapshot dimensions mismatch; discarding"
        );
        return;
    }

    let kicked = {
        let mut room = state.room.write().await;
        let Some(layer) = room.canvas.layer_mut(n) else {
            return;
        };
        if let Err(e) = layer.load(decoded.rgba, Arc::new(bytes)) {
            warn!(error = %e, layer = n, "snapshot load rejected");
            return;
        }
        room.roster.kick_all()
    };
    info!(layer = n, "layer restored from snapshot");

    for tx in kicked {
        let _ = tx.send(SocketMessage::Kick).await;
    }
}

// =============================================================================
// WRITE-BACK
// =============================================================================

/// Spawn the background flush loop.
pub fn spawn_flush_task(state: AppState) -> JoinHandle<()> {
    let interval_ms = env_parse("SNAPSHOT_FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS);
    info!(interval_ms, "snapshot flush configured");
    tokio::spawn(async move {
        loop {
            flush_dirty(&state).await;
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    })
}

/// Encode and write every dirty layer. Indices go back on the dirty set
/// when a write fails, so the next cycle (or the shutdown drain) retries.
pub async fn flush_dirty(state: &AppState) {
    // PHASE: ENCODE UNDER LOCK
    // Encoded snapshots are immutable Arcs; the writes below run lock-free.
    let encoded: Vec<(usize, Arc<Vec<u8>>)> = {
        let mut room = state.room.write().await;
        let dirty = std::mem::take(&mut room.dirty_layers);
        let mut out = Vec::with_capacity(dirty.len());
        for n in dirty {
            let Some(layer) = room.canvas.layer_mut(n) else {
                continue;
            };
            match layer.encode_snapshot() {
                Ok(bytes) => out.push((n, bytes)),
                Err(e) => {
                    error!(error = %e, layer = n, "snapshot encode failed");
                    room.dirty_layers.insert(n);
                }
            }
        }
        out
    };

    // PHASE: WRITE + RETAIN ON FAILURE
    for (n, bytes) in encoded {
        if let Err(e) = write_snapshot(state, n, &bytes).await {
            error!(error = %e, layer = n, "snapshot write failed; retained for retry");
            state.room.write().await.dirty_layers.insert(n);
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Broker(#[from] crate::services::broker::BrokerError),
    #[error("broker unavailable")]
    NoBroker,
}

async fn write_snapshot(state: &AppState, n: usize, bytes: &[u8]) -> Result<(), WriteError> {
    match state.config.data_mode() {
        DataMode::None => Ok(()),
        DataMode::Fs => {
            let Some(dir) = state.config.fs_data_dir() else {
                return Ok(());
            };
            let path = state.config.layer_file(dir, n);
            tokio::fs::write(&path, bytes).await?;
            Ok(())
        }
        DataMode::Broker => {
            let broker = kv_broker(state).ok_or(WriteError::NoBroker)?;
            broker.set(&state.config.layer_key(n), bytes).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "snapshot_test.rs"]
mod tests;
