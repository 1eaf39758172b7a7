//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! One process hosts one room: the canvas, the roster, and the set of
//! locally changed layers all live behind a single `RwLock`, so every
//! state mutation serializes through the write lock. Handlers re-acquire
//! the lock after each await point instead of caching references across a
//! suspension. The broker peer is optional; absent means single-host
//! mode.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::canvas::Canvas;
use crate::config::Config;
use crate::roster::Roster;
use crate::services::broker::BrokerPeer;

// =============================================================================
// ROOM STATE
// =============================================================================

/// Live room state. Owned exclusively; large buffers never leave this
/// struct mutably.
pub struct RoomState {
    pub canvas: Canvas,
    pub roster: Roster,
    /// Layer indices with local edits awaiting a snapshot flush. Replica
    /// edits never land here; only the authoritative originator persists.
    pub dirty_layers: HashSet<usize>,
}

impl RoomState {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            canvas: Canvas::new(config.canvas_width, config.canvas_height, config.layer_count),
            roster: Roster::new(),
            dirty_layers: HashSet::new(),
        }
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state. Clone is required by Axum; all inner fields
/// are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    /// Identity of this server instance, generated once at start.
    pub server_id: Uuid,
    pub config: Arc<Config>,
    pub room: Arc<RwLock<RoomState>>,
    /// Pub/sub peer for multi-server mode. `None` runs single-host.
    pub peer: Option<Arc<BrokerPeer>>,
}

impl AppState {
    #[must_use]
    pub fn new(server_id: Uuid, config: Arc<Config>, peer: Option<Arc<BrokerPeer>>) -> Self {
        let room = RoomState::new(&config);
        Self { server_id, config, room: Arc::new(RwLock::new(room)), peer }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
