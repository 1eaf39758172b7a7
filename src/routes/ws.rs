//! SessionHub — the server side of one socket.
//!
//! DESIGN
//! ======
//! On upgrade, the connection immediately learns the server identity and
//! the room config, then enters a `select!` loop:
//! - Incoming events → decode + validate + route to the engine
//! - Outbound messages from the engine → forward to the socket
//!
//! A malformed event is dropped with zero side effects: no disconnect,
//! no error frame. Everything but `client` is dropped until a bind
//! succeeds.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `server` then `config`
//! 2. `client` bind → credentials to the binder, roster + join chat to all
//! 3. Validated events → engine
//! 4. Close (or kick) → mark offline, roster + leave chat, `provide`

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ForwardedHeaderType;
use crate::protocol::{BindRequest, ClientCredentials, ClientEvent, DistServer, ServerEvent};
use crate::roster::{SocketMessage, SocketSender};
use crate::services::engine::{self, Origin};
use crate::state::AppState;

const OUTBOUND_BUFFER: usize = 256;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let remote_addr = resolve_remote_addr(&state, &headers, peer_addr);
    ws.on_upgrade(move |socket| run_ws(socket, state, remote_addr))
}

/// The logged remote address: the first `X-Forwarded-For` hop when the
/// config trusts it, the socket peer otherwise.
fn resolve_remote_addr(state: &AppState, headers: &HeaderMap, peer: SocketAddr) -> String {
    if state.config.forwarded_header_type == ForwardedHeaderType::Xff {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            let first = forwarded.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.ip().to_string()
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, remote_addr: String) {
    // Per-connection channel the engine fans out into.
    let (client_tx, mut client_rx) = mpsc::channel::<SocketMessage>(OUTBOUND_BUFFER);

    // Identity and room shape first.
    let hello = [
        ServerEvent::Server(DistServer { id: state.server_id }),
        ServerEvent::Config(state.config.distributable()),
    ];
    for event in hello {
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }

    info!(%remote_addr, "socket connected");
    let mut bound: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        process_inbound(&state, &mut bound, &client_tx, &remote_addr, text.as_str()).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(msg) = client_rx.recv() => {
                match msg {
                    SocketMessage::Event(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    SocketMessage::Kick => {
                        debug!(%remote_addr, "socket force-disconnected");
                        break;
                    }
                }
            }
        }
    }

    if let Some(uuid) = bound {
        finish_disconnect(&state, uuid, &client_tx).await;
    }
    info!(%remote_addr, "socket disconnected");
}

/// Teardown for a bound connection. A kicked socket finds its index entry
/// already replaced and leaves the roster alone; the takeover owns the
/// identity now.
async fn finish_disconnect(state: &AppState, uuid: Uuid, tx: &SocketSender) {
    let (was_current, name) = {
        let mut room = state.room.write().await;
        let name = room.roster.get(uuid).map(|c| c.name.clone());
        (room.roster.mark_offline_if_current(uuid, tx), name)
    };
    if !was_current {
        return;
    }

    engine::broadcast_roster(state).await;
    if let Some(name) = name {
        engine::system_message(state, format!("! {name} has left.")).await;
    }
    publish_provide(state).await;
}

// =============================================================================
// EVENT DISPATCH
// =============================================================================

/// Decode, validate, and route one inbound text frame.
///
/// Kept free of transport concerns so tests can drive the full dispatch
/// path with an in-memory channel standing in for the socket.
pub(crate) async fn process_inbound(
    state: &AppState,
    bound: &mut Option<Uuid>,
    tx: &SocketSender,
    remote_addr: &str,
    text: &str,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "undecodable inbound event; dropped");
            return;
        }
    };

    if let ClientEvent::Client(req) = &event {
        handle_bind(state, bound, tx, remote_addr, req).await;
        return;
    }

    let Some(uuid) = *bound else {
        debug!("event before bind; dropped");
        return;
    };
    let client = state.room.read().await.roster.get(uuid).cloned();
    let Some(client) = client else {
        debug!(%uuid, "bound client no longer in roster; dropped");
        return;
    };

    match event {
        ClientEvent::Client(_) => {}
        ClientEvent::Paint(req) => match req.validate(state.config.layer_count) {
            Some(valid) => engine::handle_paint(state, Origin::Local, &client, valid).await,
            None => debug!(%uuid, "invalid paint; dropped"),
        },
        ClientEvent::Stroke(req) => {
            match req.validate(state.config.canvas_width, state.config.canvas_height) {
                Some(body) => engine::handle_stroke(state, Origin::Local, &client, body).await,
                None => debug!(%uuid, "invalid stroke; dropped"),
            }
        }
        ClientEvent::Pointer(req) => {
            match req.validate(state.config.canvas_width, state.config.canvas_height) {
                Some(body) => engine::handle_pointer(state, Origin::Local, &client, body).await,
                None => debug!(%uuid, "invalid pointer; dropped"),
            }
        }
        ClientEvent::Chat(req) => match req.validate() {
            Some(chat) => engine::handle_chat(state, Origin::Local, Some(&client), chat).await,
            None => debug!(%uuid, "invalid chat; dropped"),
        },
    }
}

// =============================================================================
// BIND
// =============================================================================

async fn handle_bind(
    state: &AppState,
    bound: &mut Option<Uuid>,
    tx: &SocketSender,
    remote_addr: &str,
    req: &BindRequest,
) {
    let outcome = {
        let mut room = state.room.write().await;
        match room.roster.bind(req, remote_addr, state.server_id, tx.clone()) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "bind rejected; dropped");
                return;
            }
        }
    };

    // Force-disconnect the taken-over socket before anyone hears about
    // the rebind.
    if let Some(old) = outcome.kicked {
        let _ = old.send(SocketMessage::Kick).await;
    }

    *bound = Some(outcome.client.uuid);
    info!(
        uuid = %outcome.client.uuid,
        name = %outcome.client.name,
        rebound = outcome.rebound,
        %remote_addr,
        "client bound"
    );

    // Credentials go to the binder only.
    let credentials = ServerEvent::Client(ClientCredentials {
        uuid: outcome.client.uuid,
        name: outcome.client.name.clone(),
        pin: outcome.client.pin.clone(),
    });
    let _ = tx.send(SocketMessage::Event(credentials)).await;

    engine::broadcast_roster(state).await;
    engine::system_message(state, format!("! {} has join.", outcome.client.name)).await;
    publish_provide(state).await;
}

// =============================================================================
// HELPERS
// =============================================================================

/// Announce the local client set to peer servers after a roster change.
async fn publish_provide(state: &AppState) {
    let Some(peer) = &state.peer else {
        return;
    };
    let clients = state
        .room
        .read()
        .await
        .roster
        .local_clients(state.server_id);
    if let Err(e) = peer.publish_provide(&clients).await {
        warn!(error = %e, "provide publish failed");
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize event");
            return Err(());
        }
    };
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
