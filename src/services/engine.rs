//! Engine — the room arbiter.
//!
//! DESIGN
//! ======
//! Every validated event lands here with its origin: `Local` events came
//! from a socket on this server, `Remote` events arrived via the broker.
//! The engine mutates room state under the write lock, then fans out to
//! local sockets, and publishes on the broker only for local events so a
//! frame never bounces between servers.
//!
//! Fan-out comes in two grades. Paint, chat, and roster events are
//! reliable: delivery awaits queue space. Stroke and pointer hints are
//! volatile: a full outbound buffer drops them without error.

use tracing::warn;
use uuid::Uuid;

use crate::protocol::{
    now_ms, ChatBroadcast, PaintBroadcast, PointerBody, PointerBroadcast, ServerEvent,
    StrokeBody, StrokeBroadcast, ValidChat, ValidPaint,
};
use crate::roster::{Client, SocketMessage, SocketSender};
use crate::state::AppState;

/// Where an event entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// From a socket on this server; fan out, persist, and publish.
    Local,
    /// Replicated from a peer server; fan out only.
    Remote,
}

// =============================================================================
// PAINT
// =============================================================================

/// Apply a paint patch and relay it.
///
/// The patch is copied pixel-for-pixel, alpha included: erasing is a
/// patch of zero-alpha pixels, not a blend mode. Local paints mark the
/// layer dirty for the snapshot store; replicated paints keep the raster
/// convergent without duplicating persistence.
pub async fn handle_paint(state: &AppState, origin: Origin, client: &Client, paint: ValidPaint) {
    let (senders, origin_socket) = {
        let mut room = state.room.write().await;
        // Re-resolve the layer by index; never trust references across a
        // suspension.
        let Some(layer) = room.canvas.layer_mut(paint.body.layer_number) else {
            return;
        };
        layer.write(&paint.patch, paint.body.x, paint.body.y);
        if origin == Origin::Local {
            room.dirty_layers.insert(paint.body.layer_number);
        }
        (room.roster.senders(), room.roster.socket(client.uuid))
    };

    let event = ServerEvent::Paint(PaintBroadcast {
        client: client.distributable(),
        body: paint.body.clone(),
    });
    broadcast(&senders, Some(client.uuid), &event).await;

    if origin == Origin::Local {
        if let Some(tx) = origin_socket {
            let _ = tx.send(SocketMessage::Event(ServerEvent::Painted)).await;
        }
        if let Some(peer) = &state.peer {
            if let Err(e) = peer.publish_paint(client, &paint.body).await {
                warn!(error = %e, "paint publish failed");
            }
        }
    }
}

// =============================================================================
// STROKE / POINTER
// =============================================================================

/// Relay a stroke hint. Transient: not canvas state, volatile fan-out.
pub async fn handle_stroke(state: &AppState, origin: Origin, client: &Client, body: StrokeBody) {
    let senders = state.room.read().await.roster.senders();
    let event = ServerEvent::Stroke(StrokeBroadcast {
        client: client.distributable(),
        body: body.clone(),
    });
    broadcast_volatile(&senders, Some(client.uuid), &event);

    if origin == Origin::Local {
        if let Some(peer) = &state.peer {
            if let Err(e) = peer.publish_stroke(client, &body).await {
                warn!(error = %e, "stroke publish failed");
            }
        }
    }
}

/// Relay a pointer position. Same volatile treatment as strokes.
pub async fn handle_pointer(state: &AppState, origin: Origin, client: &Client, body: PointerBody) {
    let senders = state.room.read().await.roster.senders();
    let event = ServerEvent::Pointer(PointerBroadcast {
        client: client.distributable(),
        body: body.clone(),
    });
    broadcast_volatile(&senders, Some(client.uuid), &event);

    if origin == Origin::Local {
        if let Some(peer) = &state.peer {
            if let Err(e) = peer.publish_pointer(client, &body).await {
                warn!(error = %e, "pointer publish failed");
            }
        }
    }
}

// =============================================================================
// CHAT
// =============================================================================

/// Relay a chat line to every local socket, the originator included.
/// A client-supplied time is forwarded as-is; otherwise the server clock
/// stamps it.
pub async fn handle_chat(state: &AppState, origin: Origin, client: Option<&Client>, chat: ValidChat) {
    let time = chat.time.unwrap_or_else(now_ms);
    let event = ServerEvent::Chat(ChatBroadcast {
        client: client.map(Client::distributable),
        message: chat.message.clone(),
        time,
    });

    let senders = state.room.read().await.roster.senders();
    broadcast(&senders, None, &event).await;

    if origin == Origin::Local {
        if let Some(peer) = &state.peer {
            let result = match client {
                Some(client) => {
                    peer.publish_chat(
                        client,
                        &crate::protocol::ChatBody { message: chat.message, time },
                    )
                    .await
                }
                None => peer.publish_system(&chat.message).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "chat publish failed");
            }
        }
    }
}

/// Server-generated chat line with no client attached.
pub async fn system_message(state: &AppState, text: impl Into<String>) {
    handle_chat(
        state,
        Origin::Local,
        None,
        ValidChat { message: text.into(), time: None },
    )
    .await;
}

// =============================================================================
// ROSTER
// =============================================================================

/// Push the current online roster to every local socket. Called after any
/// roster change: bind, rebind, disconnect, peer provide, dead-server
/// prune.
pub async fn broadcast_roster(state: &AppState) {
    let (senders, clients) = {
        let room = state.room.read().await;
        (room.roster.senders(), room.roster.snapshot_online())
    };
    broadcast(&senders, None, &ServerEvent::Clients { clients }).await;
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Reliable fan-out: await queue space on every socket except `exclude`.
async fn broadcast(senders: &[(Uuid, SocketSender)], exclude: Option<Uuid>, event: &ServerEvent) {
    for (uuid, tx) in senders {
        if exclude == Some(*uuid) {
            continue;
        }
        let _ = tx.send(SocketMessage::Event(event.clone())).await;
    }
}

/// Volatile fan-out: if a socket's outbound buffer is full, drop it.
fn broadcast_volatile(senders: &[(Uuid, SocketSender)], exclude: Option<Uuid>, event: &ServerEvent) {
    for (uuid, tx) in senders {
        if exclude == Some(*uuid) {
            continue;
        }
        let _ = tx.try_send(SocketMessage::Event(event.clone()));
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
