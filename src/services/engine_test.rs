use super::*;
use crate::protocol::{ChatRequest, PaintMode, PaintRequest, PointerRequest, StrokeRequest};
use crate::roster::SocketMessage;
use crate::state::test_helpers::{bind_client, test_state};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

fn patch_b64(width: u32, height: u32, rgba: [u8; 4]) -> String {
    let mut buf = Vec::new();
    for _ in 0..width * height {
        buf.extend_from_slice(&rgba);
    }
    BASE64.encode(crate::codec::encode(width, height, &buf).unwrap())
}

fn valid_paint(layer: usize, x: f64, y: f64, data: String) -> ValidPaint {
    PaintRequest { layer_number: layer, x, y, mode: PaintMode::Normal, data }
        .validate(3)
        .expect("test paint should validate")
}

async fn recv_event(rx: &mut mpsc::Receiver<SocketMessage>) -> ServerEvent {
    let msg = timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("receive timed out")
        .expect("channel closed unexpectedly");
    match msg {
        SocketMessage::Event(event) => event,
        SocketMessage::Kick => panic!("unexpected kick"),
    }
}

fn assert_idle(rx: &mut mpsc::Receiver<SocketMessage>) {
    assert!(rx.try_recv().is_err(), "expected no pending messages");
}

// =============================================================================
// Paint
// =============================================================================

#[tokio::test]
async fn solo_paint_acks_without_fanout() {
    let state = test_state();
    let (a, mut rx_a) = bind_client(&state, "a").await;

    let paint = valid_paint(0, 10.0, 20.0, patch_b64(4, 4, [255, 0, 0, 255]));
    handle_paint(&state, Origin::Local, &a, paint).await;

    // The originator gets exactly one painted ack, no paint echo.
    assert!(matches!(recv_event(&mut rx_a).await, ServerEvent::Painted));
    assert_idle(&mut rx_a);

    // Pixels landed on layer 0.
    let room = state.room.read().await;
    let layer = room.canvas.layer(0).unwrap();
    let width = layer.width();
    for (x, y) in [(10u32, 20u32), (13, 23)] {
        let off = ((y * width + x) * 4) as usize;
        assert_eq!(&layer.buf()[off..off + 4], &[255, 0, 0, 255], "({x},{y})");
    }
    let off = ((19 * width + 9) * 4) as usize;
    assert_eq!(&layer.buf()[off..off + 4], &[0, 0, 0, 0]);
}

#[tokio::test]
async fn paint_fans_out_to_peers_once() {
    let state = test_state();
    let (a, mut rx_a) = bind_client(&state, "a").await;
    let (_b, mut rx_b) = bind_client(&state, "b").await;

    let paint = valid_paint(1, 0.0, 0.0, patch_b64(2, 2, [0, 255, 0, 255]));
    handle_paint(&state, Origin::Local, &a, paint).await;

    let event = recv_event(&mut rx_b).await;
    let ServerEvent::Paint(broadcast) = event else {
        panic!("expected paint event, got {event:?}");
    };
    assert_eq!(broadcast.client.uuid, a.uuid);
    assert_eq!(broadcast.client.name, "a");
    assert_eq!(broadcast.body.layer_number, 1);
    assert_idle(&mut rx_b);

    assert!(matches!(recv_event(&mut rx_a).await, ServerEvent::Painted));
    assert_idle(&mut rx_a);
}

#[tokio::test]
async fn local_paint_marks_layer_dirty() {
    let state = test_state();
    let (a, _rx_a) = bind_client(&state, "a").await;

    let paint = valid_paint(2, 1.0, 1.0, patch_b64(1, 1, [1, 2, 3, 4]));
    handle_paint(&state, Origin::Local, &a, paint).await;

    let room = state.room.read().await;
    assert!(room.dirty_layers.contains(&2));
}

#[tokio::test]
async fn remote_paint_applies_without_ack_or_dirty() {
    let state = test_state();
    let (_local, mut rx_local) = bind_client(&state, "local").await;

    // A client hosted on another server.
    let remote = crate::roster::Client {
        uuid: uuid::Uuid::new_v4(),
        pin: "p".into(),
        name: "far".into(),
        remote_addr: "10.0.0.9".into(),
        is_online: true,
        server_id: uuid::Uuid::new_v4(),
    };

    let paint = valid_paint(0, 5.0, 5.0, patch_b64(2, 2, [9, 8, 7, 255]));
    handle_paint(&state, Origin::Remote, &remote, paint).await;

    // Local sockets see the paint; nobody gets a painted ack.
    let event = recv_event(&mut rx_local).await;
    assert!(matches!(event, ServerEvent::Paint(_)));
    assert_idle(&mut rx_local);

    let room = state.room.read().await;
    assert!(room.dirty_layers.is_empty(), "replica edits must not persist");
    let layer = room.canvas.layer(0).unwrap();
    let off = ((5 * layer.width() + 5) * 4) as usize;
    assert_eq!(&layer.buf()[off..off + 4], &[9, 8, 7, 255]);
}

#[tokio::test]
async fn repainting_current_pixels_still_signals() {
    let state = test_state();
    let (a, mut rx_a) = bind_client(&state, "a").await;
    let data = patch_b64(2, 2, [4, 5, 6, 255]);

    handle_paint(&state, Origin::Local, &a, valid_paint(0, 0.0, 0.0, data.clone())).await;
    state.room.write().await.dirty_layers.clear();
    let before = state.room.read().await.canvas.layer(0).unwrap().buf().to_vec();

    // Writing identical pixels is a no-op modulo the change signal.
    handle_paint(&state, Origin::Local, &a, valid_paint(0, 0.0, 0.0, data)).await;

    let room = state.room.read().await;
    assert_eq!(room.canvas.layer(0).unwrap().buf(), &before[..]);
    assert!(room.dirty_layers.contains(&0));
    drop(room);

    assert!(matches!(recv_event(&mut rx_a).await, ServerEvent::Painted));
    assert!(matches!(recv_event(&mut rx_a).await, ServerEvent::Painted));
}

// =============================================================================
// Chat
// =============================================================================

#[tokio::test]
async fn chat_reaches_originator_with_server_time() {
    let state = test_state();
    let (a, mut rx_a) = bind_client(&state, "a").await;
    let chat = ChatRequest { message: "hello".into(), time: None }.validate().unwrap();

    handle_chat(&state, Origin::Local, Some(&a), chat).await;

    let event = recv_event(&mut rx_a).await;
    let ServerEvent::Chat(chat) = event else {
        panic!("expected chat event");
    };
    assert_eq!(chat.message, "hello");
    assert!(chat.time > 0, "server must stamp missing time");
    assert_eq!(chat.client.unwrap().uuid, a.uuid);
}

#[tokio::test]
async fn chat_forwards_client_supplied_time() {
    let state = test_state();
    let (a, mut rx_a) = bind_client(&state, "a").await;
    let chat = ChatRequest { message: "old".into(), time: Some(1234) }.validate().unwrap();

    handle_chat(&state, Origin::Local, Some(&a), chat).await;

    let ServerEvent::Chat(chat) = recv_event(&mut rx_a).await else {
        panic!("expected chat event");
    };
    assert_eq!(chat.time, 1234);
}

#[tokio::test]
async fn system_message_carries_no_client() {
    let state = test_state();
    let (_a, mut rx_a) = bind_client(&state, "a").await;

    system_message(&state, "! a has join.").await;

    let ServerEvent::Chat(chat) = recv_event(&mut rx_a).await else {
        panic!("expected chat event");
    };
    assert!(chat.client.is_none());
    assert_eq!(chat.message, "! a has join.");
}

// =============================================================================
// Stroke / pointer
// =============================================================================

#[tokio::test]
async fn stroke_excludes_sender() {
    let state = test_state();
    let (a, mut rx_a) = bind_client(&state, "a").await;
    let (_b, mut rx_b) = bind_client(&state, "b").await;

    let body = StrokeRequest { points: vec![vec![1.0, 2.0, 1.0]] }
        .validate(64, 48)
        .unwrap();
    handle_stroke(&state, Origin::Local, &a, body).await;

    let ServerEvent::Stroke(stroke) = recv_event(&mut rx_b).await else {
        panic!("expected stroke event");
    };
    assert_eq!(stroke.body.points, vec![[1, 2, 1]]);
    assert_idle(&mut rx_a);
}

#[tokio::test]
async fn stroke_drops_under_backpressure() {
    let state = test_state();
    let (a, _rx_a) = bind_client(&state, "a").await;
    let (b, mut rx_b) = bind_client(&state, "b").await;

    // Saturate b's outbound buffer.
    let b_tx = state.room.read().await.roster.socket(b.uuid).unwrap();
    let mut filler = 0;
    while b_tx
        .try_send(SocketMessage::Event(ServerEvent::Painted))
        .is_ok()
    {
        filler += 1;
    }

    let body = StrokeRequest { points: vec![vec![0.0, 0.0, 1.0]] }
        .validate(64, 48)
        .unwrap();
    handle_stroke(&state, Origin::Local, &a, body).await;

    // The stroke was dropped: only the filler comes out.
    let mut drained = 0;
    while let Ok(msg) = rx_b.try_recv() {
        assert!(matches!(msg, SocketMessage::Event(ServerEvent::Painted)));
        drained += 1;
    }
    assert_eq!(drained, filler);
}

#[tokio::test]
async fn pointer_relays_sentinel_position() {
    let state = test_state();
    let (a, _rx_a) = bind_client(&state, "a").await;
    let (_b, mut rx_b) = bind_client(&state, "b").await;

    let body = PointerRequest { x: -1.0, y: -1.0 }.validate(64, 48).unwrap();
    handle_pointer(&state, Origin::Local, &a, body).await;

    let ServerEvent::Pointer(pointer) = recv_event(&mut rx_b).await else {
        panic!("expected pointer event");
    };
    assert_eq!((pointer.body.x, pointer.body.y), (-1, -1));
    assert_eq!(pointer.client.uuid, a.uuid);
}

// =============================================================================
// Roster broadcast
// =============================================================================

#[tokio::test]
async fn roster_broadcast_lists_online_clients() {
    let state = test_state();
    let (a, mut rx_a) = bind_client(&state, "a").await;
    let (b, _rx_b) = bind_client(&state, "b").await;

    state.room.write().await.roster.mark_offline(b.uuid);
    broadcast_roster(&state).await;

    let ServerEvent::Clients { clients } = recv_event(&mut rx_a).await else {
        panic!("expected clients event");
    };
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].uuid, a.uuid);
}
