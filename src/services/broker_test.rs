use super::*;
use crate::protocol::PaintMode;
use crate::roster::SocketMessage;
use crate::state::test_helpers::{bind_client, test_state_with_broker};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::time::{sleep, timeout};

async fn recv_event(rx: &mut mpsc::Receiver<SocketMessage>) -> crate::protocol::ServerEvent {
    let msg = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("receive timed out")
        .expect("channel closed unexpectedly");
    match msg {
        SocketMessage::Event(event) => event,
        SocketMessage::Kick => panic!("unexpected kick"),
    }
}

async fn recv_channel_message(rx: &mut mpsc::Receiver<ChannelMessage>) -> ChannelMessage {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("broker receive timed out")
        .expect("broker channel closed")
}

fn patch_b64(width: u32, height: u32, rgba: [u8; 4]) -> String {
    let mut buf = Vec::new();
    for _ in 0..width * height {
        buf.extend_from_slice(&rgba);
    }
    BASE64.encode(crate::codec::encode(width, height, &buf).unwrap())
}

fn remote_client(server_id: Uuid) -> Client {
    Client {
        uuid: Uuid::new_v4(),
        pin: "secret".into(),
        name: "far".into(),
        remote_addr: "10.0.0.9".into(),
        is_online: true,
        server_id,
    }
}

// =============================================================================
// MemoryBroker
// =============================================================================

#[tokio::test]
async fn memory_broker_routes_by_channel() {
    let broker = MemoryBroker::new();
    let mut rx = broker.subscribe(vec!["room:paint".into()]).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    broker.publish("room:chat", "ignored".into()).await.unwrap();
    broker.publish("room:paint", "seen".into()).await.unwrap();

    let msg = recv_channel_message(&mut rx).await;
    assert_eq!(msg.channel, "room:paint");
    assert_eq!(msg.payload, "seen");
}

#[tokio::test]
async fn memory_broker_key_value_round_trip() {
    let broker = MemoryBroker::new();
    assert_eq!(broker.get("layer:0").await.unwrap(), None);
    broker.set("layer:0", &[1, 2, 3]).await.unwrap();
    assert_eq!(broker.get("layer:0").await.unwrap(), Some(vec![1, 2, 3]));
}

// =============================================================================
// Frame envelope
// =============================================================================

#[tokio::test]
async fn peer_frame_wire_shape() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let state = test_state_with_broker(Arc::clone(&broker));
    let peer = state.peer.as_ref().unwrap();

    let mut raw = broker.subscribe(vec!["provide".into()]).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let client = remote_client(state.server_id);
    peer.publish_provide(&[client.clone()]).await.unwrap();

    let msg = recv_channel_message(&mut raw).await;
    let json: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
    assert_eq!(json["server"]["id"], serde_json::json!(state.server_id));
    assert_eq!(json["body"]["target"], "clients");
    assert_eq!(json["body"]["body"][0]["uuid"], serde_json::json!(client.uuid));
    assert_eq!(json["body"]["body"][0]["pin"], "secret");
}

// =============================================================================
// Loopback suppression
// =============================================================================

#[tokio::test]
async fn own_frames_are_dropped() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let state = test_state_with_broker(Arc::clone(&broker));
    let peer = state.peer.as_ref().unwrap().clone();

    // A paint frame that claims to come from ourselves.
    let frame = PeerFrame {
        server: DistServer { id: state.server_id },
        client: Some(remote_client(state.server_id)),
        body: serde_json::json!({
            "layerNumber": 0,
            "mode": "normal",
            "x": 0,
            "y": 0,
            "data": patch_b64(2, 2, [255, 0, 0, 255]),
        }),
    };
    let msg = ChannelMessage {
        channel: "paint".into(),
        payload: serde_json::to_string(&frame).unwrap(),
    };
    peer.dispatch(&state, &msg).await;

    let room = state.room.read().await;
    assert!(
        room.canvas.layer(0).unwrap().buf().iter().all(|&b| b == 0),
        "loopback paint must not touch the canvas"
    );
}

#[tokio::test]
async fn loopback_provide_does_not_reconcile() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let state = test_state_with_broker(Arc::clone(&broker));
    let peer = state.peer.as_ref().unwrap().clone();

    let frame = PeerFrame {
        server: DistServer { id: state.server_id },
        client: None,
        body: serde_json::json!({
            "target": "clients",
            "body": [remote_client(state.server_id)],
        }),
    };
    let msg = ChannelMessage {
        channel: "provide".into(),
        payload: serde_json::to_string(&frame).unwrap(),
    };
    peer.dispatch(&state, &msg).await;

    assert_eq!(state.room.read().await.roster.client_count(), 0);
}

// =============================================================================
// Remote events
// =============================================================================

#[tokio::test]
async fn remote_paint_lands_on_canvas() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let state = test_state_with_broker(Arc::clone(&broker));
    let peer = state.peer.as_ref().unwrap().clone();
    let (_local, mut rx_local) = bind_client(&state, "local").await;

    let remote_server = Uuid::new_v4();
    let frame = PeerFrame {
        server: DistServer { id: remote_server },
        client: Some(remote_client(remote_server)),
        body: serde_json::json!({
            "layerNumber": 0,
            "mode": "normal",
            "x": 3,
            "y": 3,
            "data": patch_b64(2, 2, [0, 0, 255, 255]),
        }),
    };
    let msg = ChannelMessage {
        channel: "paint".into(),
        payload: serde_json::to_string(&frame).unwrap(),
    };
    peer.dispatch(&state, &msg).await;

    let event = recv_event(&mut rx_local).await;
    assert!(matches!(event, crate::protocol::ServerEvent::Paint(_)));

    let room = state.room.read().await;
    let layer = room.canvas.layer(0).unwrap();
    let off = ((3 * layer.width() + 3) * 4) as usize;
    assert_eq!(&layer.buf()[off..off + 4], &[0, 0, 255, 255]);
    assert!(room.dirty_layers.is_empty(), "remote paint must not persist");
}

#[tokio::test]
async fn remote_chat_keeps_time_and_does_not_republish() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let state = test_state_with_broker(Arc::clone(&broker));
    let peer = state.peer.as_ref().unwrap().clone();
    let (_local, mut rx_local) = bind_client(&state, "local").await;

    let mut raw = broker.subscribe(vec!["chat".into()]).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let remote_server = Uuid::new_v4();
    let frame = PeerFrame {
        server: DistServer { id: remote_server },
        client: Some(remote_client(remote_server)),
        body: serde_json::json!({ "message": "hi from afar", "time": 777 }),
    };
    let msg = ChannelMessage {
        channel: "chat".into(),
        payload: serde_json::to_string(&frame).unwrap(),
    };
    peer.dispatch(&state, &msg).await;

    let crate::protocol::ServerEvent::Chat(chat) = recv_event(&mut rx_local).await else {
        panic!("expected chat event");
    };
    assert_eq!(chat.message, "hi from afar");
    assert_eq!(chat.time, 777);

    // Remote events are never re-published.
    sleep(Duration::from_millis(50)).await;
    assert!(raw.try_recv().is_err());
}

#[tokio::test]
async fn collect_answers_with_local_clients_only() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let state = test_state_with_broker(Arc::clone(&broker));
    let peer = state.peer.as_ref().unwrap().clone();
    let (local, _rx_local) = bind_client(&state, "local").await;

    // A remote record that must not appear in our provide.
    let other_server = Uuid::new_v4();
    state
        .room
        .write()
        .await
        .roster
        .reconcile(other_server, vec![remote_client(other_server)]);

    let mut raw = broker.subscribe(vec!["provide".into()]).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let frame = PeerFrame {
        server: DistServer { id: Uuid::new_v4() },
        client: None,
        body: serde_json::json!({ "target": "clients" }),
    };
    let msg = ChannelMessage {
        channel: "collect".into(),
        payload: serde_json::to_string(&frame).unwrap(),
    };
    peer.dispatch(&state, &msg).await;

    let reply = recv_channel_message(&mut raw).await;
    let json: serde_json::Value = serde_json::from_str(&reply.payload).unwrap();
    let provided = json["body"]["body"].as_array().unwrap();
    assert_eq!(provided.len(), 1);
    assert_eq!(provided[0]["uuid"], serde_json::json!(local.uuid));
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let state = test_state_with_broker(Arc::clone(&broker));
    let peer = state.peer.as_ref().unwrap().clone();

    let mut raw = broker.subscribe(vec!["pong".into()]).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let frame = PeerFrame {
        server: DistServer { id: Uuid::new_v4() },
        client: None,
        body: serde_json::json!({}),
    };
    let msg = ChannelMessage { channel: "ping".into(), payload: serde_json::to_string(&frame).unwrap() };
    peer.dispatch(&state, &msg).await;

    let pong = recv_channel_message(&mut raw).await;
    let json: serde_json::Value = serde_json::from_str(&pong.payload).unwrap();
    assert_eq!(json["server"]["id"], serde_json::json!(state.server_id));
}

// =============================================================================
// End-to-end: two servers on one bus
// =============================================================================

#[tokio::test]
async fn join_propagates_between_servers() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let s1 = test_state_with_broker(Arc::clone(&broker));
    let s2 = test_state_with_broker(Arc::clone(&broker));

    tokio::spawn(s1.peer.as_ref().unwrap().clone().run(s1.clone()));
    tokio::spawn(s2.peer.as_ref().unwrap().clone().run(s2.clone()));
    sleep(Duration::from_millis(20)).await;

    // A is hosted on s1; B watches from s2.
    let (a, _rx_a) = bind_client(&s1, "a").await;
    let (_b, mut rx_b) = bind_client(&s2, "b").await;

    // One collect/provide cycle, kicked off by s2.
    s2.peer.as_ref().unwrap().publish_collect().await.unwrap();

    // B eventually sees a roster containing A, attributed to s1.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let event = recv_event(&mut rx_b).await;
        if let crate::protocol::ServerEvent::Clients { clients } = &event {
            if let Some(found) = clients.iter().find(|c| c.uuid == a.uuid) {
                assert_eq!(found.server_id, s1.server_id);
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "roster never converged");
    }

    assert!(s2.room.read().await.roster.get(a.uuid).is_some());
}

#[tokio::test]
async fn dead_server_is_pruned_after_silent_window() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let s1 = test_state_with_broker(Arc::clone(&broker));
    let peer1 = s1.peer.as_ref().unwrap().clone();
    let (_watcher, mut rx_w) = bind_client(&s1, "watcher").await;

    // A provide from a server that will go silent.
    let dead_server = Uuid::new_v4();
    let doomed = remote_client(dead_server);
    let frame = PeerFrame {
        server: DistServer { id: dead_server },
        client: None,
        body: serde_json::json!({ "target": "clients", "body": [doomed.clone()] }),
    };
    let msg = ChannelMessage {
        channel: "provide".into(),
        payload: serde_json::to_string(&frame).unwrap(),
    };
    peer1.dispatch(&s1, &msg).await;
    assert!(s1.room.read().await.roster.get(doomed.uuid).is_some());

    // The roster broadcast from the provide.
    let crate::protocol::ServerEvent::Clients { clients } = recv_event(&mut rx_w).await else {
        panic!("expected clients event");
    };
    assert!(clients.iter().any(|c| c.uuid == doomed.uuid));

    // One ping/pong round with nobody answering.
    peer1.liveness_cycle(&s1, Duration::from_millis(50)).await;

    assert!(s1.room.read().await.roster.get(doomed.uuid).is_none());
    let crate::protocol::ServerEvent::Clients { clients } = recv_event(&mut rx_w).await else {
        panic!("expected clients event");
    };
    assert!(!clients.iter().any(|c| c.uuid == doomed.uuid));
}

#[tokio::test]
async fn responsive_server_survives_liveness_cycle() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let s1 = test_state_with_broker(Arc::clone(&broker));
    let s2 = test_state_with_broker(Arc::clone(&broker));
    let peer1 = s1.peer.as_ref().unwrap().clone();

    // s2 is alive: its run loop answers pings.
    tokio::spawn(s2.peer.as_ref().unwrap().clone().run(s2.clone()));
    sleep(Duration::from_millis(20)).await;

    let alive = remote_client(s2.server_id);
    let frame = PeerFrame {
        server: DistServer { id: s2.server_id },
        client: None,
        body: serde_json::json!({ "target": "clients", "body": [alive.clone()] }),
    };
    let msg = ChannelMessage {
        channel: "provide".into(),
        payload: serde_json::to_string(&frame).unwrap(),
    };
    peer1.dispatch(&s1, &msg).await;

    // peer1's pong listener is its own run loop.
    tokio::spawn({
        let s1 = s1.clone();
        let peer1 = Arc::clone(&peer1);
        async move {
            // Only the dispatch loop matters here; drive it manually.
            let mut rx = broker.subscribe(vec!["pong".into()]).await.unwrap();
            while let Some(msg) = rx.recv().await {
                peer1.dispatch(&s1, &msg).await;
            }
        }
    });
    sleep(Duration::from_millis(20)).await;

    s1.peer
        .as_ref()
        .unwrap()
        .liveness_cycle(&s1, Duration::from_millis(200))
        .await;

    assert!(
        s1.room.read().await.roster.get(alive.uuid).is_some(),
        "a responsive server must not be pruned"
    );
}
