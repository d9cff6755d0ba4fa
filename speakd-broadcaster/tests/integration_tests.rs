use speakd_broadcaster::{Broadcaster, ClientMessage, ErrorCode, ServerEvent};
use speakd_metrics::SessionState;
use std::time::Duration;

fn parse(frame: &str) -> serde_json::Value {
    serde_json::from_str(frame).unwrap()
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let broadcaster = Broadcaster::new(Duration::from_secs(30));
    let (_a, mut rx_a) = broadcaster.connect().await;
    let (_b, mut rx_b) = broadcaster.connect().await;

    let delivered = broadcaster
        .broadcast(&ServerEvent::Heartbeat { uptime_secs: 5.0 })
        .await;
    assert_eq!(delivered, 2);

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = rx.recv().await.unwrap();
        let json = parse(&frame);
        assert_eq!(json["type"], "heartbeat");
        assert!(json["timestamp"].is_i64());
    }
}

#[tokio::test]
async fn test_targeted_send_is_isolated() {
    let broadcaster = Broadcaster::new(Duration::from_secs(30));
    let (a, mut rx_a) = broadcaster.connect().await;
    let (_b, mut rx_b) = broadcaster.connect().await;

    let event = ServerEvent::StateChange {
        session_id: "a-session".to_string(),
        from: SessionState::Playing,
        to: SessionState::Paused,
    };
    assert!(broadcaster.send(a, &event).await);

    let frame = rx_a.recv().await.unwrap();
    assert_eq!(parse(&frame)["data"]["session_id"], "a-session");
    assert!(rx_b.try_recv().is_err(), "client B must not see A's events");
}

#[tokio::test]
async fn test_dead_clients_removed_on_broadcast() {
    let broadcaster = Broadcaster::new(Duration::from_secs(30));
    let (_a, rx_a) = broadcaster.connect().await;
    let (_b, _rx_b) = broadcaster.connect().await;
    assert_eq!(broadcaster.client_count().await, 2);

    // Connection A's writer task went away
    drop(rx_a);

    let delivered = broadcaster
        .broadcast(&ServerEvent::error(ErrorCode::Stalled, "test"))
        .await;
    assert_eq!(delivered, 1);
    assert_eq!(broadcaster.client_count().await, 1);
}

#[tokio::test]
async fn test_stale_client_detection() {
    let broadcaster = Broadcaster::new(Duration::from_secs(30));
    let (quiet, _rx_quiet) = broadcaster.connect().await;
    let (chatty, _rx_chatty) = broadcaster.connect().await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    broadcaster.heartbeat(chatty).await;

    let stale = broadcaster.stale_clients(Duration::from_millis(50)).await;
    assert_eq!(stale, vec![quiet]);

    let info = broadcaster.client_info().await;
    assert_eq!(info.len(), 2);
}

#[tokio::test]
async fn test_heartbeat_flood_is_accepted() {
    let broadcaster = Broadcaster::new(Duration::from_secs(30));
    let (id, _rx) = broadcaster.connect().await;

    for _ in 0..1000 {
        let msg = ClientMessage::parse(r#"{"type":"heartbeat","timestamp":1}"#).unwrap();
        assert_eq!(msg, ClientMessage::Heartbeat);
        broadcaster.heartbeat(id).await;
    }
    assert!(broadcaster.stale_clients(Duration::from_secs(1)).await.is_empty());
}
