//! End-to-end playback sessions over WebSocket
//!
//! Timing assertions are loose: the stand-in player consumes instantly and
//! the daemon paces against its own playback clock.

mod common;

use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use common::{test_config, TestDaemon, CHUNK_100MS};
use speakd_daemon::player::{FileFallbackSpec, PlayerSpec};

#[tokio::test]
async fn test_stream_plays_to_completion() {
    let daemon = TestDaemon::spawn(test_config()).await;
    let mut client = daemon.connect().await;

    let started = client.start_session().await;
    let session_id = started["data"]["session_id"].as_str().unwrap().to_string();
    assert_eq!(started["data"]["player"], "sh");
    assert_eq!(started["data"]["format"]["sampleRate"], 24000);

    for _ in 0..10 {
        client.send_chunk(CHUNK_100MS).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    client.end_stream().await;

    let events = client
        .collect_until("completed", Duration::from_secs(10))
        .await;
    let completed = events.last().unwrap();
    assert_eq!(completed["data"]["session_id"], session_id.as_str());

    let timing = &completed["data"]["timing"];
    assert_eq!(timing["chunk_count"], 10);
    assert_eq!(timing["bytes_received"], 48_000);
    assert_eq!(timing["underruns"], 0);
    assert_eq!(timing["restarts"], 0);
    assert_relative_eq!(
        timing["expected_duration_ms"].as_f64().unwrap(),
        1010.0,
        epsilon = 0.5
    );
    assert!(timing["accuracy_percent"].as_f64().unwrap() > 80.0);

    // The state machine walked starting → playing → ending → completed
    let states: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "state_change")
        .map(|e| e["data"]["to"].as_str().unwrap())
        .collect();
    assert!(states.ends_with(&["ending", "completed"]), "{:?}", states);
    assert!(states.contains(&"playing"));

    assert_eq!(client.status().await["state"], "completed");
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_completion_waits_for_buffered_audio() {
    let daemon = TestDaemon::spawn(test_config()).await;
    let mut client = daemon.connect().await;
    client.start_session().await;

    // One second of audio delivered at once, then end immediately
    for _ in 0..10 {
        client.send_chunk(CHUNK_100MS).await;
    }
    let ended_at = Instant::now();
    client.end_stream().await;

    let completed = client.wait_for("completed", Duration::from_secs(10)).await;
    assert!(
        ended_at.elapsed() >= Duration::from_millis(800),
        "completed {:?} after end_stream",
        ended_at.elapsed()
    );
    let actual = completed["data"]["timing"]["actual_duration_ms"]
        .as_f64()
        .unwrap();
    assert!(actual >= 900.0, "actual duration {}", actual);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_gap_between_chunks_is_an_underrun_not_an_ending() {
    let daemon = TestDaemon::spawn(test_config()).await;
    let mut client = daemon.connect().await;
    client.start_session().await;

    for _ in 0..3 {
        client.send_chunk(CHUNK_100MS).await;
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let status = client.status().await;
    assert_eq!(status["state"], "playing");
    assert!(status["timing"]["underruns"].as_u64().unwrap() >= 1);

    // The stream resumes and still completes normally
    for _ in 0..3 {
        client.send_chunk(CHUNK_100MS).await;
    }
    client.end_stream().await;
    let completed = client.wait_for("completed", Duration::from_secs(10)).await;
    assert_eq!(completed["data"]["timing"]["chunk_count"], 6);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_idle_gap_within_grace_keeps_session_alive() {
    let mut config = test_config();
    config.playback.idle_grace_secs = 1.0;
    config.playback.stall_timeout_secs = 1.0;
    let daemon = TestDaemon::spawn(config).await;
    let mut client = daemon.connect().await;
    client.start_session().await;

    client.send_chunk(CHUNK_100MS).await;
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(client.status().await["state"], "playing");

    client.send_chunk(CHUNK_100MS).await;
    client.end_stream().await;
    let events = client
        .collect_until("completed", Duration::from_secs(10))
        .await;
    assert!(events.iter().all(|e| e["type"] != "error"), "{:?}", events);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_silent_producer_stalls() {
    let mut config = test_config();
    config.playback.idle_grace_secs = 0.3;
    config.playback.stall_timeout_secs = 0.5;
    let daemon = TestDaemon::spawn(config).await;
    let mut client = daemon.connect().await;
    client.start_session().await;

    client.send_chunk(CHUNK_100MS).await;

    let error = client.wait_for("error", Duration::from_secs(5)).await;
    assert_eq!(error["data"]["code"], "stalled");
    assert_eq!(client.status().await["state"], "error");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_pause_excludes_paused_time() {
    let daemon = TestDaemon::spawn(test_config()).await;
    let mut client = daemon.connect().await;
    client.start_session().await;

    for _ in 0..5 {
        client.send_chunk(CHUNK_100MS).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.control("pause").await;
    assert_eq!(client.status().await["state"], "paused");

    // End while paused: recorded, applied on resume
    client.end_stream().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.status().await["state"], "paused");

    client.control("resume").await;
    let completed = client.wait_for("completed", Duration::from_secs(10)).await;
    let timing = &completed["data"]["timing"];
    assert!(timing["paused_ms"].as_f64().unwrap() >= 400.0, "{}", timing);
    let actual = timing["actual_duration_ms"].as_f64().unwrap();
    assert!(actual < 900.0, "paused time leaked into actual duration: {}", actual);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_stop_reports_stopped() {
    let daemon = TestDaemon::spawn(test_config()).await;
    let mut client = daemon.connect().await;
    client.start_session().await;

    for _ in 0..20 {
        client.send_chunk(CHUNK_100MS).await;
    }
    client.control("stop").await;
    let status = client.status().await;
    assert_eq!(status["state"], "stopped");
    assert_eq!(status["timing"]["chunk_count"], 20);

    // Controls on a finished session are rejected
    client.control("pause").await;
    let error = client.wait_for("error", Duration::from_secs(5)).await;
    assert_eq!(error["data"]["code"], "invalid_transition");

    daemon.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_file_fallback_plays_short_stream_during_gap() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("played");

    let mut config = test_config();
    config.player.streaming = vec![PlayerSpec::Command {
        program: "speakd-no-such-player".to_string(),
        args: vec![],
    }];
    config.player.file_fallback = Some(FileFallbackSpec {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            format!("wc -c < \"$0\" >> '{}'", marker.display()),
            "{file}".to_string(),
        ],
    });
    let daemon = TestDaemon::spawn(config).await;
    let mut client = daemon.connect().await;
    let started = client.start_session().await;
    assert_eq!(started["data"]["player"], "sh (file)");

    // 300ms of audio, well short of one temp file, then the producer goes quiet
    for _ in 0..3 {
        client.send_chunk(CHUNK_100MS).await;
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let played: usize = std::fs::read_to_string(&marker)
        .unwrap_or_default()
        .lines()
        .map(|line| line.trim().parse::<usize>().unwrap())
        .sum();
    assert!(played >= 3 * CHUNK_100MS, "only {} bytes reached the player", played);

    let status = client.status().await;
    assert_eq!(status["state"], "playing");
    assert_eq!(status["buffer"]["size"], 0);

    daemon.shutdown().await;
}
