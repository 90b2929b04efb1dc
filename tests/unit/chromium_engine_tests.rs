//! Unit tests for the browser engine, driven through `sh` stand-ins.
//!
//! The stand-in prints the browser's ready marker to stderr and then execs
//! `sleep`, so launch, probe, and terminate run against a real child process.

#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use channel_supervisor::config::EngineConfig;
use channel_supervisor::engine::chromium::ChromiumEngine;
use channel_supervisor::engine::{AutomationEngine, LaunchSpec};
use channel_supervisor::models::verdict::Verdict;
use channel_supervisor::AppError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const READY_THEN_SLEEP: &str = "echo 'DevTools listening on ws://127.0.0.1/devtools' >&2; exec sleep 30";

fn engine(script: &str, startup_timeout_seconds: u64) -> ChromiumEngine {
    ChromiumEngine::new(EngineConfig {
        binary: "sh".into(),
        args: vec!["-c".into(), script.into()],
        startup_timeout_seconds,
        probe_timeout_seconds: 1,
        terminate_grace_seconds: 2,
        ..EngineConfig::default()
    })
    .expect("engine")
}

fn spec(dir: &Path, debug_port: u16) -> LaunchSpec {
    LaunchSpec {
        session_id: "wa-test".into(),
        profile_dir: dir.join("session-wa-test"),
        cache_dir: dir.join("cache"),
        debug_port,
    }
}

/// A port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr").port()
}

/// Serve `200 OK` to every request on a fresh local port.
async fn version_endpoint() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0_u8; 1024];
            let _ = stream.read(&mut buf).await;
            let body = r#"{"Browser":"HeadlessChrome"}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });
    port
}

#[tokio::test]
async fn launch_waits_for_ready_marker_and_probe_is_healthy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = version_endpoint().await;
    let engine = engine(READY_THEN_SLEEP, 5);

    let handle = engine.launch(&spec(dir.path(), port)).await.expect("launch");

    assert!(handle.pid() > 0);
    assert_eq!(
        handle.endpoint(),
        Some(format!("http://127.0.0.1:{port}").as_str())
    );
    let verdict = engine
        .probe_liveness(&handle, Duration::from_secs(1))
        .await;
    assert_eq!(verdict, Verdict::Healthy);

    engine.terminate(handle).await;
}

#[tokio::test]
async fn live_process_with_silent_endpoint_is_unresponsive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(READY_THEN_SLEEP, 5);
    let handle = engine
        .launch(&spec(dir.path(), closed_port().await))
        .await
        .expect("launch");

    let verdict = engine
        .probe_liveness(&handle, Duration::from_millis(500))
        .await;

    assert_eq!(verdict, Verdict::Unresponsive);
    engine.terminate(handle).await;
}

#[tokio::test]
async fn terminated_process_is_crashed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(READY_THEN_SLEEP, 5);
    let handle = engine
        .launch(&spec(dir.path(), closed_port().await))
        .await
        .expect("launch");
    let probe_handle = handle.clone();

    let started = std::time::Instant::now();
    engine.terminate(handle).await;

    assert!(started.elapsed() < Duration::from_secs(2), "SIGTERM is honoured");
    let verdict = engine
        .probe_liveness(&probe_handle, Duration::from_millis(500))
        .await;
    assert_eq!(verdict, Verdict::Crashed);
}

#[tokio::test]
async fn exit_before_ready_marker_is_launch_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine("echo 'profile in use' >&2; exit 21", 5);

    let err = engine
        .launch(&spec(dir.path(), 9222))
        .await
        .expect_err("launch fails");

    assert!(matches!(err, AppError::Launch(ref msg) if msg.contains("before ready")));
}

#[tokio::test]
async fn missing_ready_marker_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine("exec sleep 30", 1);

    let started = std::time::Instant::now();
    let err = engine
        .launch(&spec(dir.path(), 9222))
        .await
        .expect_err("launch times out");

    assert!(matches!(err, AppError::Launch(ref msg) if msg.contains("startup timeout")));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn missing_binary_is_launch_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = ChromiumEngine::new(EngineConfig {
        binary: "/nonexistent/chromium".into(),
        ..EngineConfig::default()
    })
    .expect("engine");

    let err = engine
        .launch(&spec(dir.path(), 9222))
        .await
        .expect_err("spawn fails");

    assert!(matches!(err, AppError::Launch(ref msg) if msg.contains("failed to spawn")));
}
