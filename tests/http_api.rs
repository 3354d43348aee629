//! HTTP API integration tests: real axum server on an ephemeral port,
//! engine wired to the mock transport.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use chargied::config::ChargeConfig;
use chargied::server::{self, AppState};

use common::harness;

struct TestServer {
    base_url: String,
    shutdown_rx: mpsc::Receiver<()>,
    client: reqwest::Client,
}

async fn serve(h: &common::Harness) -> TestServer {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let app = server::router(AppState {
        engine: h.engine.clone(),
        shutdown: shutdown_tx,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        shutdown_rx,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn status_endpoint_reports_snapshot() {
    let h = harness(ChargeConfig::default(), 64, "Discharging");
    let server = serve(&h).await;

    let status: Value = server
        .client
        .get(format!("{}/api/status", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(status["phase"], "idle");
    assert_eq!(status["battery_percent"], 64);
    assert_eq!(status["is_charging"], false);
    assert_eq!(status["override"], Value::Null);
    assert_eq!(status["charge_max"], 80);
    assert_eq!(status["charge_min"], 75);
    assert_eq!(status["pd_mode"], 2);
    assert!(status.get("reconnect_attempt").is_none());
}

#[tokio::test]
async fn settings_round_trip_and_validation() {
    let h = harness(ChargeConfig::default(), 64, "Discharging");
    let server = serve(&h).await;

    let response = server
        .client
        .put(format!("{}/api/settings", server.base_url))
        .json(&json!({"charge_max": 90, "charge_min": 60}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let settings: Value = server
        .client
        .get(format!("{}/api/settings", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(settings["charge_max"], 90);
    assert_eq!(settings["charge_min"], 60);
    assert_eq!(settings["telemetry_interval"], 30);

    // Inverted window is rejected without touching state
    let response = server
        .client
        .put(format!("{}/api/settings", server.base_url))
        .json(&json!({"charge_max": 50}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("charge_min"));
    assert_eq!(h.engine.status().charge_max, 90);
}

#[tokio::test]
async fn override_without_device_is_rejected() {
    let h = harness(ChargeConfig::default(), 64, "Discharging");
    let server = serve(&h).await;

    let response = server
        .client
        .post(format!("{}/api/override", server.base_url))
        .json(&json!({"mode": "on"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = server
        .client
        .post(format!("{}/api/override", server.base_url))
        .json(&json!({"mode": "sideways"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("sideways"));
}

#[tokio::test]
async fn poll_without_device_is_rejected() {
    let h = harness(ChargeConfig::default(), 64, "Discharging");
    let server = serve(&h).await;

    let response = server
        .client
        .post(format!("{}/api/poll", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn chart_endpoint_returns_parallel_arrays() {
    let h = harness(ChargeConfig::default(), 64, "Discharging");
    let server = serve(&h).await;

    let chart: Value = server
        .client
        .get(format!("{}/api/chart", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    for key in ["timestamps", "percent", "charge_max", "charge_min", "charging"] {
        assert!(chart[key].is_array(), "missing series {key}");
    }
}

#[tokio::test]
async fn shutdown_endpoint_signals_daemon() {
    let h = harness(ChargeConfig::default(), 64, "Discharging");
    let mut server = serve(&h).await;

    let response = server
        .client
        .post(format!("{}/api/shutdown", server.base_url))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);

    let signalled = tokio::time::timeout(Duration::from_secs(1), server.shutdown_rx.recv())
        .await
        .expect("shutdown not signalled");
    assert!(signalled.is_some());
}

#[tokio::test]
async fn scan_endpoint_starts_engine() {
    let h = harness(ChargeConfig::default(), 64, "Discharging");
    h.transport.set_scan_available(false);
    let server = serve(&h).await;

    let response = server
        .client
        .post(format!("{}/api/scan", server.base_url))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // Nothing advertised: the spawned start returns the engine to idle
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.engine.status().phase, chargied::engine::Phase::Idle);
}
