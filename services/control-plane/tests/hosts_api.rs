//! Host API integration tests: registration, heartbeats, enable/disable.

mod common;

use common::spawn_app;
use ember_control_plane::auth::hash_token;
use serde_json::json;

fn register_body() -> serde_json::Value {
    json!({
        "agent_version": "0.3.0",
        "agent_url": "http://10.0.0.5:9000",
        "cpu_total": 8,
        "ram_total_mb": 16384,
        "os_family": "linux",
        "cpu_arch": "x86_64",
        "selected_accel": "kvm",
        "supported_accels": ["kvm", "tcg"],
    })
}

#[tokio::test]
async fn register_requires_known_host() {
    let (base, _db, _dir) = spawn_app(|_| {}).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/hosts/h1/register"))
        .bearer_auth("whatever")
        .json(&register_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn register_auto_creates_behind_dev_flag() {
    let (base, _db, _dir) = spawn_app(|c| c.allow_unknown_host_registration = true).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/hosts/dev-box/register"))
        .bearer_auth("dev-token")
        .json(&register_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["session_token"].as_str().unwrap().starts_with("sess_"));
    assert_eq!(body["heartbeat_interval_sec"], 10);
}

#[tokio::test]
async fn register_and_heartbeat_flow() {
    let (base, db, _dir) = spawn_app(|_| {}).await;
    let client = reqwest::Client::new();
    db.hosts()
        .provision("h1", &hash_token("boot-secret"))
        .await
        .unwrap();

    // Wrong bootstrap token is rejected and audited.
    let resp = client
        .post(format!("{base}/v1/hosts/h1/register"))
        .bearer_auth("wrong")
        .json(&register_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let events = db.events().recent(10).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "auth.fail"));

    // Correct bootstrap token yields a session.
    let resp = client
        .post(format!("{base}/v1/hosts/h1/register"))
        .bearer_auth("boot-secret")
        .json(&register_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let session = body["session_token"].as_str().unwrap().to_string();

    // Bootstrap token is not a session token.
    let heartbeat = json!({
        "cpu_free": 6, "ram_free_mb": 12000, "io_pressure": 0.2,
        "active_vm_ids": ["vm-abc"],
    });
    let resp = client
        .post(format!("{base}/v1/hosts/h1/heartbeat"))
        .bearer_auth("boot-secret")
        .json(&heartbeat)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // The session token is accepted and the snapshot lands in the store.
    let resp = client
        .post(format!("{base}/v1/hosts/h1/heartbeat"))
        .bearer_auth(&session)
        .json(&heartbeat)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let host = db.hosts().get("h1").await.unwrap().unwrap();
    assert_eq!(host.cpu_free, 6);
    assert_eq!(host.active_vm_ids, vec!["vm-abc"]);
    assert!(host.last_seen.is_some());

    // Capacity validation happens before any state change.
    let resp = client
        .post(format!("{base}/v1/hosts/h1/heartbeat"))
        .bearer_auth(&session)
        .json(&json!({ "cpu_free": 6, "ram_free_mb": 12000, "io_pressure": 1.5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Disable drops the session and rejects further heartbeats.
    let resp = client
        .post(format!("{base}/v1/hosts/h1/disable"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .post(format!("{base}/v1/hosts/h1/heartbeat"))
        .bearer_auth(&session)
        .json(&heartbeat)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Re-enabled hosts must register again (session was dropped).
    let resp = client
        .post(format!("{base}/v1/hosts/h1/enable"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .post(format!("{base}/v1/hosts/h1/heartbeat"))
        .bearer_auth(&session)
        .json(&heartbeat)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn healthz_reports_store_reachable() {
    let (base, _db, _dir) = spawn_app(|_| {}).await;
    let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn metrics_render_prometheus_text() {
    let (base, _db, _dir) = spawn_app(|_| {}).await;
    let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("leases_by_state"));
}
