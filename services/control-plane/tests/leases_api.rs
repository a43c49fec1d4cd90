//! Lease API and dashboard integration tests.

mod common;

use common::spawn_app;
use ember_control_plane::db::AdmissionCaps;
use ember_control_plane::lease::{Lease, LeaseState};
use serde_json::json;

const CAPS: AdmissionCaps = AdmissionCaps {
    global_max_vms: 100,
    label_max_inflight: 5,
};

#[tokio::test]
async fn list_leases_with_filters() {
    let (base, db, _dir) = spawn_app(|_| {}).await;
    let client = reqwest::Client::new();

    let lease = Lease::new_requested("linux", "ephemeral-", 240, 7200);
    db.leases().create_requested(&lease, CAPS).await.unwrap();

    let resp = client
        .get(format!("{base}/v1/leases"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert_eq!(body.len(), 1);
    assert_eq!(body[0]["state"], "REQUESTED");
    assert_eq!(body[0]["label"], "linux");

    let body: Vec<serde_json::Value> = client
        .get(format!("{base}/v1/leases?state=RUNNING"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body.is_empty());

    let body: Vec<serde_json::Value> = client
        .get(format!("{base}/v1/leases?label=linux&state=REQUESTED"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body.len(), 1);

    let resp = client
        .get(format!("{base}/v1/leases?state=BANANA"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn manual_terminate_is_idempotent() {
    let (base, db, _dir) = spawn_app(|_| {}).await;
    let client = reqwest::Client::new();

    let lease = Lease::new_requested("linux", "ephemeral-", 240, 7200);
    db.leases().create_requested(&lease, CAPS).await.unwrap();

    let resp = client
        .post(format!("{base}/v1/leases/{}/terminate", lease.lease_id))
        .json(&json!({ "reason": "operator cleanup" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["changed"], true);

    let stored = db.leases().get(&lease.lease_id).await.unwrap().unwrap();
    assert_eq!(stored.state, LeaseState::Terminating);
    assert_eq!(stored.last_error.as_deref(), Some("operator cleanup"));

    // Second call changes nothing.
    let body: serde_json::Value = client
        .post(format!("{base}/v1/leases/{}/terminate", lease.lease_id))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["changed"], false);

    let resp = client
        .post(format!("{base}/v1/leases/nope/terminate"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn vm_status_push_forces_teardown_on_crash() {
    let (base, db, _dir) = spawn_app(|_| {}).await;
    let client = reqwest::Client::new();

    let lease = Lease::new_requested("linux", "ephemeral-", 240, 7200);
    db.leases().create_requested(&lease, CAPS).await.unwrap();

    // A routine report records an event but changes nothing.
    let resp = client
        .post(format!("{base}/v1/vms/{}/status", lease.vm_id))
        .json(&json!({ "state": "running" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let stored = db.leases().get(&lease.lease_id).await.unwrap().unwrap();
    assert_eq!(stored.state, LeaseState::Requested);

    // A crash report forces TERMINATING.
    let resp = client
        .post(format!("{base}/v1/vms/{}/status", lease.vm_id))
        .json(&json!({ "state": "crashed", "reason": "qemu exited" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let stored = db.leases().get(&lease.lease_id).await.unwrap().unwrap();
    assert_eq!(stored.state, LeaseState::Terminating);
    assert_eq!(stored.last_error.as_deref(), Some("qemu exited"));

    let resp = client
        .post(format!("{base}/v1/vms/vm-unknown/status"))
        .json(&json!({ "state": "running" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn ui_serves_embedded_snapshot() {
    let (base, db, _dir) = spawn_app(|_| {}).await;

    let lease = Lease::new_requested("linux", "ephemeral-", 240, 7200);
    db.leases().create_requested(&lease, CAPS).await.unwrap();

    let resp = reqwest::get(format!("{base}/ui")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let html = resp.text().await.unwrap();
    assert!(html.contains("ember control plane"));
    assert!(html.contains("\"generated_at\""));
    assert!(html.contains(&lease.lease_id));
    // The page is static: no fetch/poll calls embedded.
    assert!(!html.contains("fetch("));
}
