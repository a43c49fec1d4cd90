//! Read-only dashboard.
//!
//! `GET /ui` returns a self-contained HTML page with one embedded JSON
//! snapshot; the page renders from that snapshot and never polls the API.
//! Snapshot shape (fixed):
//!
//! ```json
//! {
//!   "generated_at": "<rfc3339>",
//!   "counts": { "<STATE>": <n>, ... },
//!   "hosts": [ ...host rows... ],
//!   "leases": [ ...lease rows... ],
//!   "events": [ ...newest 100 events, newest first... ]
//! }
//! ```

use axum::{extract::State, response::Html, routing::get, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;

use crate::api::error::ApiError;
use crate::api::leases::LeaseResponse;
use crate::db::EventRow;
use crate::host::Host;
use crate::state::AppState;

const EVENT_WINDOW: i64 = 100;

#[derive(Debug, Serialize)]
struct Snapshot {
    generated_at: String,
    counts: HashMap<String, i64>,
    hosts: Vec<Host>,
    leases: Vec<LeaseResponse>,
    events: Vec<EventRow>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/ui", get(ui))
}

/// GET /ui
async fn ui(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let db = state.db();
    let counts = db
        .leases()
        .counts_by_state()
        .await?
        .into_iter()
        .map(|(state, n)| (state.as_str().to_string(), n))
        .collect();
    let snapshot = Snapshot {
        generated_at: Utc::now().to_rfc3339(),
        counts,
        hosts: db.hosts().list().await?,
        leases: db
            .leases()
            .list(&Default::default())
            .await?
            .into_iter()
            .map(LeaseResponse::from)
            .collect(),
        events: db.events().recent(EVENT_WINDOW).await?,
    };
    let json = serde_json::to_string(&snapshot)
        .map_err(|e| ApiError::internal("internal_error", e.to_string()))?;
    // </script> inside a JSON string would end the element early.
    let json = json.replace("</", "<\\/");
    Ok(Html(PAGE.replace("__SNAPSHOT__", &json)))
}

const PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>ember control plane</title>
<style>
  body { font-family: ui-monospace, monospace; margin: 2rem; background: #111; color: #ddd; }
  h1 { font-size: 1.2rem; }
  h2 { font-size: 1rem; margin-top: 2rem; }
  table { border-collapse: collapse; width: 100%; }
  th, td { border: 1px solid #333; padding: 0.3rem 0.6rem; text-align: left; font-size: 0.8rem; }
  th { background: #1c1c1c; }
  .muted { color: #777; }
</style>
</head>
<body>
<h1>ember control plane</h1>
<p class="muted">snapshot generated at <span id="generated-at"></span> (static; reload for fresh data)</p>
<h2>leases by state</h2>
<table id="counts"></table>
<h2>hosts</h2>
<table id="hosts"></table>
<h2>leases</h2>
<table id="leases"></table>
<h2>recent events</h2>
<table id="events"></table>
<script type="application/json" id="snapshot">__SNAPSHOT__</script>
<script>
  const snap = JSON.parse(document.getElementById('snapshot').textContent);
  document.getElementById('generated-at').textContent = snap.generated_at;

  function fill(id, rows, columns) {
    const table = document.getElementById(id);
    const header = '<tr>' + columns.map(c => '<th>' + c + '</th>').join('') + '</tr>';
    const body = rows.map(row =>
      '<tr>' + columns.map(c => '<td>' + String(row[c] ?? '') + '</td>').join('') + '</tr>'
    ).join('');
    table.innerHTML = header + body;
  }

  fill('counts', Object.entries(snap.counts).map(([state, count]) => ({state, count})),
       ['state', 'count']);
  fill('hosts', snap.hosts,
       ['host_id', 'enabled', 'cpu_free', 'ram_free_mb', 'io_pressure', 'last_seen']);
  fill('leases', snap.leases,
       ['lease_id', 'label', 'state', 'host_id', 'vm_id', 'last_error']);
  fill('events', snap.events.map(e => ({...e, payload: JSON.stringify(e.payload)})),
       ['id', 'timestamp', 'event_type', 'lease_id', 'payload']);
</script>
</body>
</html>
"#;
