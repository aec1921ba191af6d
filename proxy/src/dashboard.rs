/// HTTP statistics dashboard
///
/// Optional; enabled by the `dashboard` config key. Serves the live
/// hashrate, miner/upstream counts, the chart ring and the running
/// configuration as JSON, plus a small embedded index page.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{Config, DashboardEntry};
use crate::stats::{HrSample, Stats};
use crate::stratum::server::StratumServer;
use crate::upstream::Registry;

#[derive(Clone)]
pub struct DashboardState {
    pub stats: Stats,
    pub server: Arc<StratumServer>,
    pub registry: Arc<Registry>,
    pub config: Config,
}

const MAIN_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>cnproxy</title></head>
<body style="font-family: monospace; background: #101418; color: #d0d6dc">
<h2>cnproxy</h2>
<pre id="out">loading…</pre>
<script>
async function refresh() {
  const stats = await (await fetch('/stats')).json();
  document.getElementById('out').textContent =
    'hashrate:  ' + (stats.hr / 1000).toFixed(2) + ' kH/s\n' +
    'miners:    ' + stats.miners + '\n' +
    'upstreams: ' + stats.upstreams;
}
refresh();
setInterval(refresh, 5000);
</script>
</body>
</html>
"#;

pub async fn run(entry: DashboardEntry, state: DashboardState) -> Result<()> {
    let app = Router::new()
        .route("/", get(index))
        .route("/stats", get(stats))
        .route("/hr_chart", get(hr_chart))
        .route("/hr_chart_js", get(hr_chart_js))
        .route("/configuration", get(configuration))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((entry.host.as_str(), entry.port))
        .await
        .with_context(|| format!("binding dashboard {}:{}", entry.host, entry.port))?;
    info!("Dashboard listening on {}:{}", entry.host, entry.port);

    axum::serve(listener, app).await.context("serving dashboard")
}

async fn index() -> Html<&'static str> {
    Html(MAIN_PAGE)
}

async fn stats(State(state): State<DashboardState>) -> Json<Value> {
    let snapshot = state.stats.snapshot(&state.server, &state.registry).await;
    Json(json!({
        "hr": snapshot.hashrate,
        "miners": snapshot.miners,
        "upstreams": snapshot.upstreams,
    }))
}

async fn hr_chart(State(state): State<DashboardState>) -> Json<Vec<HrSample>> {
    Json(state.stats.chart())
}

async fn hr_chart_js(State(state): State<DashboardState>) -> Json<Value> {
    let samples = state.stats.chart();

    let mut labels = Vec::with_capacity(samples.len());
    let mut data = Vec::with_capacity(samples.len());
    let mut miners = Vec::with_capacity(samples.len());
    for sample in &samples {
        labels.push(time_since(sample.time));
        // kH/s with two decimals, chart-friendly.
        data.push((sample.hr / 10.0).round() / 100.0);
        miners.push(sample.miners);
    }

    Json(json!({ "labels": labels, "data": data, "miners": miners }))
}

async fn configuration(State(state): State<DashboardState>) -> Json<Config> {
    Json(state.config)
}

fn time_since(epoch: i64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let delta = now - epoch;

    if delta > 3600 {
        format!("{}h", delta / 3600)
    } else if delta > 60 {
        format!("{}m", delta / 60)
    } else {
        format!("{}s", delta)
    }
}
