use std::{fmt::Write as _, time::Instant};

use anyhow::{Result, anyhow};
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::warn;

use crate::{server::AppState, store::IndexStore};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

pub fn init() -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("chainlog_http_request_duration_seconds".into()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?
        .set_buckets_for_metric(
            Matcher::Full("chainlog_store_operation_duration_seconds".into()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5],
        )
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?;
    let handle = builder
        .install_recorder()
        .map_err(|err| anyhow!("failed to initialise prometheus recorder: {err}"))?;

    describe_counter!(
        "chainlog_http_requests_total",
        "Total number of HTTP requests processed by the chainlog server."
    );
    describe_histogram!(
        "chainlog_http_request_duration_seconds",
        "HTTP request latency observed by the chainlog server."
    );
    describe_counter!(
        "chainlog_events_ingested_total",
        "Contract events applied to the aggregate store, by event kind."
    );
    describe_counter!(
        "chainlog_events_skipped_total",
        "Redelivered contract events skipped because the cursor had passed them."
    );
    describe_counter!(
        "chainlog_integrity_faults_total",
        "Counter updates refused because they would break active <= total."
    );
    describe_counter!(
        "chainlog_store_operations_total",
        "Total number of operations executed by the aggregate store."
    );
    describe_histogram!(
        "chainlog_store_operation_duration_seconds",
        "Duration of operations executed by the aggregate store."
    );

    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(handle) = PROMETHEUS_HANDLE.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not initialised",
        )
            .into_response();
    };

    let mut body = handle.render();
    match index_progress(state.store()) {
        Ok(progress) => body.push_str(&progress),
        Err(err) => warn!("failed to read index progress for metrics: {err}"),
    }
    let headers = [(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    )];
    (StatusCode::OK, headers, body).into_response()
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().as_str().to_owned();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(
        "chainlog_http_requests_total",
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status.clone()
    )
    .increment(1);
    histogram!(
        "chainlog_http_request_duration_seconds",
        "method" => method,
        "path" => path,
        "status" => status
    )
    .record(latency);

    response
}

/// Gauges for indexer progress, read from the store at scrape time so they
/// also cover events ingested by another process.
pub fn index_progress(store: &IndexStore) -> crate::Result<String> {
    let cursor = store.cursor()?;
    let global = store.global()?;

    let mut gauges = vec![
        (
            "chainlog_cursor_events_applied",
            "Events applied since the index was created.",
            cursor.events_applied,
        ),
        (
            "chainlog_logs_total",
            "Log entries stored in the index.",
            global.total_logs,
        ),
        (
            "chainlog_logs_active",
            "Log entries currently active.",
            global.active_logs,
        ),
        (
            "chainlog_users_total",
            "Distinct addresses seen by the indexer.",
            global.total_users,
        ),
    ];
    if let Some(position) = cursor.position {
        gauges.push((
            "chainlog_cursor_block_number",
            "Block of the last fully applied event.",
            position.block_number,
        ));
    }

    let mut out = String::new();
    for (name, help, value) in gauges {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        let _ = writeln!(out, "{name} {value}");
    }
    Ok(out)
}
