use std::time::Instant;

use anyhow::{Result, anyhow};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::error::StoreError;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static START_TIME: OnceCell<Instant> = OnceCell::new();

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

pub fn init() -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("bucketdb_http_request_duration_seconds".into()),
            LATENCY_BUCKETS,
        )
        .and_then(|builder| {
            builder.set_buckets_for_metric(
                Matcher::Full("bucketdb_store_operation_duration_seconds".into()),
                LATENCY_BUCKETS,
            )
        })
        .map_err(|err| anyhow!("failed to configure prometheus exporter: {err}"))?;
    let handle = builder
        .install_recorder()
        .map_err(|err| anyhow!("failed to initialise prometheus recorder: {err}"))?;

    describe_counter!(
        "bucketdb_http_requests_total",
        "Total number of HTTP requests processed by the bucketdb service."
    );
    describe_histogram!(
        "bucketdb_http_request_duration_seconds",
        "HTTP request latency observed by the bucketdb service."
    );
    describe_counter!(
        "bucketdb_store_operations_total",
        "Total number of object store reads and writes by backend and outcome."
    );
    describe_histogram!(
        "bucketdb_store_operation_duration_seconds",
        "Duration of object store reads and writes."
    );
    describe_counter!(
        "bucketdb_conditional_retries_total",
        "Conditional writes that lost a race and were retried after a re-read."
    );
    describe_counter!(
        "bucketdb_snapshot_updates_total",
        "Snapshot updates by outcome (written or stale)."
    );
    describe_counter!(
        "bucketdb_index_pointers_total",
        "Index pointer writes, skips and deletions."
    );
    describe_counter!(
        "bucketdb_events_total",
        "Change notifications received by handler and outcome."
    );
    describe_counter!(
        "bucketdb_alerts_total",
        "Alerts persisted by the rules engine."
    );
    describe_counter!(
        "bucketdb_alert_dispatch_failures_total",
        "Alert dispatches that failed after the alert was persisted."
    );
    describe_counter!(
        "bucketdb_compaction_shards_total",
        "Compacted shards written or failed."
    );

    let _ = PROMETHEUS_HANDLE.set(handle);
    let _ = START_TIME.set(Instant::now());
    Ok(())
}

pub async fn metrics_handler() -> Response {
    if PROMETHEUS_HANDLE.get().is_none() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not initialised",
        )
            .into_response();
    }

    let body = render_metrics();
    let headers = [(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    )];
    (StatusCode::OK, headers, body).into_response()
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let matched_path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string());
    let path = matched_path.unwrap_or_else(|| req.uri().path().to_string());
    let method_label = method.as_str().to_owned();

    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(
        "bucketdb_http_requests_total",
        1,
        "method" => method_label.clone(),
        "path" => path.clone(),
        "status" => status.clone()
    );
    histogram!(
        "bucketdb_http_request_duration_seconds",
        latency,
        "method" => method_label,
        "path" => path,
        "status" => status
    );

    response
}

pub fn record_store_op<T>(
    backend: &'static str,
    operation: &'static str,
    result: &Result<T, StoreError>,
    started: Instant,
) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) if err.is_precondition_failed() => "precondition_failed",
        Err(_) => "error",
    };
    counter!(
        "bucketdb_store_operations_total",
        1,
        "backend" => backend,
        "operation" => operation,
        "outcome" => outcome
    );
    histogram!(
        "bucketdb_store_operation_duration_seconds",
        started.elapsed().as_secs_f64(),
        "backend" => backend,
        "operation" => operation
    );
}

pub fn record_snapshot_update(entity: &'static str, outcome: &'static str) {
    counter!(
        "bucketdb_snapshot_updates_total",
        1,
        "entity" => entity,
        "outcome" => outcome
    );
}

pub fn record_index_pointer(dimension: &str, outcome: &'static str) {
    counter!(
        "bucketdb_index_pointers_total",
        1,
        "dimension" => dimension.to_owned(),
        "outcome" => outcome
    );
}

pub fn record_event(handler: &'static str, outcome: &'static str) {
    counter!(
        "bucketdb_events_total",
        1,
        "handler" => handler,
        "outcome" => outcome
    );
}

pub fn record_alert(rule: &str, severity: &'static str) {
    counter!(
        "bucketdb_alerts_total",
        1,
        "rule" => rule.to_owned(),
        "severity" => severity
    );
}

pub fn record_dispatch_failure(rule: &str, channel: &'static str) {
    counter!(
        "bucketdb_alert_dispatch_failures_total",
        1,
        "rule" => rule.to_owned(),
        "channel" => channel
    );
}

pub fn record_compaction_shard(entity: &'static str, outcome: &'static str) {
    counter!(
        "bucketdb_compaction_shards_total",
        1,
        "entity" => entity,
        "outcome" => outcome
    );
}

pub fn render_metrics() -> String {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        let mut body = handle.render();
        if let Some(start) = START_TIME.get() {
            let uptime = start.elapsed().as_secs_f64();
            body.push_str(&format!("bucketdb_uptime_seconds{{}} {}\n", uptime));
        }
        body
    } else {
        String::new()
    }
}
