//! HTTP endpoints and Prometheus text rendering.
//!
//! The scrape result is a flat list of records against a static catalogue,
//! so the exposition format is rendered directly: records are grouped by
//! descriptor in first-seen order, each group prefixed with its HELP and
//! TYPE lines. Exporter-internal meta metrics live in a conventional
//! registry and are appended through the standard text encoder.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::Html, response::IntoResponse};
use prometheus::{Encoder, Gauge, Registry, TextEncoder};
use tracing::{debug, error, instrument};

use crate::collector::Exporter;
use crate::metrics::MetricRecord;

/// Buffer capacity for metrics encoding.
const BUFFER_CAP: usize = 64 * 1024;

/// Error type for metrics endpoint failures.
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed,
    ScrapePanicked,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> axum::response::Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to collect metrics",
        )
            .into_response()
    }
}

/// Shared handler state: the exporter plus the meta-metric registry.
#[derive(Clone)]
pub struct AppState {
    pub exporter: Arc<Exporter>,
    pub registry: Registry,
    pub scrape_duration: Gauge,
}

impl AppState {
    pub fn new(exporter: Arc<Exporter>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let scrape_duration = Gauge::new(
            "libvirt_exporter_scrape_duration_seconds",
            "Duration of the last libvirt scrape in seconds.",
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;
        Ok(Self {
            exporter,
            registry,
            scrape_duration,
        })
    }
}

/// Handler for the metrics endpoint.
#[instrument(skip(state))]
pub async fn metrics_handler(State(state): State<AppState>) -> Result<String, MetricsError> {
    let start = Instant::now();
    debug!("Processing metrics request");

    // Collection blocks on the virtualization daemon and procfs; keep it off
    // the async workers.
    let exporter = state.exporter.clone();
    let output = tokio::task::spawn_blocking(move || exporter.scrape())
        .await
        .map_err(|e| {
            error!(error = %e, "scrape task failed");
            MetricsError::ScrapePanicked
        })?;

    state.scrape_duration.set(start.elapsed().as_secs_f64());

    let mut body = render(&output.records);

    let mut buffer = Vec::with_capacity(BUFFER_CAP);
    let encoder = TextEncoder::new();
    if encoder.encode(&state.registry.gather(), &mut buffer).is_err() {
        error!("Failed to encode exporter meta metrics");
        return Err(MetricsError::EncodingFailed);
    }
    body.push_str(&String::from_utf8(buffer).map_err(|_| MetricsError::EncodingFailed)?);

    debug!(
        records = output.records.len(),
        up = output.up,
        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Metrics request completed"
    );

    Ok(body)
}

/// Handler for the root endpoint: a small landing page.
#[instrument(skip(state))]
pub async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Processing / request");
    let version = env!("CARGO_PKG_VERSION");
    let uri = state.exporter.uri();

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Libvirt Exporter</title>
</head>
<body>
    <h1>Libvirt Exporter</h1>
    <p>Version {version}, connected to <code>{uri}</code></p>
    <p><a href="/metrics">Metrics</a></p>
</body>
</html>"#
    ))
}

/// Renders records in the Prometheus text exposition format. Records sharing
/// a descriptor are grouped under one HELP/TYPE header, in the order the
/// descriptor first appears.
pub fn render(records: &[MetricRecord]) -> String {
    let mut order: Vec<&'static str> = Vec::new();
    let mut groups: std::collections::HashMap<&'static str, Vec<&MetricRecord>> =
        std::collections::HashMap::new();

    for record in records {
        let entry = groups.entry(record.desc.name).or_default();
        if entry.is_empty() {
            order.push(record.desc.name);
        }
        entry.push(record);
    }

    let mut out = String::new();
    for name in order {
        let group = &groups[name];
        let desc = group[0].desc;
        // HELP/TYPE never fail to format into a String.
        let _ = writeln!(out, "# HELP {} {}", desc.name, desc.help);
        let _ = writeln!(out, "# TYPE {} {}", desc.name, desc.kind.as_str());
        for record in group {
            out.push_str(desc.name);
            if !desc.labels.is_empty() {
                out.push('{');
                for (i, (label, value)) in
                    desc.labels.iter().zip(&record.label_values).enumerate()
                {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{label}=\"{}\"", escape_label_value(value));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", record.value);
        }
    }
    out
}

/// Escapes a label value per the text exposition format: backslash, double
/// quote and newline.
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{self, MetricRecord};

    fn record(
        desc: &'static metrics::MetricDesc,
        value: f64,
        labels: &[&str],
    ) -> MetricRecord {
        MetricRecord::new(desc, value, labels.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_render_groups_records_under_one_header() {
        let records = vec![
            record(&metrics::DOMAIN_INFO_STATE, 1.0, &["vm-1"]),
            record(&metrics::DOMAIN_INFO_STATE, 5.0, &["vm-2"]),
        ];
        let text = render(&records);
        assert_eq!(
            text.matches("# HELP libvirt_domain_info_vstate").count(),
            1
        );
        assert!(text.contains("libvirt_domain_info_vstate{domain=\"vm-1\"} 1\n"));
        assert!(text.contains("libvirt_domain_info_vstate{domain=\"vm-2\"} 5\n"));
    }

    #[test]
    fn test_render_keeps_first_seen_order() {
        let records = vec![
            record(&metrics::UP, 1.0, &[]),
            record(&metrics::DOMAIN_INFO_STATE, 1.0, &["vm-1"]),
        ];
        let text = render(&records);
        let up_at = text.find("# HELP libvirt_up").unwrap();
        let state_at = text.find("# HELP libvirt_domain_info_vstate").unwrap();
        assert!(up_at < state_at);
    }

    #[test]
    fn test_render_unlabelled_record_has_no_braces() {
        let text = render(&[record(&metrics::UP, 1.0, &[])]);
        assert!(text.contains("libvirt_up 1\n"));
        assert!(!text.contains("libvirt_up{"));
    }

    #[test]
    fn test_render_type_lines() {
        let records = vec![
            record(&metrics::UP, 1.0, &[]),
            record(&metrics::DOMAIN_INFO_CPU_TIME, 12.5, &["vm-1"]),
        ];
        let text = render(&records);
        assert!(text.contains("# TYPE libvirt_up gauge\n"));
        assert!(text.contains("# TYPE libvirt_domain_info_cpu_time_seconds_total counter\n"));
        assert!(text.contains("{domain=\"vm-1\"} 12.5\n"));
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value(r"C:\disk"), r"C:\\disk");
        assert_eq!(escape_label_value("say \"hi\""), "say \\\"hi\\\"");
        assert_eq!(escape_label_value("a\nb"), "a\\nb");
        assert_eq!(escape_label_value("plain"), "plain");
    }
}
