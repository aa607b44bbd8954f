use prometheus::{Encoder, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    provisioning_events_total: IntCounterVec,
    authorization_denied_total: IntCounterVec,
}

// Collectors and their registry are published together
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Registers all collectors. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let http_requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )?;
    let http_request_duration_seconds = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        ),
        &["method", "path", "status"],
    )?;
    let provisioning_events_total = IntCounterVec::new(
        Opts::new(
            "provisioning_events_total",
            "Account onboarding events by kind and outcome",
        ),
        &["event", "outcome"],
    )?;
    let authorization_denied_total = IntCounterVec::new(
        Opts::new(
            "authorization_denied_total",
            "Privileged actions refused by the authorization engine",
        ),
        &["permission"],
    )?;

    registry.register(Box::new(http_requests_total.clone()))?;
    registry.register(Box::new(http_request_duration_seconds.clone()))?;
    registry.register(Box::new(provisioning_events_total.clone()))?;
    registry.register(Box::new(authorization_denied_total.clone()))?;

    let _ = METRICS.set(Metrics {
        registry,
        http_requests_total,
        http_request_duration_seconds,
        provisioning_events_total,
        authorization_denied_total,
    });
    Ok(())
}

pub fn record_http_request(method: &str, path: &str, status: &str, duration_seconds: f64) {
    if let Some(m) = METRICS.get() {
        m.http_requests_total
            .with_label_values(&[method, path, status])
            .inc();
        m.http_request_duration_seconds
            .with_label_values(&[method, path, status])
            .observe(duration_seconds);
    }
}

/// `event` is one of registration, verification, approval, login.
pub fn record_provisioning(event: &str, outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.provisioning_events_total
            .with_label_values(&[event, outcome])
            .inc();
    }
}

pub fn record_authorization_denied(permission: &str) {
    if let Some(m) = METRICS.get() {
        m.authorization_denied_total
            .with_label_values(&[permission])
            .inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match METRICS.get() {
        Some(m) => &m.registry,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_counter_shows_up_in_exposition() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        record_provisioning("registration", "created");
        let text = get_metrics();
        assert!(text.contains("provisioning_events_total"));
        assert!(text.contains("event=\"registration\""));
    }
}
