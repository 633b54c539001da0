use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    http_requests_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    http_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    http_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_events_total: Mutex<HashMap<String, u64>>,
    ws_malformed_frames_total: AtomicU64,
    ws_active_connections: AtomicI64,
    broadcast_delivered_total: Mutex<HashMap<String, u64>>,
    broadcast_dropped_total: Mutex<HashMap<String, u64>>,
    persistence_written_total: AtomicU64,
    persistence_failed_total: AtomicU64,
}

/// Endpoint label for requests that matched no route.
pub const UNMATCHED_ENDPOINT: &str = "/unmatched";

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, route: Option<&str>, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, route, status_code, latency_ms);
    }
}

pub fn record_ws_event(event: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_event(event);
    }
}

pub fn record_malformed_frame() {
    if let Some(metrics) = global_metrics() {
        metrics.record_malformed_frame();
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_opened();
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_closed();
    }
}

pub fn record_broadcast(group_kind: &str, delivered: usize, dropped: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.record_broadcast(group_kind, delivered, dropped);
    }
}

pub fn record_persistence(succeeded: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_persistence(succeeded);
    }
}

impl RelayMetrics {
    /// `route` is the matched route template (`/v1/conversations/{id}`), never
    /// the raw path, so unknown paths all land in one series.
    pub fn record_http_request(
        &self,
        method: &str,
        route: Option<&str>,
        status_code: u16,
        latency_ms: u64,
    ) {
        let key = EndpointMetricKey {
            endpoint: route.unwrap_or(UNMATCHED_ENDPOINT).to_string(),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.http_requests_total, &key, 1);
        increment_counter(&self.http_duration_sum_ms, &key, latency_ms);
        if status_code >= 400 {
            increment_counter(&self.http_errors_total, &key, 1);
        }
    }

    pub fn record_ws_event(&self, event: &str) {
        increment_label_counter(&self.ws_events_total, &normalize_label(event), 1);
    }

    pub fn record_malformed_frame(&self) {
        self.ws_malformed_frames_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.ws_active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.ws_active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self, group_kind: &str, delivered: usize, dropped: usize) {
        let label = normalize_label(group_kind);
        increment_label_counter(&self.broadcast_delivered_total, &label, delivered as u64);
        increment_label_counter(&self.broadcast_dropped_total, &label, dropped as u64);
    }

    pub fn record_persistence(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.persistence_written_total
        } else {
            &self.persistence_failed_total
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        push_header(&mut output, "murmur_http_requests_total", "counter", "HTTP requests by endpoint.");
        append_endpoint_lines(&mut output, "murmur_http_requests_total", &self.http_requests_total);

        push_header(
            &mut output,
            "murmur_http_errors_total",
            "counter",
            "HTTP responses with status >= 400 by endpoint.",
        );
        append_endpoint_lines(&mut output, "murmur_http_errors_total", &self.http_errors_total);

        push_header(
            &mut output,
            "murmur_http_duration_ms_sum",
            "counter",
            "Sum of HTTP request latency in milliseconds by endpoint.",
        );
        append_endpoint_lines(&mut output, "murmur_http_duration_ms_sum", &self.http_duration_sum_ms);

        push_header(&mut output, "murmur_ws_events_total", "counter", "Inbound chat events by kind.");
        append_label_lines(&mut output, "murmur_ws_events_total", "event", &self.ws_events_total);

        push_header(
            &mut output,
            "murmur_ws_malformed_frames_total",
            "counter",
            "Inbound frames dropped because they could not be decoded.",
        );
        output.push_str(&format!(
            "murmur_ws_malformed_frames_total {}\n",
            self.ws_malformed_frames_total.load(Ordering::Relaxed)
        ));

        push_header(&mut output, "murmur_ws_active_connections", "gauge", "Open chat connections.");
        output.push_str(&format!(
            "murmur_ws_active_connections {}\n",
            self.ws_active_connections.load(Ordering::Relaxed).max(0)
        ));

        push_header(
            &mut output,
            "murmur_broadcast_delivered_total",
            "counter",
            "Events queued to group members by group kind.",
        );
        append_label_lines(
            &mut output,
            "murmur_broadcast_delivered_total",
            "group",
            &self.broadcast_delivered_total,
        );

        push_header(
            &mut output,
            "murmur_broadcast_dropped_total",
            "counter",
            "Events dropped for members with a full outbound queue.",
        );
        append_label_lines(
            &mut output,
            "murmur_broadcast_dropped_total",
            "group",
            &self.broadcast_dropped_total,
        );

        push_header(
            &mut output,
            "murmur_persistence_writes_total",
            "counter",
            "Chat message writes by outcome.",
        );
        output.push_str(&format!(
            "murmur_persistence_writes_total{{outcome=\"ok\"}} {}\n",
            self.persistence_written_total.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "murmur_persistence_writes_total{{outcome=\"failed\"}} {}\n",
            self.persistence_failed_total.load(Ordering::Relaxed)
        ));

        output
    }
}

fn push_header(output: &mut String, name: &str, kind: &str, help: &str) {
    output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n"));
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_endpoint_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
