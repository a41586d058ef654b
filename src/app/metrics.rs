//! Prometheus-based metrics
//!
//! Counters and gauges are global so the router and sessions can record
//! without a handle; the stats reporter reads them back for its summary.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Server ===

    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "arcproxy_sessions_active",
        "Number of connected client sessions"
    ).unwrap();

    /// Bytes written to clients by the download commands
    pub static ref DOWNLOADED_BYTES: IntCounter = IntCounter::new(
        "arcproxy_downloaded_bytes_total",
        "Total payload bytes sent to clients"
    ).unwrap();

    // === Container ===

    pub static ref REQUESTS_QUEUED: IntGauge = IntGauge::new(
        "arcproxy_requests_queued",
        "Number of requests waiting for execution"
    ).unwrap();

    pub static ref REQUESTS_EXECUTING: IntGauge = IntGauge::new(
        "arcproxy_requests_executing",
        "Number of requests being executed"
    ).unwrap();

    // === Router ===

    pub static ref SUBMITTED_REQUESTS: IntCounter = IntCounter::new(
        "arcproxy_submitted_requests_total",
        "Total sub-requests accepted by upstream nodes"
    ).unwrap();

    pub static ref ROUTER_PASSES: IntCounter = IntCounter::new(
        "arcproxy_router_passes_total",
        "Total routing passes"
    ).unwrap();

    pub static ref RETRIED_LINES: IntCounter = IntCounter::new(
        "arcproxy_retried_lines_total",
        "Total lines sent back for another routing pass"
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(DOWNLOADED_BYTES.clone())).ok();

    REGISTRY.register(Box::new(REQUESTS_QUEUED.clone())).ok();
    REGISTRY.register(Box::new(REQUESTS_EXECUTING.clone())).ok();

    REGISTRY.register(Box::new(SUBMITTED_REQUESTS.clone())).ok();
    REGISTRY.register(Box::new(ROUTER_PASSES.clone())).ok();
    REGISTRY.register(Box::new(RETRIED_LINES.clone())).ok();
}

/// One-line summary for the periodic stats log
pub fn summary() -> String {
    format!(
        "sessions: {}, queued: {}, executing: {}, sub-requests: {}, passes: {}, retried lines: {}, sent: {}",
        SESSIONS_ACTIVE.get(),
        REQUESTS_QUEUED.get(),
        REQUESTS_EXECUTING.get(),
        SUBMITTED_REQUESTS.get(),
        ROUTER_PASSES.get(),
        RETRIED_LINES.get(),
        format_bytes(DOWNLOADED_BYTES.get()),
    )
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("TB", 1 << 40),
        ("GB", 1 << 30),
        ("MB", 1 << 20),
        ("KB", 1 << 10),
    ];

    for (unit, size) in UNITS {
        if bytes >= size {
            return format!("{:.2} {}", bytes as f64 / size as f64, unit);
        }
    }
    format!("{} B", bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536 * 1024), "1.50 MB");
        assert_eq!(format_bytes(1 << 40), "1.00 TB");
    }

    #[test]
    fn test_registry_gathers_all() {
        init_metrics();
        init_metrics();
        let names: Vec<String> = REGISTRY.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"arcproxy_router_passes_total".to_string()));
        assert!(names.contains(&"arcproxy_sessions_active".to_string()));
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn test_summary_mentions_counts() {
        assert!(summary().starts_with("sessions: "));
    }
}
