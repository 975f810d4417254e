//! Metrics collection and exposition.
//!
//! # Metrics
//! - `redirectd_signals_total` (counter): control signals by name
//! - `redirectd_reloads_total` (counter): reload outcomes
//! - `redirectd_upgrades_total` (counter): upgrade attempts by result
//! - `redirectd_generation_state` (gauge): current generation state
//! - `redirectd_active_connections` (gauge): in-flight request connections
//! - `redirectd_mirror_up` (gauge): 1=healthy, 0=unhealthy
//! - `redirectd_redirects_total` (counter): redirects by mirror

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_signal(name: &'static str) {
    counter!("redirectd_signals_total", "signal" => name).increment(1);
}

pub fn record_reload(outcome: &'static str) {
    counter!("redirectd_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_upgrade(result: &'static str) {
    counter!("redirectd_upgrades_total", "result" => result).increment(1);
}

pub fn record_generation_state(state: u8) {
    gauge!("redirectd_generation_state").set(f64::from(state));
}

pub fn record_active_connections(count: u64) {
    gauge!("redirectd_active_connections").set(count as f64);
}

pub fn record_mirror_health(mirror: &str, healthy: bool) {
    gauge!("redirectd_mirror_up", "mirror" => mirror.to_string()).set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_redirect(mirror: &str) {
    counter!("redirectd_redirects_total", "mirror" => mirror.to_string()).increment(1);
}
