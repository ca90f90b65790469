//! Prometheus metrics for the agent, registered once on the default
//! registry and served at `/metrics`.

use std::sync::OnceLock;

use prometheus::{
    register_int_counter, register_int_gauge, IntCounter, IntGauge, TextEncoder,
};

static METRICS: OnceLock<AgentMetrics> = OnceLock::new();

pub struct AgentMetrics {
    /// Completed reconcile loop iterations.
    pub reconcile_ticks: IntCounter,
    /// Sessions started on behalf of the controller or local requests.
    pub sessions_started: IntCounter,
    pub sessions_active: IntGauge,
    pub connections_active: IntGauge,
}

impl AgentMetrics {
    fn new() -> Self {
        Self {
            reconcile_ticks: register_int_counter!(
                "fleet_agent_reconcile_ticks_total",
                "Completed reconcile loop iterations"
            )
            .expect("register reconcile_ticks_total"),
            sessions_started: register_int_counter!(
                "fleet_agent_sessions_started_total",
                "Sessions started on this agent"
            )
            .expect("register sessions_started_total"),
            sessions_active: register_int_gauge!(
                "fleet_agent_sessions_active",
                "Sessions currently running on this agent"
            )
            .expect("register sessions_active"),
            connections_active: register_int_gauge!(
                "fleet_agent_connections_active",
                "Client connections currently attached to sessions"
            )
            .expect("register connections_active"),
        }
    }
}

pub fn metrics() -> &'static AgentMetrics {
    METRICS.get_or_init(AgentMetrics::new)
}

/// Render the default registry in Prometheus text exposition format.
pub fn render() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once_and_render() {
        metrics().reconcile_ticks.inc();
        metrics().reconcile_ticks.inc();
        let text = render();
        assert!(text.contains("fleet_agent_reconcile_ticks_total"));
    }
}
