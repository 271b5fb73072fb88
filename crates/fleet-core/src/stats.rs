//! Contadores y gauges de proceso.
//!
//! Cada métrica se identifica por nombre más una lista opcional de campos
//! (`flow_starts{ListProcesses}`). No hay exportación; los tests y el
//! binario leen los valores directamente.

use std::collections::BTreeMap;

use dashmap::DashMap;

pub const TASK_RETRANSMISSION_COUNT: &str = "task_retransmission_count";
pub const TASK_TTL_EXPIRED_COUNT: &str = "task_ttl_expired_count";
pub const WORKER_STATES_RUN: &str = "worker_states_run";
pub const FLOW_STARTS: &str = "flow_starts";
pub const FLOW_ERRORS: &str = "flow_errors";
pub const FLOW_COMPLETIONS: &str = "flow_completions";
pub const FLOW_INVALID_FLOW_COUNT: &str = "flow_invalid_flow_count";
pub const WELL_KNOWN_FLOW_REQUESTS: &str = "well_known_flow_requests";
pub const WELL_KNOWN_FLOW_ERRORS: &str = "well_known_flow_errors";
pub const RESPONSE_OUT_OF_ORDER: &str = "response_out_of_order";
pub const REQUEST_RETRANSMISSION_COUNT: &str = "request_retransmission_count";
pub const NOTIFICATION_QUEUE_COUNT: &str = "notification_queue_count";

#[derive(Debug, Default)]
pub struct Stats {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, i64>,
}

fn metric_key(metric: &str, fields: &[&str]) -> String {
    if fields.is_empty() {
        metric.to_string()
    } else {
        format!("{metric}{{{}}}", fields.join(","))
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, metric: &str, fields: &[&str]) {
        self.increment_by(metric, 1, fields);
    }

    pub fn increment_by(&self, metric: &str, delta: u64, fields: &[&str]) {
        *self.counters.entry(metric_key(metric, fields)).or_insert(0) += delta;
    }

    pub fn counter(&self, metric: &str, fields: &[&str]) -> u64 {
        self.counters.get(&metric_key(metric, fields)).map(|v| *v).unwrap_or(0)
    }

    pub fn set_gauge(&self, metric: &str, value: i64, fields: &[&str]) {
        self.gauges.insert(metric_key(metric, fields), value);
    }

    pub fn gauge(&self, metric: &str, fields: &[&str]) -> Option<i64> {
        self.gauges.get(&metric_key(metric, fields)).map(|v| *v)
    }

    /// Copia ordenada de todos los contadores.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}
