use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Command processing (outcomes, latency)
// - Inbound envelopes (applied, duplicate, queued, refused, violations)
// - Outbound replication links (sent, acked, in flight, restarts)
// - Aggregate lifecycle (activations, passivations, live instances)
// - Retry attempts and circuit breaker state
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

mod server;

pub use server::start_metrics_server;

/// Central metrics registry for the entire application
pub struct Metrics {
    registry: Registry,

    // Command Metrics
    pub commands_total: IntCounterVec,
    pub command_duration: HistogramVec,

    // Inbound Replication Metrics
    pub envelopes_total: IntCounterVec,
    pub pending_envelopes: IntGauge,

    // Outbound Replication Metrics
    pub envelopes_sent: IntCounterVec,
    pub acks_received: IntCounterVec,
    pub envelopes_in_flight: IntGaugeVec,
    pub link_restarts: IntCounterVec,

    // Aggregate Lifecycle Metrics
    pub activations: IntCounterVec,
    pub passivations: IntCounterVec,
    pub active_aggregates: IntGauge,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_failure: IntCounterVec,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,

    // Health
    pub health_status: IntGauge,
    pub grpc_streams: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Command Metrics
        let commands_total = IntCounterVec::new(
            Opts::new("commands_total", "Commands handled by aggregates"),
            &["aggregate_type", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new("command_duration_seconds", "Time from command receipt to reply")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        // Inbound Replication Metrics
        let envelopes_total = IntCounterVec::new(
            Opts::new("replication_envelopes_total", "Inbound envelopes by outcome"),
            &["aggregate_type", "outcome"],
        )?;
        registry.register(Box::new(envelopes_total.clone()))?;

        let pending_envelopes = IntGauge::new(
            "replication_pending_envelopes",
            "Envelopes waiting in gap queues",
        )?;
        registry.register(Box::new(pending_envelopes.clone()))?;

        // Outbound Replication Metrics
        let envelopes_sent = IntCounterVec::new(
            Opts::new("replication_envelopes_sent_total", "Envelopes sent to peer regions"),
            &["peer"],
        )?;
        registry.register(Box::new(envelopes_sent.clone()))?;

        let acks_received = IntCounterVec::new(
            Opts::new("replication_acks_received_total", "Acknowledgments received from peers"),
            &["peer", "result"],
        )?;
        registry.register(Box::new(acks_received.clone()))?;

        let envelopes_in_flight = IntGaugeVec::new(
            Opts::new("replication_envelopes_in_flight", "Envelopes awaiting acknowledgment"),
            &["peer"],
        )?;
        registry.register(Box::new(envelopes_in_flight.clone()))?;

        let link_restarts = IntCounterVec::new(
            Opts::new("replication_link_restarts_total", "Replication link restarts"),
            &["peer"],
        )?;
        registry.register(Box::new(link_restarts.clone()))?;

        // Aggregate Lifecycle Metrics
        let activations = IntCounterVec::new(
            Opts::new("aggregate_activations_total", "Aggregate instances activated"),
            &["aggregate_type"],
        )?;
        registry.register(Box::new(activations.clone()))?;

        let passivations = IntCounterVec::new(
            Opts::new("aggregate_passivations_total", "Aggregate instances passivated"),
            &["aggregate_type", "reason"],
        )?;
        registry.register(Box::new(passivations.clone()))?;

        let active_aggregates = IntGauge::new("aggregate_instances_active", "Live aggregate instances")?;
        registry.register(Box::new(active_aggregates.clone()))?;

        // Retry Metrics
        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation", "attempt"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_failure = IntCounterVec::new(
            Opts::new("retry_failure_total", "Total failed retries after all attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_failure.clone()))?;

        // Circuit Breaker Metrics
        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        // Health
        let health_status = IntGauge::new(
            "health_status",
            "Overall health (0=Unhealthy, 1=Degraded, 2=Healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let grpc_streams = IntCounter::new(
            "replication_inbound_streams_total",
            "Inbound replication streams accepted",
        )?;
        registry.register(Box::new(grpc_streams.clone()))?;

        Ok(Self {
            registry,
            commands_total,
            command_duration,
            envelopes_total,
            pending_envelopes,
            envelopes_sent,
            acks_received,
            envelopes_in_flight,
            link_restarts,
            activations,
            passivations,
            active_aggregates,
            retry_attempts_total,
            retry_failure,
            circuit_breaker_state,
            circuit_breaker_transitions,
            health_status,
            grpc_streams,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Helper to record a command outcome
    pub fn record_command(&self, aggregate_type: &str, outcome: &str, duration_secs: f64) {
        self.commands_total.with_label_values(&[aggregate_type, outcome]).inc();
        self.command_duration
            .with_label_values(&[aggregate_type])
            .observe(duration_secs);
    }

    /// Helper to record retry attempt
    pub fn record_retry_attempt(&self, operation: &str, attempt: u32) {
        self.retry_attempts_total
            .with_label_values(&[operation, &attempt.to_string()])
            .inc();
    }

    pub fn record_retry_exhausted(&self, operation: &str) {
        self.retry_failure.with_label_values(&[operation]).inc();
    }

    /// Helper to update circuit breaker state
    pub fn update_circuit_breaker_state(&self, state: u8) {
        self.circuit_breaker_state.set(state as i64);
    }

    /// Helper to record circuit breaker transition
    pub fn record_circuit_breaker_transition(&self, from_state: &str, to_state: &str) {
        self.circuit_breaker_transitions
            .with_label_values(&[from_state, to_state])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_command() {
        let metrics = Metrics::new().unwrap();
        metrics.record_command("order", "persisted", 0.02);
        metrics.record_command("order", "persisted", 0.01);

        let gathered = metrics.registry.gather();
        let commands = gathered.iter().find(|m| m.name() == "commands_total").unwrap();
        assert_eq!(commands.metric[0].counter.value, Some(2.0));
    }

    #[test]
    fn test_record_retry() {
        let metrics = Metrics::new().unwrap();
        metrics.record_retry_attempt("replication_link", 1);
        metrics.record_retry_attempt("replication_link", 2);

        let gathered = metrics.registry.gather();
        let attempts = gathered.iter().find(|m| m.name() == "retry_attempts_total").unwrap();
        assert_eq!(attempts.metric.len(), 2); // Two different attempt labels
    }

    #[test]
    fn test_circuit_breaker_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.update_circuit_breaker_state(0); // Closed
        metrics.record_circuit_breaker_transition("Closed", "Open");
        metrics.update_circuit_breaker_state(1); // Open

        let gathered = metrics.registry.gather();
        let state = gathered.iter().find(|m| m.name() == "circuit_breaker_state").unwrap();
        assert_eq!(state.metric[0].gauge.value, Some(1.0));
    }
}
