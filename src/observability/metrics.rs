use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub change_events_total: IntCounterVec,
    pub malformed_documents_total: IntCounter,
    pub transitions_total: IntCounterVec,
    pub mutation_latency_seconds: HistogramVec,
    pub alerts_total: IntCounterVec,
    pub active_alert_sessions: IntGauge,
    pub driver_sessions: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let change_events_total = IntCounterVec::new(
            Opts::new("change_events_total", "Change events applied by kind"),
            &["change"],
        )
        .expect("valid change_events_total metric");

        let malformed_documents_total = IntCounter::new(
            "malformed_documents_total",
            "Change events skipped because the document was malformed",
        )
        .expect("valid malformed_documents_total metric");

        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "Lifecycle transitions by trigger and outcome"),
            &["trigger", "outcome"],
        )
        .expect("valid transitions_total metric");

        let mutation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mutation_latency_seconds",
                "Latency of store status mutations in seconds",
            ),
            &["trigger"],
        )
        .expect("valid mutation_latency_seconds metric");

        let alerts_total = IntCounterVec::new(
            Opts::new("alerts_total", "Alerts delivered by kind"),
            &["kind"],
        )
        .expect("valid alerts_total metric");

        let active_alert_sessions = IntGauge::new(
            "active_alert_sessions",
            "Looping offer alerts currently running",
        )
        .expect("valid active_alert_sessions metric");

        let driver_sessions = IntGauge::new("driver_sessions", "Subscribed driver sessions")
            .expect("valid driver_sessions metric");

        registry
            .register(Box::new(change_events_total.clone()))
            .expect("register change_events_total");
        registry
            .register(Box::new(malformed_documents_total.clone()))
            .expect("register malformed_documents_total");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(mutation_latency_seconds.clone()))
            .expect("register mutation_latency_seconds");
        registry
            .register(Box::new(alerts_total.clone()))
            .expect("register alerts_total");
        registry
            .register(Box::new(active_alert_sessions.clone()))
            .expect("register active_alert_sessions");
        registry
            .register(Box::new(driver_sessions.clone()))
            .expect("register driver_sessions");

        Self {
            registry,
            change_events_total,
            malformed_documents_total,
            transitions_total,
            mutation_latency_seconds,
            alerts_total,
            active_alert_sessions,
            driver_sessions,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
