use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
    /// `sandbox` or `production`, reported by `/health`.
    pub(crate) provider_environment: &'static str,
    /// `postgres` or `memory`.
    pub(crate) storage: &'static str,
}
