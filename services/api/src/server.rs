use crate::cli::ServeArgs;
use crate::infra::AppState;
use crate::routes::with_kyc_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use kyc_gateway::config::AppConfig;
use kyc_gateway::error::AppError;
use kyc_gateway::telemetry;
use kyc_gateway::workflows::kyc::{
    KycRepository, KycService, MemoryKycRepository, PostgresKycRepository, SumsubClient,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry, config.environment)?;

    let credentials = config.provider.credentials()?;
    let provider = Arc::new(SumsubClient::new(&config.provider, credentials)?);

    match config.database.url.clone() {
        Some(url) => {
            let repository =
                PostgresKycRepository::connect(&url, config.database.max_connections).await?;
            serve(config, Arc::new(repository), provider, "postgres").await
        }
        None => {
            warn!("DATABASE_URL is not set; applicant state is kept in memory only");
            let repository = MemoryKycRepository::default();
            serve(config, Arc::new(repository), provider, "memory").await
        }
    }
}

async fn serve<R>(
    config: AppConfig,
    repository: Arc<R>,
    provider: Arc<SumsubClient>,
    storage: &'static str,
) -> Result<(), AppError>
where
    R: KycRepository + 'static,
{
    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
        provider_environment: config.provider.environment.label(),
        storage,
    };

    let service = Arc::new(
        KycService::new(repository, provider)
            .with_webhook_secret(config.provider.webhook_secret.clone()),
    );

    let app = with_kyc_routes(service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        provider = config.provider.environment.label(),
        storage,
        %addr,
        "kyc gateway ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}

pub(crate) async fn migrate() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry, config.environment)?;

    let url = config.database.require_url()?;
    let repository = PostgresKycRepository::connect(url, config.database.max_connections).await?;
    let applied = repository.migrate().await?;

    info!(applied, "database migrations complete");
    Ok(())
}
