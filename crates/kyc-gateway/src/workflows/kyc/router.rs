use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use super::domain::{ApplicantId, ApplicantProfile};
use super::provider::{ProviderError, VerificationProvider};
use super::repository::{KycRepository, RepositoryError};
use super::service::{KycService, KycServiceError, MAX_UPLOAD_BYTES};
use super::signing::WEBHOOK_DIGEST_HEADER;
use super::views::{DocumentUploadRequest, MediaUploadRequest};

/// Base64 inflates uploads by a third; leave room for the JSON envelope.
const BODY_LIMIT_BYTES: usize = MAX_UPLOAD_BYTES / 3 * 4 + 64 * 1024;

/// Router exposing the KYC endpoints.
pub fn kyc_router<R, P>(service: Arc<KycService<R, P>>) -> Router
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    Router::new()
        .route("/kyc/create-applicant", post(create_handler::<R, P>))
        .route("/kyc/applicant/:applicant_id", get(applicant_handler::<R, P>))
        .route(
            "/kyc/applicant/:applicant_id/documents",
            get(documents_handler::<R, P>),
        )
        .route(
            "/kyc/applicant/:applicant_id/submit",
            post(submit_handler::<R, P>),
        )
        .route(
            "/kyc/applicant/:applicant_id/sdk-token",
            post(sdk_token_handler::<R, P>),
        )
        .route("/kyc/upload-document", post(document_handler::<R, P>))
        .route("/kyc/upload-liveness", post(liveness_handler::<R, P>))
        .route("/kyc/upload-selfie", post(selfie_handler::<R, P>))
        .route("/kyc/result/:applicant_id", get(result_handler::<R, P>))
        .route("/kyc/webhooks/verification", post(webhook_handler::<R, P>))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .with_state(service)
}

pub(crate) async fn create_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Json(profile): Json<ApplicantProfile>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    match service.create_applicant(profile).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn applicant_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Path(applicant_id): Path<String>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    respond(service.applicant(&ApplicantId(applicant_id)).await)
}

pub(crate) async fn documents_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Path(applicant_id): Path<String>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    respond(service.documents(&ApplicantId(applicant_id)).await)
}

pub(crate) async fn document_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Json(request): Json<DocumentUploadRequest>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    respond(service.upload_document(request).await)
}

pub(crate) async fn liveness_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Json(request): Json<MediaUploadRequest>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    respond(service.upload_liveness(request).await)
}

pub(crate) async fn selfie_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Json(request): Json<MediaUploadRequest>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    respond(service.upload_selfie(request).await)
}

pub(crate) async fn result_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Path(applicant_id): Path<String>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    respond(service.result(&ApplicantId(applicant_id)).await)
}

pub(crate) async fn submit_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Path(applicant_id): Path<String>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    match service.submit_for_review(&ApplicantId(applicant_id)).await {
        Ok(view) => (StatusCode::ACCEPTED, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn sdk_token_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    Path(applicant_id): Path<String>,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    respond(service.sdk_token(&ApplicantId(applicant_id)).await)
}

pub(crate) async fn webhook_handler<R, P>(
    State(service): State<Arc<KycService<R, P>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    let signature = headers
        .get(WEBHOOK_DIGEST_HEADER)
        .and_then(|value| value.to_str().ok());
    respond(service.handle_webhook(&body, signature).await)
}

fn respond<T: serde::Serialize>(result: Result<T, KycServiceError>) -> Response {
    match result {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => err.into_response(),
    }
}

impl KycServiceError {
    /// Machine-readable code reported in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            KycServiceError::Validation(_) => "VALIDATION_ERROR",
            KycServiceError::NotFound(_)
            | KycServiceError::Provider(ProviderError::NotFound(_))
            | KycServiceError::Repository(RepositoryError::NotFound) => "APPLICANT_NOT_FOUND",
            KycServiceError::Transition(_) => "INVALID_TRANSITION",
            KycServiceError::UploadInFlight { .. } => "UPLOAD_IN_FLIGHT",
            KycServiceError::NotFinalizable { .. } => "NOT_FINALIZABLE",
            KycServiceError::InvalidSignature => "INVALID_SIGNATURE",
            KycServiceError::Provider(ProviderError::Transport(_)) => "PROVIDER_UNAVAILABLE",
            KycServiceError::Provider(ProviderError::Rejected { .. }) => "PROVIDER_REJECTED",
            KycServiceError::Provider(ProviderError::Decode(_)) => "PROVIDER_ERROR",
            KycServiceError::Provider(ProviderError::Signing(_)) => "PROVIDER_MISCONFIGURED",
            KycServiceError::Repository(RepositoryError::Conflict) => "APPLICANT_EXISTS",
            KycServiceError::Repository(_) => "PERSISTENCE_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            KycServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            KycServiceError::NotFound(_)
            | KycServiceError::Provider(ProviderError::NotFound(_))
            | KycServiceError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
            KycServiceError::Transition(_)
            | KycServiceError::UploadInFlight { .. }
            | KycServiceError::NotFinalizable { .. }
            | KycServiceError::Repository(RepositoryError::Conflict) => StatusCode::CONFLICT,
            KycServiceError::InvalidSignature => StatusCode::UNAUTHORIZED,
            KycServiceError::Provider(ProviderError::Rejected { status, .. }) => {
                StatusCode::from_u16(*status)
                    .ok()
                    .filter(StatusCode::is_client_error)
                    .unwrap_or(StatusCode::BAD_GATEWAY)
            }
            KycServiceError::Provider(ProviderError::Transport(_))
            | KycServiceError::Provider(ProviderError::Decode(_)) => StatusCode::BAD_GATEWAY,
            KycServiceError::Provider(ProviderError::Signing(_))
            | KycServiceError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Value {
        match self {
            KycServiceError::Validation(err) => json!({ "field": err.field }),
            KycServiceError::NotFound(id) | KycServiceError::Provider(ProviderError::NotFound(id)) => {
                json!({ "applicant_id": id })
            }
            KycServiceError::Transition(err) => json!({ "step": err.step(), "status": err.status() }),
            KycServiceError::UploadInFlight { applicant_id, step } => {
                json!({ "applicant_id": applicant_id, "step": step })
            }
            KycServiceError::NotFinalizable {
                applicant_id,
                unfinished,
            } => json!({ "applicant_id": applicant_id, "unfinished_steps": unfinished }),
            KycServiceError::Provider(ProviderError::Rejected { status, code, .. }) => {
                json!({ "upstream_status": status, "upstream_code": code })
            }
            _ => json!({}),
        }
    }
}

impl IntoResponse for KycServiceError {
    fn into_response(self) -> Response {
        let payload = json!({
            "error": self.code(),
            "message": self.to_string(),
            "details": self.details(),
        });
        (self.status_code(), Json(payload)).into_response()
    }
}
