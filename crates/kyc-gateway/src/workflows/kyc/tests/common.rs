use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tokio::sync::Notify;

use crate::workflows::kyc::domain::{
    Applicant, ApplicantId, ApplicantProfile, ApplicantStatus, Document, ProviderReview,
    StepKind, StepStatus, VerificationStep, WebhookEvent,
};
use crate::workflows::kyc::provider::{
    DocumentUpload, ProviderError, ProviderReceipt, SdkToken, UploadFile, VerificationProvider,
};
use crate::workflows::kyc::repository::{KycRepository, RepositoryError};
use crate::workflows::kyc::state::UploadOutcome;
use crate::workflows::kyc::views::{DocumentUploadRequest, MediaUploadRequest};
use crate::workflows::kyc::{kyc_router, KycService, MemoryKycRepository, PersistPolicy};

pub(super) const WEBHOOK_SECRET: &str = "whsec-test";

pub(super) type TestService = KycService<MemoryKycRepository, ScriptedProvider>;

pub(super) fn profile() -> ApplicantProfile {
    ApplicantProfile {
        external_user_id: "user-42".to_string(),
        email: "ada@example.com".to_string(),
        phone: Some("+44 20 7946 0958".to_string()),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        country: "gbr".to_string(),
    }
}

pub(super) fn applicant() -> Applicant {
    let at = Utc
        .with_ymd_and_hms(2025, 3, 1, 9, 30, 0)
        .single()
        .expect("valid timestamp");
    Applicant::new(ApplicantId("app-1".to_string()), profile(), at)
}

pub(super) fn applicant_with(steps: &[(StepKind, StepStatus)]) -> Applicant {
    let mut applicant = applicant();
    for (kind, status) in steps {
        let mut step = applicant.step(*kind).clone();
        step.status = *status;
        applicant.steps.replace(step);
    }
    applicant
}

pub(super) fn green_review() -> ProviderReview {
    ProviderReview {
        review_status: "completed".to_string(),
        review_answer: Some("GREEN".to_string()),
        reject_type: None,
        moderation_comment: None,
    }
}

pub(super) fn document_request(applicant_id: &ApplicantId) -> DocumentUploadRequest {
    DocumentUploadRequest {
        applicant_id: applicant_id.0.clone(),
        document_type: "PASSPORT".to_string(),
        country: "GBR".to_string(),
        file_name: "passport.jpg".to_string(),
        content_base64: STANDARD.encode(b"fake-jpeg-bytes"),
    }
}

pub(super) fn liveness_request(applicant_id: &ApplicantId) -> MediaUploadRequest {
    MediaUploadRequest {
        applicant_id: applicant_id.0.clone(),
        file_name: None,
        content_base64: STANDARD.encode(b"fake-mp4-bytes"),
    }
}

pub(super) fn selfie_request(applicant_id: &ApplicantId) -> MediaUploadRequest {
    MediaUploadRequest {
        applicant_id: applicant_id.0.clone(),
        file_name: Some("selfie.png".to_string()),
        content_base64: STANDARD.encode(b"fake-png-bytes"),
    }
}

pub(super) fn fast_retries() -> PersistPolicy {
    PersistPolicy {
        attempts: 3,
        backoff: Duration::ZERO,
    }
}

pub(super) fn build_service() -> (Arc<TestService>, MemoryKycRepository, Arc<ScriptedProvider>) {
    let repository = MemoryKycRepository::default();
    let provider = Arc::new(ScriptedProvider::default());
    let service = KycService::new(Arc::new(repository.clone()), provider.clone())
        .with_webhook_secret(Some(WEBHOOK_SECRET.to_string()))
        .with_persist_policy(fast_retries());
    (Arc::new(service), repository, provider)
}

pub(super) fn router_with_service<R, P>(service: Arc<KycService<R, P>>) -> axum::Router
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    kyc_router(service)
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json body")
}

/// Pauses an upload inside the provider until released.
#[derive(Default)]
pub(super) struct UploadGate {
    pub(super) entered: Notify,
    pub(super) release: Notify,
}

/// Provider double answering from a per-step script.
#[derive(Default)]
pub(super) struct ScriptedProvider {
    scripted: Mutex<HashMap<StepKind, Result<ProviderReceipt, ProviderError>>>,
    review: Mutex<Option<ProviderReview>>,
    create_error: Mutex<Option<ProviderError>>,
    gate: Mutex<Option<Arc<UploadGate>>>,
    created: AtomicUsize,
    uploads: AtomicUsize,
    reviews_requested: AtomicUsize,
}

impl ScriptedProvider {
    pub(super) fn script(&self, kind: StepKind, result: Result<ProviderReceipt, ProviderError>) {
        self.scripted
            .lock()
            .expect("script lock")
            .insert(kind, result);
    }

    pub(super) fn reject(&self, kind: StepKind, description: &str) {
        self.script(
            kind,
            Err(ProviderError::Rejected {
                status: 400,
                code: Some("1001".to_string()),
                description: description.to_string(),
            }),
        );
    }

    pub(super) fn fail_creation(&self, error: ProviderError) {
        *self.create_error.lock().expect("create lock") = Some(error);
    }

    pub(super) fn set_review(&self, review: ProviderReview) {
        *self.review.lock().expect("review lock") = Some(review);
    }

    pub(super) fn install_gate(&self) -> Arc<UploadGate> {
        let gate = Arc::new(UploadGate::default());
        *self.gate.lock().expect("gate lock") = Some(gate.clone());
        gate
    }

    pub(super) fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub(super) fn reviews_requested(&self) -> usize {
        self.reviews_requested.load(Ordering::SeqCst)
    }

    async fn answer(&self, kind: StepKind) -> Result<ProviderReceipt, ProviderError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.scripted
            .lock()
            .expect("script lock")
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Ok(ProviderReceipt::accepted(Some(format!("doc-{kind}")))))
    }
}

#[async_trait]
impl VerificationProvider for ScriptedProvider {
    async fn create_applicant(
        &self,
        profile: &ApplicantProfile,
    ) -> Result<ApplicantId, ProviderError> {
        if let Some(error) = self.create_error.lock().expect("create lock").clone() {
            return Err(error);
        }
        let sequence = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ApplicantId(format!(
            "sbx-{}-{sequence}",
            profile.external_user_id
        )))
    }

    async fn submit_document(
        &self,
        _applicant_id: &ApplicantId,
        _document: &DocumentUpload,
    ) -> Result<ProviderReceipt, ProviderError> {
        self.answer(StepKind::IdScan).await
    }

    async fn submit_liveness(
        &self,
        _applicant_id: &ApplicantId,
        _video: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError> {
        self.answer(StepKind::FaceLiveness).await
    }

    async fn submit_selfie(
        &self,
        _applicant_id: &ApplicantId,
        _image: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError> {
        self.answer(StepKind::Selfie).await
    }

    async fn fetch_result(
        &self,
        _applicant_id: &ApplicantId,
    ) -> Result<ProviderReview, ProviderError> {
        Ok(self
            .review
            .lock()
            .expect("review lock")
            .clone()
            .unwrap_or_else(green_review))
    }

    async fn request_review(&self, _applicant_id: &ApplicantId) -> Result<(), ProviderError> {
        self.reviews_requested.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_sdk_token(
        &self,
        external_user_id: &str,
        ttl_secs: u32,
    ) -> Result<SdkToken, ProviderError> {
        Ok(SdkToken {
            token: format!("_act-sbx-{external_user_id}"),
            user_id: external_user_id.to_string(),
            ttl_secs,
        })
    }
}

pub(super) fn processing() -> Result<ProviderReceipt, ProviderError> {
    Ok(ProviderReceipt {
        outcome: UploadOutcome::Processing,
        document_id: None,
    })
}

/// Memory store with injectable write failures and a pausable read.
#[derive(Clone, Default)]
pub(super) struct FlakyRepository {
    pub(super) inner: MemoryKycRepository,
    step_failures: Arc<AtomicU32>,
    lost_acks: Arc<AtomicU32>,
    reject_uploads: Arc<AtomicBool>,
    step_attempts: Arc<AtomicU32>,
    load_gate: Arc<Mutex<Option<Arc<UploadGate>>>>,
}

impl FlakyRepository {
    /// Step writes fail with `Unavailable` before touching the store.
    pub(super) fn failing_step_writes(times: u32) -> Self {
        let repository = Self::default();
        repository.step_failures.store(times, Ordering::SeqCst);
        repository
    }

    /// Step writes commit, then report `Unavailable` as if the reply was lost.
    pub(super) fn losing_acks(times: u32) -> Self {
        let repository = Self::default();
        repository.lost_acks.store(times, Ordering::SeqCst);
        repository
    }

    /// Upload records are refused as invalid data until cleared.
    pub(super) fn rejecting_uploads() -> Self {
        let repository = Self::default();
        repository.reject_uploads.store(true, Ordering::SeqCst);
        repository
    }

    pub(super) fn accept_uploads(&self) {
        self.reject_uploads.store(false, Ordering::SeqCst);
    }

    /// The next applicant read returns its snapshot only once released.
    pub(super) fn pause_next_load(&self) -> Arc<UploadGate> {
        let gate = Arc::new(UploadGate::default());
        *self.load_gate.lock().expect("gate lock") = Some(gate.clone());
        gate
    }

    pub(super) fn step_attempts(&self) -> u32 {
        self.step_attempts.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn step_write<F, Fut>(&self, write: F) -> Result<(), RepositoryError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), RepositoryError>>,
    {
        self.step_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.step_failures) {
            return Err(RepositoryError::Unavailable("connection reset".to_string()));
        }
        write().await?;
        if Self::take(&self.lost_acks) {
            return Err(RepositoryError::Unavailable("reply lost".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KycRepository for FlakyRepository {
    async fn insert_applicant(&self, applicant: Applicant) -> Result<Applicant, RepositoryError> {
        self.inner.insert_applicant(applicant).await
    }

    async fn fetch_applicant(&self, id: &ApplicantId) -> Result<Option<Applicant>, RepositoryError> {
        let snapshot = self.inner.fetch_applicant(id).await?;
        let gate = self.load_gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(snapshot)
    }

    async fn find_by_external_user_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<Applicant>, RepositoryError> {
        self.inner.find_by_external_user_id(external_user_id).await
    }

    async fn update_step(
        &self,
        id: &ApplicantId,
        step: &VerificationStep,
        expected: StepStatus,
    ) -> Result<(), RepositoryError> {
        self.step_write(|| self.inner.update_step(id, step, expected))
            .await
    }

    async fn record_upload(
        &self,
        id: &ApplicantId,
        step: &VerificationStep,
        expected: StepStatus,
        document: Document,
    ) -> Result<(), RepositoryError> {
        if self.reject_uploads.load(Ordering::SeqCst) {
            self.step_attempts.fetch_add(1, Ordering::SeqCst);
            return Err(RepositoryError::Invalid(
                "value too long for type character varying(255)".to_string(),
            ));
        }
        self.step_write(|| self.inner.record_upload(id, step, expected, document))
            .await
    }

    async fn update_applicant(
        &self,
        id: &ApplicantId,
        status: ApplicantStatus,
        review: Option<&ProviderReview>,
    ) -> Result<(), RepositoryError> {
        self.inner.update_applicant(id, status, review).await
    }

    async fn documents(&self, id: &ApplicantId) -> Result<Vec<Document>, RepositoryError> {
        self.inner.documents(id).await
    }

    async fn insert_webhook_event(&self, event: WebhookEvent) -> Result<(), RepositoryError> {
        self.inner.insert_webhook_event(event).await
    }
}

pub(super) struct UnavailableRepository;

#[async_trait]
impl KycRepository for UnavailableRepository {
    async fn insert_applicant(&self, _applicant: Applicant) -> Result<Applicant, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    async fn fetch_applicant(
        &self,
        _id: &ApplicantId,
    ) -> Result<Option<Applicant>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    async fn find_by_external_user_id(
        &self,
        _external_user_id: &str,
    ) -> Result<Option<Applicant>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    async fn update_step(
        &self,
        _id: &ApplicantId,
        _step: &VerificationStep,
        _expected: StepStatus,
    ) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    async fn update_applicant(
        &self,
        _id: &ApplicantId,
        _status: ApplicantStatus,
        _review: Option<&ProviderReview>,
    ) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    async fn record_upload(
        &self,
        _id: &ApplicantId,
        _step: &VerificationStep,
        _expected: StepStatus,
        _document: Document,
    ) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    async fn documents(&self, _id: &ApplicantId) -> Result<Vec<Document>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    async fn insert_webhook_event(&self, _event: WebhookEvent) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}
