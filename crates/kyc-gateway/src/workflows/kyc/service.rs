use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::domain::{
    Applicant, ApplicantId, ApplicantProfile, ApplicantStatus, Document, DocumentType,
    ProviderReview, StepKind, StepStatus, WebhookEvent,
};
use super::provider::{
    DocumentUpload, ProviderError, ProviderReceipt, UploadFile, VerificationProvider,
};
use super::repository::{KycRepository, RepositoryError};
use super::signing::{content_digest, verify_webhook_signature};
use super::state::{self, TransitionError, UploadOutcome};
use super::views::{
    ApplicantView, DocumentListView, DocumentUploadRequest, MediaUploadRequest, ResultView,
    ReviewSubmissionView, SdkTokenView, UploadView, WebhookAck,
};

/// Largest decoded upload forwarded to the provider.
pub const MAX_UPLOAD_BYTES: usize = 15 * 1024 * 1024;

const MAX_FILE_NAME_CHARS: usize = 255;
const SDK_TOKEN_TTL_SECS: u32 = 600;
const REVIEWED_EVENT: &str = "applicantReviewed";

/// How persistence writes that follow a successful provider call are retried.
#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Orchestrates the endpoint layer, the workflow state model, the provider,
/// and persistence.
pub struct KycService<R, P> {
    repository: Arc<R>,
    provider: Arc<P>,
    webhook_secret: Option<String>,
    in_flight: Arc<InFlightUploads>,
    persist: PersistPolicy,
}

impl<R, P> KycService<R, P>
where
    R: KycRepository + 'static,
    P: VerificationProvider + 'static,
{
    pub fn new(repository: Arc<R>, provider: Arc<P>) -> Self {
        Self {
            repository,
            provider,
            webhook_secret: None,
            in_flight: Arc::new(InFlightUploads::default()),
            persist: PersistPolicy::default(),
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret;
        self
    }

    pub fn with_persist_policy(mut self, policy: PersistPolicy) -> Self {
        self.persist = policy;
        self
    }

    /// Register an applicant with the provider and persist the fresh checklist.
    pub async fn create_applicant(
        &self,
        profile: ApplicantProfile,
    ) -> Result<ApplicantView, KycServiceError> {
        let profile = validate_profile(profile)?;

        if self
            .repository
            .find_by_external_user_id(&profile.external_user_id)
            .await?
            .is_some()
        {
            return Err(RepositoryError::Conflict.into());
        }

        let applicant_id = self.provider.create_applicant(&profile).await?;
        let applicant = Applicant::new(applicant_id, profile, Utc::now());
        let stored = self
            .with_retry("insert applicant", || {
                self.repository.insert_applicant(applicant.clone())
            })
            .await?;

        info!(
            applicant_id = %stored.id,
            external_user_id = %stored.profile.external_user_id,
            "applicant created"
        );
        Ok(ApplicantView::from(&stored))
    }

    pub async fn applicant(&self, id: &ApplicantId) -> Result<ApplicantView, KycServiceError> {
        let applicant = self.load(id).await?;
        Ok(ApplicantView::from(&applicant))
    }

    /// Uploaded artifacts for one applicant, oldest first.
    pub async fn documents(&self, id: &ApplicantId) -> Result<DocumentListView, KycServiceError> {
        let applicant = self.load(id).await?;
        let documents = self.repository.documents(id).await?;
        Ok(DocumentListView::new(&applicant, documents))
    }

    pub async fn upload_document(
        &self,
        request: DocumentUploadRequest,
    ) -> Result<UploadView, KycServiceError> {
        let document_type = DocumentType::parse(&request.document_type)
            .filter(|kind| kind.step() == StepKind::IdScan)
            .ok_or_else(|| {
                ValidationError::new(
                    "document_type",
                    format!("'{}' is not an identity document type", request.document_type),
                )
            })?;
        let country = validate_country(&request.country)?;
        let file = decode_file(
            &request.content_base64,
            Some(request.file_name.as_str()),
            "document",
            &[mime::IMAGE, mime::APPLICATION],
        )?;
        let record = StoredFile::from(&file);
        let upload = DocumentUpload {
            document_type,
            country,
            file,
        };

        self.run_upload(
            ApplicantId(request.applicant_id),
            document_type,
            record,
            |provider, id| async move { provider.submit_document(&id, &upload).await },
        )
        .await
    }

    pub async fn upload_liveness(
        &self,
        request: MediaUploadRequest,
    ) -> Result<UploadView, KycServiceError> {
        let file_name = request
            .file_name
            .unwrap_or_else(|| "liveness.mp4".to_string());
        let video = decode_file(
            &request.content_base64,
            Some(file_name.as_str()),
            "liveness",
            &[mime::VIDEO],
        )?;

        self.run_upload(
            ApplicantId(request.applicant_id),
            DocumentType::LivenessVideo,
            StoredFile::from(&video),
            |provider, id| async move { provider.submit_liveness(&id, &video).await },
        )
        .await
    }

    pub async fn upload_selfie(
        &self,
        request: MediaUploadRequest,
    ) -> Result<UploadView, KycServiceError> {
        let file_name = request.file_name.unwrap_or_else(|| "selfie.jpg".to_string());
        let image = decode_file(
            &request.content_base64,
            Some(file_name.as_str()),
            "selfie",
            &[mime::IMAGE],
        )?;

        self.run_upload(
            ApplicantId(request.applicant_id),
            DocumentType::Selfie,
            StoredFile::from(&image),
            |provider, id| async move { provider.submit_selfie(&id, &image).await },
        )
        .await
    }

    /// Fetch the provider decision; refused until every step is completed.
    ///
    /// Steps still processing on the provider side are settled from the
    /// fetched review before the gate is checked.
    pub async fn result(&self, id: &ApplicantId) -> Result<ResultView, KycServiceError> {
        let mut applicant = self.load(id).await?;
        let mut fetched = None;
        if state::awaiting_provider(&applicant) {
            let review = self.provider.fetch_result(id).await?;
            applicant = self.settle_processing(applicant, &review).await?;
            fetched = Some(review);
        }
        ensure_finalizable(&applicant)?;

        let review = match fetched {
            Some(review) => review,
            None => self.provider.fetch_result(id).await?,
        };
        let decision = review.decision();
        let status = state::derive_status(&applicant.steps, decision);
        self.with_retry("record decision", || {
            self.repository.update_applicant(id, status, Some(&review))
        })
        .await?;

        info!(applicant_id = %id, %status, ?decision, "provider decision fetched");
        Ok(ResultView {
            applicant_id: id.clone(),
            status,
            decision,
            review_status: review.review_status,
            review_answer: review.review_answer,
            moderation_comment: review.moderation_comment,
        })
    }

    /// Hand a fully uploaded applicant over to the provider's review queue.
    ///
    /// Steps still processing upstream do not block submission; the review
    /// is what settles them.
    pub async fn submit_for_review(
        &self,
        id: &ApplicantId,
    ) -> Result<ReviewSubmissionView, KycServiceError> {
        let applicant = self.load(id).await?;
        if !state::awaiting_provider(&applicant) {
            ensure_finalizable(&applicant)?;
        }

        self.provider.request_review(id).await?;
        info!(applicant_id = %id, "applicant submitted for review");
        Ok(ReviewSubmissionView {
            applicant_id: id.clone(),
            status: "submitted_for_review",
        })
    }

    pub async fn sdk_token(&self, id: &ApplicantId) -> Result<SdkTokenView, KycServiceError> {
        let applicant = self.load(id).await?;
        let token = self
            .provider
            .create_sdk_token(&applicant.profile.external_user_id, SDK_TOKEN_TTL_SECS)
            .await?;
        Ok(SdkTokenView {
            applicant_id: applicant.id,
            token,
        })
    }

    /// Verify, log, and apply a provider callback.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookAck, KycServiceError> {
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or(KycServiceError::InvalidSignature)?;
        let signature = signature.ok_or(KycServiceError::InvalidSignature)?;
        if !verify_webhook_signature(secret, payload, signature) {
            warn!("webhook signature mismatch");
            return Err(KycServiceError::InvalidSignature);
        }

        let event: WebhookPayload = serde_json::from_slice(payload)
            .map_err(|err| ValidationError::new("payload", err.to_string()))?;
        let applicant_id = ApplicantId(event.applicant_id.clone());
        let applicant = self.load(&applicant_id).await?;

        let review = event.review();
        self.repository
            .insert_webhook_event(WebhookEvent {
                applicant_id: applicant_id.clone(),
                event_type: event.event_type.clone(),
                review_status: event.review_status.clone(),
                review_answer: review.as_ref().and_then(|r| r.review_answer.clone()),
                payload: String::from_utf8_lossy(payload).into_owned(),
                received_at: Utc::now(),
            })
            .await?;

        let mut applicant_status = state::derive_status(
            &applicant.steps,
            applicant.review.as_ref().and_then(ProviderReview::decision),
        );
        if let Some(review) = review {
            let applicant = self.settle_processing(applicant, &review).await?;
            applicant_status = state::derive_status(&applicant.steps, review.decision());
            self.with_retry("record webhook review", || {
                self.repository
                    .update_applicant(&applicant_id, applicant_status, Some(&review))
            })
            .await?;
        }

        info!(
            applicant_id = %applicant_id,
            event_type = %event.event_type,
            %applicant_status,
            "webhook processed"
        );
        Ok(WebhookAck {
            status: "received",
            applicant_id,
            applicant_status,
        })
    }

    async fn load(&self, id: &ApplicantId) -> Result<Applicant, KycServiceError> {
        self.repository
            .fetch_applicant(id)
            .await?
            .ok_or_else(|| KycServiceError::NotFound(id.clone()))
    }

    async fn run_upload<F, Fut>(
        &self,
        applicant_id: ApplicantId,
        document_type: DocumentType,
        file: StoredFile,
        submit: F,
    ) -> Result<UploadView, KycServiceError>
    where
        F: FnOnce(Arc<P>, ApplicantId) -> Fut,
        Fut: Future<Output = Result<ProviderReceipt, ProviderError>>,
    {
        let kind = document_type.step();
        state::ensure_can_start(&self.load(&applicant_id).await?, kind)?;

        let _claim = self
            .in_flight
            .acquire(&applicant_id, kind)
            .ok_or_else(|| KycServiceError::UploadInFlight {
                applicant_id: applicant_id.clone(),
                step: kind,
            })?;

        // A request that released its claim may have finished the step since
        // the first read.
        let applicant = self.load(&applicant_id).await?;
        state::ensure_can_start(&applicant, kind)?;

        let receipt = match submit(self.provider.clone(), applicant_id.clone()).await {
            Ok(receipt) => receipt,
            Err(ProviderError::Rejected {
                status,
                code,
                description,
            }) => {
                warn!(
                    applicant_id = %applicant_id,
                    step = %kind,
                    status,
                    ?code,
                    "provider rejected upload"
                );
                let reason = match code {
                    Some(code) => format!("{code}: {description}"),
                    None => description,
                };
                ProviderReceipt {
                    outcome: UploadOutcome::Rejected { reason },
                    document_id: None,
                }
            }
            Err(err) => {
                warn!(applicant_id = %applicant_id, step = %kind, error = %err, "upload not delivered");
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let transition = state::apply_upload(&applicant, kind, &receipt.outcome, now)?;
        let document = Document {
            applicant_id: applicant_id.clone(),
            document_type,
            file_name: file.file_name,
            mime_type: file.mime_type,
            size_bytes: file.size_bytes,
            storage_ref: file.storage_ref,
            provider_document_id: receipt.document_id.clone(),
            uploaded_at: now,
        };

        let mut tries = 0;
        let recorded = self
            .with_retry("record upload", || {
                tries += 1;
                self.repository.record_upload(
                    &applicant_id,
                    &transition.step,
                    StepStatus::Pending,
                    document.clone(),
                )
            })
            .await;
        match recorded {
            Ok(()) => {}
            // An earlier attempt committed but its reply was lost.
            Err(RepositoryError::StaleStep { actual, .. })
                if tries > 1 && actual == transition.step.status => {}
            Err(err) => return Err(self.lost_update(&applicant_id, kind, &receipt.outcome, err)),
        }

        let applicant_status = self.refresh_status(&applicant_id).await?;

        info!(
            applicant_id = %applicant_id,
            step = %kind,
            status = %transition.step.status,
            %applicant_status,
            "verification step updated"
        );

        let message = match &receipt.outcome {
            UploadOutcome::Accepted => format!("{kind} accepted by the provider"),
            UploadOutcome::Processing => format!("{kind} queued for provider processing"),
            UploadOutcome::Rejected { reason } => format!("{kind} rejected: {reason}"),
        };
        Ok(UploadView {
            applicant_id,
            step: kind,
            document_type,
            status: transition.step.status,
            applicant_status,
            outcome: receipt.outcome,
            message,
        })
    }

    /// Deliver a finished review to every step still `in_progress`.
    ///
    /// Returns the snapshot with the settled steps. A step another writer
    /// settled first is left as that writer recorded it.
    async fn settle_processing(
        &self,
        applicant: Applicant,
        review: &ProviderReview,
    ) -> Result<Applicant, KycServiceError> {
        let Some(outcome) = state::outcome_from_review(review) else {
            return Ok(applicant);
        };
        let processing: Vec<StepKind> = applicant
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::InProgress)
            .map(|step| step.kind)
            .collect();
        if processing.is_empty() {
            return Ok(applicant);
        }

        let id = applicant.id.clone();
        for kind in processing {
            let transition = state::apply_upload(&applicant, kind, &outcome, Utc::now())?;
            let written = self
                .with_retry("settle step", || {
                    self.repository
                        .update_step(&id, &transition.step, StepStatus::InProgress)
                })
                .await;
            match written {
                Ok(()) => {
                    info!(applicant_id = %id, step = %kind, status = %transition.step.status, "processing step settled");
                }
                Err(RepositoryError::StaleStep { .. }) => {}
                Err(err) => return Err(self.lost_update(&id, kind, &outcome, err)),
            }
        }

        self.load(&id).await
    }

    /// Re-derive the applicant status from a fresh snapshot so concurrent
    /// uploads on sibling steps cannot leave a stale status behind.
    async fn refresh_status(&self, id: &ApplicantId) -> Result<ApplicantStatus, KycServiceError> {
        let applicant = self.load(id).await?;
        let status = state::derive_status(
            &applicant.steps,
            applicant.review.as_ref().and_then(ProviderReview::decision),
        );
        if status != applicant.status {
            self.with_retry("record applicant status", || {
                self.repository.update_applicant(id, status, None)
            })
            .await?;
        }
        Ok(status)
    }

    fn lost_update(
        &self,
        applicant_id: &ApplicantId,
        kind: StepKind,
        outcome: &UploadOutcome,
        err: RepositoryError,
    ) -> KycServiceError {
        match err {
            RepositoryError::StaleStep { actual, .. } => {
                TransitionError::NotPending { step: kind, status: actual }.into()
            }
            other => {
                error!(
                    applicant_id = %applicant_id,
                    step = %kind,
                    ?outcome,
                    error = %other,
                    "provider accepted the upload but the step could not be recorded"
                );
                other.into()
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RepositoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let attempts = self.persist.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(operation, attempt, error = %err, "retrying persistence write");
                    tokio::time::sleep(self.persist.backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn ensure_finalizable(applicant: &Applicant) -> Result<(), KycServiceError> {
    if state::can_finalize(applicant) {
        Ok(())
    } else {
        Err(KycServiceError::NotFinalizable {
            applicant_id: applicant.id.clone(),
            unfinished: state::unfinished_steps(applicant),
        })
    }
}

fn validate_profile(profile: ApplicantProfile) -> Result<ApplicantProfile, ValidationError> {
    let external_user_id = required("external_user_id", &profile.external_user_id, 255)?;
    let first_name = required("first_name", &profile.first_name, 255)?;
    let last_name = required("last_name", &profile.last_name, 255)?;
    let email = required("email", &profile.email, 255)?;
    if !looks_like_email(&email) {
        return Err(ValidationError::new("email", "must be a valid e-mail address"));
    }
    let phone = match profile.phone.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(phone) => {
            let digits = phone.chars().filter(char::is_ascii_digit).count();
            let allowed = phone
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'));
            if !allowed || !(6..=15).contains(&digits) || phone.len() > 20 {
                return Err(ValidationError::new("phone", "must be a phone number"));
            }
            Some(phone.to_string())
        }
    };
    let country = validate_country(&profile.country)?;

    Ok(ApplicantProfile {
        external_user_id,
        email,
        phone,
        first_name,
        last_name,
        country,
    })
}

fn required(field: &'static str, value: &str, max_len: usize) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if value.chars().count() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {max_len} characters"),
        ));
    }
    Ok(value.to_string())
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !value.contains(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
}

/// ISO 3166 alpha-2 or alpha-3, normalized to upper case.
fn validate_country(value: &str) -> Result<String, ValidationError> {
    let value = value.trim();
    if (2..=3).contains(&value.len()) && value.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(value.to_ascii_uppercase())
    } else {
        Err(ValidationError::new(
            "country",
            "must be an ISO 3166 alpha-2 or alpha-3 code",
        ))
    }
}

fn decode_file(
    content_base64: &str,
    file_name: Option<&str>,
    field: &'static str,
    accepted: &[mime::Name<'static>],
) -> Result<UploadFile, ValidationError> {
    let content = STANDARD
        .decode(content_base64.trim())
        .map_err(|err| ValidationError::new(field, format!("content is not valid base64: {err}")))?;
    if content.is_empty() {
        return Err(ValidationError::new(field, "content must not be empty"));
    }
    if content.len() > MAX_UPLOAD_BYTES {
        return Err(ValidationError::new(
            field,
            format!("content exceeds {MAX_UPLOAD_BYTES} bytes"),
        ));
    }

    let file_name = file_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ValidationError::new("file_name", "must not be empty"))?
        .to_string();
    if file_name.chars().count() > MAX_FILE_NAME_CHARS {
        return Err(ValidationError::new(
            "file_name",
            format!("must be at most {MAX_FILE_NAME_CHARS} characters"),
        ));
    }
    let mime_type = mime_guess::from_path(&file_name)
        .first()
        .filter(|guess| {
            accepted.iter().any(|name| *name == guess.type_())
                && (guess.type_() != mime::APPLICATION || guess.subtype() == mime::PDF)
        })
        .ok_or_else(|| {
            ValidationError::new(
                "file_name",
                format!("'{file_name}' is not an accepted {field} file type"),
            )
        })?;

    Ok(UploadFile {
        file_name,
        mime_type: mime_type.essence_str().to_string(),
        content,
    })
}

/// Document metadata kept once the bytes have been handed to the provider.
struct StoredFile {
    file_name: String,
    mime_type: String,
    size_bytes: u64,
    storage_ref: String,
}

impl From<&UploadFile> for StoredFile {
    fn from(file: &UploadFile) -> Self {
        Self {
            file_name: file.file_name.clone(),
            mime_type: file.mime_type.clone(),
            size_bytes: file.content.len() as u64,
            storage_ref: content_digest(&file.content),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    applicant_id: String,
    #[serde(rename = "type")]
    event_type: String,
    review_status: Option<String>,
    #[serde(default)]
    review_result: Option<WebhookReviewResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookReviewResult {
    review_answer: Option<String>,
    review_reject_type: Option<String>,
    moderation_comment: Option<String>,
}

impl WebhookPayload {
    /// Only review events carry a decision worth recording.
    fn review(&self) -> Option<ProviderReview> {
        if self.event_type != REVIEWED_EVENT {
            return None;
        }
        let review_status = self.review_status.clone()?;
        let result = self.review_result.as_ref();
        Some(ProviderReview {
            review_status,
            review_answer: result.and_then(|r| r.review_answer.clone()),
            reject_type: result.and_then(|r| r.review_reject_type.clone()),
            moderation_comment: result.and_then(|r| r.moderation_comment.clone()),
        })
    }
}

/// At most one upload per applicant step may be talking to the provider.
#[derive(Default)]
struct InFlightUploads {
    active: Mutex<HashSet<(ApplicantId, StepKind)>>,
}

impl InFlightUploads {
    fn acquire(self: &Arc<Self>, id: &ApplicantId, kind: StepKind) -> Option<InFlightClaim> {
        let key = (id.clone(), kind);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            return None;
        }
        Some(InFlightClaim {
            registry: Arc::clone(self),
            key,
        })
    }
}

struct InFlightClaim {
    registry: Arc<InFlightUploads>,
    key: (ApplicantId, StepKind),
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Malformed input, reported with the offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Error raised by the KYC service.
#[derive(Debug, thiserror::Error)]
pub enum KycServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("applicant {0} not found")]
    NotFound(ApplicantId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("an upload for {step} on applicant {applicant_id} is already in flight")]
    UploadInFlight {
        applicant_id: ApplicantId,
        step: StepKind,
    },
    #[error("applicant {applicant_id} is not finalizable; unfinished steps: {unfinished:?}")]
    NotFinalizable {
        applicant_id: ApplicantId,
        unfinished: Vec<StepKind>,
    },
    #[error("webhook signature is missing or invalid")]
    InvalidSignature,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
