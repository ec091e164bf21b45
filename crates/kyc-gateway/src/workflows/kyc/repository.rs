use async_trait::async_trait;

use super::domain::{
    Applicant, ApplicantId, ApplicantStatus, Document, ProviderReview, StepKind, StepStatus,
    VerificationStep, WebhookEvent,
};

/// Storage abstraction so the service can run against Postgres or memory.
#[async_trait]
pub trait KycRepository: Send + Sync {
    /// Persist a new applicant together with its step set.
    async fn insert_applicant(&self, applicant: Applicant) -> Result<Applicant, RepositoryError>;

    async fn fetch_applicant(&self, id: &ApplicantId) -> Result<Option<Applicant>, RepositoryError>;

    async fn find_by_external_user_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<Applicant>, RepositoryError>;

    /// Compare-and-swap a step: the write lands only if the stored status still
    /// equals `expected`.
    async fn update_step(
        &self,
        id: &ApplicantId,
        step: &VerificationStep,
        expected: StepStatus,
    ) -> Result<(), RepositoryError>;

    /// Overwrite the derived status; `review` of `None` keeps the stored review.
    async fn update_applicant(
        &self,
        id: &ApplicantId,
        status: ApplicantStatus,
        review: Option<&ProviderReview>,
    ) -> Result<(), RepositoryError>;

    /// Apply the step compare-and-swap and append the uploaded document as
    /// one write: either both land or neither does.
    async fn record_upload(
        &self,
        id: &ApplicantId,
        step: &VerificationStep,
        expected: StepStatus,
        document: Document,
    ) -> Result<(), RepositoryError>;

    async fn documents(&self, id: &ApplicantId) -> Result<Vec<Document>, RepositoryError>;

    async fn insert_webhook_event(&self, event: WebhookEvent) -> Result<(), RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("step {step} changed concurrently: expected {expected}, found {actual}")]
    StaleStep {
        step: StepKind,
        expected: StepStatus,
        actual: StepStatus,
    },
    #[error("record rejected by storage: {0}")]
    Invalid(String),
    #[error("stored record is inconsistent: {0}")]
    Corrupt(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Only infrastructure failures are worth retrying; the rest are answers.
    pub const fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}
