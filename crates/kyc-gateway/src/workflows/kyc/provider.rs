use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::domain::{ApplicantId, ApplicantProfile, DocumentType, ProviderReview};
use super::state::UploadOutcome;

/// Identity document forwarded for the `id_scan` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpload {
    pub document_type: DocumentType,
    pub country: String,
    pub file: UploadFile,
}

/// Raw file content plus the metadata the provider needs to accept it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// What the provider acknowledged for an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub outcome: UploadOutcome,
    pub document_id: Option<String>,
}

impl ProviderReceipt {
    pub fn accepted(document_id: Option<String>) -> Self {
        Self {
            outcome: UploadOutcome::Accepted,
            document_id,
        }
    }
}

/// Short-lived token for the provider's Web/Mobile SDKs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkToken {
    pub token: String,
    pub user_id: String,
    pub ttl_secs: u32,
}

/// Outbound interface to the identity-verification provider.
#[async_trait]
pub trait VerificationProvider: Send + Sync {
    async fn create_applicant(&self, profile: &ApplicantProfile)
        -> Result<ApplicantId, ProviderError>;

    async fn submit_document(
        &self,
        applicant_id: &ApplicantId,
        document: &DocumentUpload,
    ) -> Result<ProviderReceipt, ProviderError>;

    async fn submit_liveness(
        &self,
        applicant_id: &ApplicantId,
        video: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError>;

    async fn submit_selfie(
        &self,
        applicant_id: &ApplicantId,
        image: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError>;

    async fn fetch_result(&self, applicant_id: &ApplicantId)
        -> Result<ProviderReview, ProviderError>;

    /// Move the applicant into the provider's review queue.
    async fn request_review(&self, applicant_id: &ApplicantId) -> Result<(), ProviderError>;

    async fn create_sdk_token(
        &self,
        external_user_id: &str,
        ttl_secs: u32,
    ) -> Result<SdkToken, ProviderError>;
}

/// Provider call failures.
///
/// `Transport` is retryable by the caller; `Rejected` is terminal for the step
/// it was raised on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("provider rejected the request ({status}): {description}")]
    Rejected {
        status: u16,
        code: Option<String>,
        description: String,
    },
    #[error("applicant {0} is unknown to the provider")]
    NotFound(ApplicantId),
    #[error("unexpected provider payload: {0}")]
    Decode(String),
    #[error("request signing failed: {0}")]
    Signing(String),
}

impl ProviderError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}
