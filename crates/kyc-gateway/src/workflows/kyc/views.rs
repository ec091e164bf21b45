use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Applicant, ApplicantId, ApplicantStatus, Document, DocumentType, ReviewDecision, StepKind,
    StepStatus, VerificationStep,
};
use super::provider::SdkToken;
use super::state::{self, UploadOutcome};

/// `POST /kyc/upload-document` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUploadRequest {
    pub applicant_id: String,
    #[serde(default = "default_document_type")]
    pub document_type: String,
    pub country: String,
    pub file_name: String,
    pub content_base64: String,
}

fn default_document_type() -> String {
    DocumentType::Identity.label().to_string()
}

/// `POST /kyc/upload-liveness` and `POST /kyc/upload-selfie` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUploadRequest {
    pub applicant_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    pub content_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepView {
    pub step: StepKind,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&VerificationStep> for StepView {
    fn from(step: &VerificationStep) -> Self {
        Self {
            step: step.kind,
            status: step.status,
            started_at: step.started_at,
            completed_at: step.completed_at,
            error_message: step.error_message.clone(),
        }
    }
}

/// Sanitized applicant snapshot returned by the create and status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicantView {
    pub applicant_id: ApplicantId,
    pub external_user_id: String,
    pub email: String,
    pub status: ApplicantStatus,
    pub can_finalize: bool,
    pub steps: Vec<StepView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Applicant> for ApplicantView {
    fn from(applicant: &Applicant) -> Self {
        let decision = applicant.review.as_ref().and_then(|review| review.decision());
        Self {
            applicant_id: applicant.id.clone(),
            external_user_id: applicant.profile.external_user_id.clone(),
            email: applicant.profile.email.clone(),
            status: state::derive_status(&applicant.steps, decision),
            can_finalize: state::can_finalize(applicant),
            steps: applicant.steps.iter().map(StepView::from).collect(),
            review_status: applicant
                .review
                .as_ref()
                .map(|review| review.review_status.clone()),
            created_at: applicant.created_at,
            updated_at: applicant.updated_at,
        }
    }
}

/// Response to one upload: the step transition it caused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadView {
    pub applicant_id: ApplicantId,
    pub step: StepKind,
    pub document_type: DocumentType,
    pub status: StepStatus,
    pub applicant_status: ApplicantStatus,
    #[serde(flatten)]
    pub outcome: UploadOutcome,
    pub message: String,
}

/// Upload history for one applicant with checklist totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentListView {
    pub applicant_id: ApplicantId,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub total: usize,
    pub documents: Vec<Document>,
}

impl DocumentListView {
    pub fn new(applicant: &Applicant, documents: Vec<Document>) -> Self {
        let completed_steps = applicant
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .count();
        Self {
            applicant_id: applicant.id.clone(),
            completed_steps,
            total_steps: StepKind::ALL.len(),
            total: documents.len(),
            documents,
        }
    }
}

/// Final decision as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultView {
    pub applicant_id: ApplicantId,
    pub status: ApplicantStatus,
    pub decision: Option<ReviewDecision>,
    pub review_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moderation_comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewSubmissionView {
    pub applicant_id: ApplicantId,
    pub status: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdkTokenView {
    pub applicant_id: ApplicantId,
    #[serde(flatten)]
    pub token: SdkToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub applicant_id: ApplicantId,
    pub applicant_status: ApplicantStatus,
}
