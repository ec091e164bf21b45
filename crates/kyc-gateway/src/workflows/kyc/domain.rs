use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-assigned applicant identifier; the join key for every child record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicantId(pub String);

impl fmt::Display for ApplicantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fixed verification checklist every applicant goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    FaceLiveness,
    IdScan,
    Selfie,
}

impl StepKind {
    /// Checklist order; not configurable per applicant.
    pub const ALL: [StepKind; 3] = [StepKind::FaceLiveness, StepKind::IdScan, StepKind::Selfie];

    pub const fn label(self) -> &'static str {
        match self {
            StepKind::FaceLiveness => "face_liveness",
            StepKind::IdScan => "id_scan",
            StepKind::Selfie => "selfie",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }

    const fn index(self) -> usize {
        match self {
            StepKind::FaceLiveness => 0,
            StepKind::IdScan => 1,
            StepKind::Selfie => 2,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub const fn label(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        [
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::Completed,
            StepStatus::Failed,
        ]
        .into_iter()
        .find(|status| status.label() == label)
    }

    /// `completed` and `failed` never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    /// Legal moves: `pending -> in_progress -> completed`, plus `failed` from
    /// either non-terminal state. Staying put is allowed for non-terminal states.
    pub const fn can_advance_to(self, next: StepStatus) -> bool {
        match (self, next) {
            (StepStatus::Pending, _) => true,
            (StepStatus::InProgress, StepStatus::Pending) => false,
            (StepStatus::InProgress, _) => true,
            (StepStatus::Completed, _) | (StepStatus::Failed, _) => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Overall applicant status, always derivable from the steps and the provider decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicantStatus {
    Created,
    InProgress,
    Verified,
    Rejected,
    ManualReview,
}

impl ApplicantStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ApplicantStatus::Created => "created",
            ApplicantStatus::InProgress => "in_progress",
            ApplicantStatus::Verified => "verified",
            ApplicantStatus::Rejected => "rejected",
            ApplicantStatus::ManualReview => "manual_review",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        [
            ApplicantStatus::Created,
            ApplicantStatus::InProgress,
            ApplicantStatus::Verified,
            ApplicantStatus::Rejected,
            ApplicantStatus::ManualReview,
        ]
        .into_iter()
        .find(|status| status.label() == label)
    }
}

impl fmt::Display for ApplicantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Final decision rendered by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
    ManualReview,
}

/// Review state reported by the provider, either fetched or pushed via webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReview {
    pub review_status: String,
    pub review_answer: Option<String>,
    pub reject_type: Option<String>,
    pub moderation_comment: Option<String>,
}

impl ProviderReview {
    /// `None` until the provider has finished reviewing.
    pub fn decision(&self) -> Option<ReviewDecision> {
        if !self.review_status.eq_ignore_ascii_case("completed") {
            return None;
        }
        let answer = self.review_answer.as_deref()?;
        Some(super::state::decision_from_answer(
            answer,
            self.reject_type.as_deref(),
        ))
    }
}

/// Identity fields supplied when an applicant is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantProfile {
    pub external_user_id: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStep {
    pub kind: StepKind,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationStep {
    pub fn pending(kind: StepKind, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
            updated_at: at,
        }
    }
}

/// Exactly one step per [`StepKind`], kept in checklist order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSet([VerificationStep; 3]);

impl StepSet {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(StepKind::ALL.map(|kind| VerificationStep::pending(kind, at)))
    }

    /// Rebuild a set from stored rows, rejecting missing or duplicated kinds.
    pub fn from_steps(steps: Vec<VerificationStep>) -> Result<Self, StepSetError> {
        let mut slots: [Option<VerificationStep>; 3] = [None, None, None];
        for step in steps {
            let slot = &mut slots[step.kind.index()];
            if slot.is_some() {
                return Err(StepSetError::Duplicate(step.kind));
            }
            *slot = Some(step);
        }

        let [liveness, id_scan, selfie] = slots;
        Ok(Self([
            liveness.ok_or(StepSetError::Missing(StepKind::FaceLiveness))?,
            id_scan.ok_or(StepSetError::Missing(StepKind::IdScan))?,
            selfie.ok_or(StepSetError::Missing(StepKind::Selfie))?,
        ]))
    }

    pub fn get(&self, kind: StepKind) -> &VerificationStep {
        &self.0[kind.index()]
    }

    pub fn replace(&mut self, step: VerificationStep) {
        let index = step.kind.index();
        self.0[index] = step;
    }

    pub fn iter(&self) -> impl Iterator<Item = &VerificationStep> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StepSetError {
    #[error("verification step {0} is missing")]
    Missing(StepKind),
    #[error("verification step {0} appears more than once")]
    Duplicate(StepKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicant {
    pub id: ApplicantId,
    pub profile: ApplicantProfile,
    pub status: ApplicantStatus,
    pub steps: StepSet,
    pub review: Option<ProviderReview>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Applicant {
    pub fn new(id: ApplicantId, profile: ApplicantProfile, at: DateTime<Utc>) -> Self {
        Self {
            id,
            profile,
            status: ApplicantStatus::Created,
            steps: StepSet::new(at),
            review: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn step(&self, kind: StepKind) -> &VerificationStep {
        self.steps.get(kind)
    }
}

/// Kinds of artifacts forwarded to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    Identity,
    IdCard,
    Passport,
    Drivers,
    ResidencePermit,
    Selfie,
    LivenessVideo,
}

impl DocumentType {
    pub const fn label(self) -> &'static str {
        match self {
            DocumentType::Identity => "IDENTITY",
            DocumentType::IdCard => "ID_CARD",
            DocumentType::Passport => "PASSPORT",
            DocumentType::Drivers => "DRIVERS",
            DocumentType::ResidencePermit => "RESIDENCE_PERMIT",
            DocumentType::Selfie => "SELFIE",
            DocumentType::LivenessVideo => "LIVENESS_VIDEO",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        [
            DocumentType::Identity,
            DocumentType::IdCard,
            DocumentType::Passport,
            DocumentType::Drivers,
            DocumentType::ResidencePermit,
            DocumentType::Selfie,
            DocumentType::LivenessVideo,
        ]
        .into_iter()
        .find(|kind| kind.label().eq_ignore_ascii_case(label.trim()))
    }

    /// Checklist step an upload of this type advances.
    pub const fn step(self) -> StepKind {
        match self {
            DocumentType::Selfie => StepKind::Selfie,
            DocumentType::LivenessVideo => StepKind::FaceLiveness,
            _ => StepKind::IdScan,
        }
    }
}

/// Append-only record of one uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub applicant_id: ApplicantId,
    pub document_type: DocumentType,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Content digest, `sha256:<hex>`.
    pub storage_ref: String,
    pub provider_document_id: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Audit entry for a provider callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub applicant_id: ApplicantId,
    pub event_type: String,
    pub review_status: Option<String>,
    pub review_answer: Option<String>,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}
