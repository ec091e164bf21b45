//! Verification workflow state model.
//!
//! Pure functions over an applicant snapshot: they decide whether an action is
//! legal and what the resulting statuses are. Nothing here performs I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Applicant, ApplicantStatus, ProviderReview, ReviewDecision, StepKind, StepSet, StepStatus,
    VerificationStep,
};

/// What the provider reported for a single upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    Accepted,
    /// Accepted for asynchronous processing; the final answer arrives later.
    Processing,
    Rejected { reason: String },
}

impl UploadOutcome {
    pub const fn step_status(&self) -> StepStatus {
        match self {
            UploadOutcome::Accepted => StepStatus::Completed,
            UploadOutcome::Processing => StepStatus::InProgress,
            UploadOutcome::Rejected { .. } => StepStatus::Failed,
        }
    }
}

/// Result of applying an outcome: the rewritten step and the recomputed applicant status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub step: VerificationStep,
    pub applicant_status: ApplicantStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("step {step} is {status}; uploads are only accepted while pending")]
    NotPending { step: StepKind, status: StepStatus },
    #[error("step {step} cannot move from {status} to {next}")]
    Illegal {
        step: StepKind,
        status: StepStatus,
        next: StepStatus,
    },
}

impl TransitionError {
    pub const fn step(&self) -> StepKind {
        match self {
            TransitionError::NotPending { step, .. } | TransitionError::Illegal { step, .. } => {
                *step
            }
        }
    }

    /// Stored status of the step that refused the move.
    pub const fn status(&self) -> StepStatus {
        match self {
            TransitionError::NotPending { status, .. } | TransitionError::Illegal { status, .. } => {
                *status
            }
        }
    }
}

/// A step may be started only while it is `pending`.
pub fn can_start(applicant: &Applicant, kind: StepKind) -> bool {
    applicant.step(kind).status == StepStatus::Pending
}

/// Reject an upload request before anything is sent upstream.
pub fn ensure_can_start(applicant: &Applicant, kind: StepKind) -> Result<(), TransitionError> {
    if can_start(applicant, kind) {
        Ok(())
    } else {
        Err(TransitionError::NotPending {
            step: kind,
            status: applicant.step(kind).status,
        })
    }
}

/// Apply an upstream outcome to one step and recompute the applicant status.
///
/// `pending` steps accept any outcome; `in_progress` steps accept the
/// asynchronous completion of an earlier submission. Terminal steps reject
/// every outcome.
pub fn apply_upload(
    applicant: &Applicant,
    kind: StepKind,
    outcome: &UploadOutcome,
    at: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    let current = applicant.step(kind);
    let next = outcome.step_status();

    if !current.status.can_advance_to(next) {
        return Err(TransitionError::Illegal {
            step: kind,
            status: current.status,
            next,
        });
    }

    let mut step = current.clone();
    step.status = next;
    step.updated_at = at;
    step.started_at.get_or_insert(at);
    match outcome {
        UploadOutcome::Accepted => {
            step.completed_at = Some(at);
            step.error_message = None;
        }
        UploadOutcome::Processing => {}
        UploadOutcome::Rejected { reason } => {
            step.error_message = Some(reason.clone());
        }
    }

    let mut steps = applicant.steps.clone();
    steps.replace(step.clone());
    let decision = applicant.review.as_ref().and_then(|review| review.decision());
    let applicant_status = derive_status(&steps, decision);

    Ok(Transition {
        step,
        applicant_status,
    })
}

/// True only when every step is `completed`; gates the decision endpoints.
pub fn can_finalize(applicant: &Applicant) -> bool {
    all_completed(&applicant.steps)
}

/// Nothing left for the applicant to upload: every unfinished step is waiting
/// on the provider's asynchronous answer.
pub fn awaiting_provider(applicant: &Applicant) -> bool {
    let mut waiting = false;
    for step in applicant.steps.iter() {
        match step.status {
            StepStatus::Completed => {}
            StepStatus::InProgress => waiting = true,
            StepStatus::Pending | StepStatus::Failed => return false,
        }
    }
    waiting
}

/// Outcome a finished provider review settles `in_progress` steps with.
///
/// Approval accepts them, a rejection fails them; a review that is still
/// open or needs a human leaves them untouched.
pub fn outcome_from_review(review: &ProviderReview) -> Option<UploadOutcome> {
    match review.decision()? {
        ReviewDecision::Approved => Some(UploadOutcome::Accepted),
        ReviewDecision::Rejected => {
            let reason = review
                .moderation_comment
                .clone()
                .filter(|comment| !comment.trim().is_empty())
                .unwrap_or_else(|| "rejected by provider review".to_string());
            Some(UploadOutcome::Rejected { reason })
        }
        ReviewDecision::ManualReview => None,
    }
}

/// Steps still blocking finalization, in checklist order.
pub fn unfinished_steps(applicant: &Applicant) -> Vec<StepKind> {
    applicant
        .steps
        .iter()
        .filter(|step| step.status != StepStatus::Completed)
        .map(|step| step.kind)
        .collect()
}

/// The applicant completion function.
///
/// * no step started: `created`
/// * all steps completed and a provider decision known: the decision
/// * otherwise: `in_progress`
pub fn derive_status(steps: &StepSet, decision: Option<ReviewDecision>) -> ApplicantStatus {
    if steps.iter().all(|step| step.status == StepStatus::Pending) {
        return ApplicantStatus::Created;
    }

    if !all_completed(steps) {
        return ApplicantStatus::InProgress;
    }

    match decision {
        Some(ReviewDecision::Approved) => ApplicantStatus::Verified,
        Some(ReviewDecision::Rejected) => ApplicantStatus::Rejected,
        Some(ReviewDecision::ManualReview) => ApplicantStatus::ManualReview,
        None => ApplicantStatus::InProgress,
    }
}

/// Map a provider review answer to a decision.
///
/// `GREEN` approves. `RED` with a `FINAL` reject type rejects; a `RETRY`
/// reject type or any unknown answer needs a human.
pub fn decision_from_answer(answer: &str, reject_type: Option<&str>) -> ReviewDecision {
    match answer.trim().to_ascii_uppercase().as_str() {
        "GREEN" => ReviewDecision::Approved,
        "RED" => match reject_type.map(|kind| kind.trim().to_ascii_uppercase()) {
            Some(kind) if kind == "RETRY" => ReviewDecision::ManualReview,
            _ => ReviewDecision::Rejected,
        },
        _ => ReviewDecision::ManualReview,
    }
}

fn all_completed(steps: &StepSet) -> bool {
    steps
        .iter()
        .all(|step| step.status == StepStatus::Completed)
}
