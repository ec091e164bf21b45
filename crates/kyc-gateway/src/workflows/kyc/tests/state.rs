use super::common::*;
use chrono::Utc;

use crate::workflows::kyc::domain::{
    ApplicantStatus, ProviderReview, ReviewDecision, StepKind, StepSet, StepSetError, StepStatus,
    VerificationStep,
};
use crate::workflows::kyc::state::{
    apply_upload, awaiting_provider, can_finalize, can_start, decision_from_answer,
    derive_status, ensure_can_start, outcome_from_review, unfinished_steps, TransitionError,
    UploadOutcome,
};

fn rejected(reason: &str) -> UploadOutcome {
    UploadOutcome::Rejected {
        reason: reason.to_string(),
    }
}

#[test]
fn new_applicant_has_exactly_three_pending_steps() {
    let applicant = applicant();
    let kinds: Vec<StepKind> = applicant.steps.iter().map(|step| step.kind).collect();

    assert_eq!(kinds, StepKind::ALL.to_vec());
    assert!(applicant
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Pending));
    assert_eq!(applicant.status, ApplicantStatus::Created);
    assert_eq!(derive_status(&applicant.steps, None), ApplicantStatus::Created);
}

#[test]
fn step_set_rejects_missing_and_duplicate_rows() {
    let now = Utc::now();
    let missing = StepSet::from_steps(vec![
        VerificationStep::pending(StepKind::FaceLiveness, now),
        VerificationStep::pending(StepKind::Selfie, now),
    ]);
    assert_eq!(missing, Err(StepSetError::Missing(StepKind::IdScan)));

    let duplicate = StepSet::from_steps(vec![
        VerificationStep::pending(StepKind::Selfie, now),
        VerificationStep::pending(StepKind::Selfie, now),
        VerificationStep::pending(StepKind::IdScan, now),
    ]);
    assert_eq!(duplicate, Err(StepSetError::Duplicate(StepKind::Selfie)));

    let shuffled = StepSet::from_steps(vec![
        VerificationStep::pending(StepKind::Selfie, now),
        VerificationStep::pending(StepKind::FaceLiveness, now),
        VerificationStep::pending(StepKind::IdScan, now),
    ])
    .expect("complete set");
    assert_eq!(shuffled, StepSet::new(now));
}

#[test]
fn can_start_only_pending_steps() {
    let applicant = applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::InProgress),
        (StepKind::IdScan, StepStatus::Completed),
    ]);

    assert!(!can_start(&applicant, StepKind::FaceLiveness));
    assert!(!can_start(&applicant, StepKind::IdScan));
    assert!(can_start(&applicant, StepKind::Selfie));
    assert_eq!(
        ensure_can_start(&applicant, StepKind::IdScan),
        Err(TransitionError::NotPending {
            step: StepKind::IdScan,
            status: StepStatus::Completed,
        })
    );
}

#[test]
fn accepted_upload_completes_step_and_starts_applicant() {
    let applicant = applicant();
    let at = Utc::now();

    let transition = apply_upload(&applicant, StepKind::FaceLiveness, &UploadOutcome::Accepted, at)
        .expect("pending step accepts outcome");

    assert_eq!(transition.step.status, StepStatus::Completed);
    assert_eq!(transition.step.started_at, Some(at));
    assert_eq!(transition.step.completed_at, Some(at));
    assert_eq!(transition.applicant_status, ApplicantStatus::InProgress);
}

#[test]
fn processing_then_accepted_keeps_original_start_time() {
    let applicant = applicant();
    let first = Utc::now();
    let processing = apply_upload(&applicant, StepKind::IdScan, &UploadOutcome::Processing, first)
        .expect("pending accepts processing");
    assert_eq!(processing.step.status, StepStatus::InProgress);
    assert_eq!(processing.step.completed_at, None);

    let mut updated = applicant.clone();
    updated.steps.replace(processing.step);
    let later = first + chrono::Duration::seconds(30);
    let completed = apply_upload(&updated, StepKind::IdScan, &UploadOutcome::Accepted, later)
        .expect("in-progress step completes");

    assert_eq!(completed.step.status, StepStatus::Completed);
    assert_eq!(completed.step.started_at, Some(first));
    assert_eq!(completed.step.completed_at, Some(later));
}

#[test]
fn rejected_upload_fails_step_with_reason() {
    let applicant = applicant();

    let transition = apply_upload(
        &applicant,
        StepKind::IdScan,
        &rejected("document is blurry"),
        Utc::now(),
    )
    .expect("pending accepts rejection");

    assert_eq!(transition.step.status, StepStatus::Failed);
    assert_eq!(
        transition.step.error_message.as_deref(),
        Some("document is blurry")
    );
    assert_eq!(transition.step.completed_at, None);
    assert_eq!(transition.applicant_status, ApplicantStatus::InProgress);
}

#[test]
fn terminal_steps_reject_every_outcome() {
    for terminal in [StepStatus::Completed, StepStatus::Failed] {
        let applicant = applicant_with(&[(StepKind::Selfie, terminal)]);
        for outcome in [
            UploadOutcome::Accepted,
            UploadOutcome::Processing,
            rejected("late"),
        ] {
            let result = apply_upload(&applicant, StepKind::Selfie, &outcome, Utc::now());
            assert_eq!(
                result,
                Err(TransitionError::Illegal {
                    step: StepKind::Selfie,
                    status: terminal,
                    next: outcome.step_status(),
                }),
                "{terminal} must not accept {outcome:?}"
            );
        }
    }
}

#[test]
fn awaiting_provider_only_when_nothing_is_left_to_upload() {
    assert!(!awaiting_provider(&applicant()));
    assert!(awaiting_provider(&applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::InProgress),
        (StepKind::IdScan, StepStatus::Completed),
        (StepKind::Selfie, StepStatus::Completed),
    ])));
    assert!(!awaiting_provider(&applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::InProgress),
        (StepKind::IdScan, StepStatus::Completed),
    ])));
    assert!(!awaiting_provider(&applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::InProgress),
        (StepKind::IdScan, StepStatus::Failed),
        (StepKind::Selfie, StepStatus::Completed),
    ])));
    assert!(!awaiting_provider(&applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::Completed),
        (StepKind::IdScan, StepStatus::Completed),
        (StepKind::Selfie, StepStatus::Completed),
    ])));
}

#[test]
fn finished_reviews_settle_processing_steps() {
    assert_eq!(
        outcome_from_review(&green_review()),
        Some(UploadOutcome::Accepted)
    );

    let red = ProviderReview {
        review_status: "completed".to_string(),
        review_answer: Some("RED".to_string()),
        reject_type: Some("FINAL".to_string()),
        moderation_comment: Some("video is a replay".to_string()),
    };
    assert_eq!(outcome_from_review(&red), Some(rejected("video is a replay")));

    let retry = ProviderReview {
        reject_type: Some("RETRY".to_string()),
        ..red.clone()
    };
    assert_eq!(outcome_from_review(&retry), None);

    let open = ProviderReview {
        review_status: "pending".to_string(),
        ..green_review()
    };
    assert_eq!(outcome_from_review(&open), None);
}

#[test]
fn in_progress_step_cannot_return_to_pending() {
    let applicant = applicant_with(&[(StepKind::IdScan, StepStatus::InProgress)]);
    let processing = apply_upload(
        &applicant,
        StepKind::IdScan,
        &UploadOutcome::Processing,
        Utc::now(),
    )
    .expect("staying in progress is allowed");
    assert_eq!(processing.step.status, StepStatus::InProgress);
    assert!(!StepStatus::InProgress.can_advance_to(StepStatus::Pending));
}

#[test]
fn step_statuses_never_move_backwards() {
    let order = |status: StepStatus| match status {
        StepStatus::Pending => 0,
        StepStatus::InProgress => 1,
        StepStatus::Completed | StepStatus::Failed => 2,
    };
    let statuses = [
        StepStatus::Pending,
        StepStatus::InProgress,
        StepStatus::Completed,
        StepStatus::Failed,
    ];

    for from in statuses {
        for to in statuses {
            if from.can_advance_to(to) {
                assert!(order(to) >= order(from), "{from} -> {to} regresses");
            }
        }
    }
    assert!(!StepStatus::Completed.can_advance_to(StepStatus::Failed));
    assert!(StepStatus::InProgress.can_advance_to(StepStatus::Failed));
}

#[test]
fn can_finalize_requires_every_step_completed() {
    let partial = applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::Completed),
        (StepKind::IdScan, StepStatus::Completed),
        (StepKind::Selfie, StepStatus::InProgress),
    ]);
    assert!(!can_finalize(&partial));
    assert_eq!(unfinished_steps(&partial), vec![StepKind::Selfie]);

    let failed = applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::Completed),
        (StepKind::IdScan, StepStatus::Failed),
        (StepKind::Selfie, StepStatus::Completed),
    ]);
    assert!(!can_finalize(&failed));

    let complete = applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::Completed),
        (StepKind::IdScan, StepStatus::Completed),
        (StepKind::Selfie, StepStatus::Completed),
    ]);
    assert!(can_finalize(&complete));
    assert!(unfinished_steps(&complete).is_empty());
}

#[test]
fn verified_status_implies_all_steps_completed() {
    let complete = applicant_with(&[
        (StepKind::FaceLiveness, StepStatus::Completed),
        (StepKind::IdScan, StepStatus::Completed),
        (StepKind::Selfie, StepStatus::Completed),
    ]);
    assert_eq!(
        derive_status(&complete.steps, Some(ReviewDecision::Approved)),
        ApplicantStatus::Verified
    );
    assert_eq!(
        derive_status(&complete.steps, None),
        ApplicantStatus::InProgress
    );

    let incomplete = applicant_with(&[(StepKind::FaceLiveness, StepStatus::Completed)]);
    assert_eq!(
        derive_status(&incomplete.steps, Some(ReviewDecision::Approved)),
        ApplicantStatus::InProgress
    );
}

#[test]
fn review_answers_map_to_decisions() {
    assert_eq!(decision_from_answer("GREEN", None), ReviewDecision::Approved);
    assert_eq!(decision_from_answer("red", Some("FINAL")), ReviewDecision::Rejected);
    assert_eq!(decision_from_answer("RED", None), ReviewDecision::Rejected);
    assert_eq!(
        decision_from_answer("RED", Some("RETRY")),
        ReviewDecision::ManualReview
    );
    assert_eq!(decision_from_answer("YELLOW", None), ReviewDecision::ManualReview);

    let pending = ProviderReview {
        review_status: "pending".to_string(),
        ..green_review()
    };
    assert_eq!(pending.decision(), None);
    assert_eq!(green_review().decision(), Some(ReviewDecision::Approved));
}

#[test]
fn liveness_success_then_document_rejection_blocks_finalization() {
    let mut applicant = applicant();
    assert_eq!(applicant.status, ApplicantStatus::Created);

    let liveness = apply_upload(
        &applicant,
        StepKind::FaceLiveness,
        &UploadOutcome::Accepted,
        Utc::now(),
    )
    .expect("liveness accepted");
    applicant.steps.replace(liveness.step);
    applicant.status = liveness.applicant_status;
    assert_eq!(
        applicant.step(StepKind::FaceLiveness).status,
        StepStatus::Completed
    );
    assert_eq!(applicant.status, ApplicantStatus::InProgress);

    let document = apply_upload(
        &applicant,
        StepKind::IdScan,
        &rejected("unsupported document"),
        Utc::now(),
    )
    .expect("document outcome applied");
    applicant.steps.replace(document.step);
    applicant.status = document.applicant_status;

    assert_eq!(applicant.step(StepKind::IdScan).status, StepStatus::Failed);
    assert_eq!(applicant.status, ApplicantStatus::InProgress);
    assert!(!can_finalize(&applicant));
}
