use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::domain::{
    Applicant, ApplicantId, ApplicantStatus, Document, ProviderReview, StepStatus,
    VerificationStep, WebhookEvent,
};
use super::repository::{KycRepository, RepositoryError};

/// Process-local store used for development, demos, and tests.
#[derive(Default, Clone)]
pub struct MemoryKycRepository {
    applicants: Arc<Mutex<HashMap<ApplicantId, Applicant>>>,
    documents: Arc<Mutex<Vec<Document>>>,
    webhook_events: Arc<Mutex<Vec<WebhookEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryKycRepository {
    pub fn webhook_events(&self) -> Vec<WebhookEvent> {
        lock(&self.webhook_events).clone()
    }
}

/// Step compare-and-swap against a locked applicant.
fn swap_step(
    applicant: &mut Applicant,
    step: &VerificationStep,
    expected: StepStatus,
) -> Result<(), RepositoryError> {
    let actual = applicant.step(step.kind).status;
    if actual != expected {
        return Err(RepositoryError::StaleStep {
            step: step.kind,
            expected,
            actual,
        });
    }
    applicant.steps.replace(step.clone());
    applicant.updated_at = step.updated_at;
    Ok(())
}

#[async_trait]
impl KycRepository for MemoryKycRepository {
    async fn insert_applicant(&self, applicant: Applicant) -> Result<Applicant, RepositoryError> {
        let mut guard = lock(&self.applicants);
        let duplicate_external = guard.values().any(|existing| {
            existing.profile.external_user_id == applicant.profile.external_user_id
        });
        if guard.contains_key(&applicant.id) || duplicate_external {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(applicant.id.clone(), applicant.clone());
        Ok(applicant)
    }

    async fn fetch_applicant(&self, id: &ApplicantId) -> Result<Option<Applicant>, RepositoryError> {
        Ok(lock(&self.applicants).get(id).cloned())
    }

    async fn find_by_external_user_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<Applicant>, RepositoryError> {
        Ok(lock(&self.applicants)
            .values()
            .find(|applicant| applicant.profile.external_user_id == external_user_id)
            .cloned())
    }

    async fn update_step(
        &self,
        id: &ApplicantId,
        step: &VerificationStep,
        expected: StepStatus,
    ) -> Result<(), RepositoryError> {
        let mut guard = lock(&self.applicants);
        let applicant = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        swap_step(applicant, step, expected)
    }

    async fn record_upload(
        &self,
        id: &ApplicantId,
        step: &VerificationStep,
        expected: StepStatus,
        document: Document,
    ) -> Result<(), RepositoryError> {
        let mut guard = lock(&self.applicants);
        let applicant = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let mut documents = lock(&self.documents);
        swap_step(applicant, step, expected)?;
        documents.push(document);
        Ok(())
    }

    async fn update_applicant(
        &self,
        id: &ApplicantId,
        status: ApplicantStatus,
        review: Option<&ProviderReview>,
    ) -> Result<(), RepositoryError> {
        let mut guard = lock(&self.applicants);
        let applicant = guard.get_mut(id).ok_or(RepositoryError::NotFound)?;
        applicant.status = status;
        if let Some(review) = review {
            applicant.review = Some(review.clone());
        }
        applicant.updated_at = Utc::now();
        Ok(())
    }

    async fn documents(&self, id: &ApplicantId) -> Result<Vec<Document>, RepositoryError> {
        Ok(lock(&self.documents)
            .iter()
            .filter(|document| &document.applicant_id == id)
            .cloned()
            .collect())
    }

    async fn insert_webhook_event(&self, event: WebhookEvent) -> Result<(), RepositoryError> {
        if !lock(&self.applicants).contains_key(&event.applicant_id) {
            return Err(RepositoryError::NotFound);
        }
        lock(&self.webhook_events).push(event);
        Ok(())
    }
}
