//! Applicant verification over a third-party identity-verification provider.
//!
//! The workflow state model in [`state`] decides which uploads are legal and
//! derives the applicant status; [`service::KycService`] sequences validation,
//! the provider call, and persistence; [`router::kyc_router`] exposes it over HTTP.

pub mod domain;
pub mod memory;
pub mod postgres;
pub mod provider;
pub mod repository;
pub mod router;
pub mod service;
pub mod signing;
pub mod state;
pub mod sumsub;
pub mod views;

#[cfg(test)]
mod tests;

pub use domain::{
    Applicant, ApplicantId, ApplicantProfile, ApplicantStatus, Document, DocumentType,
    ProviderReview, ReviewDecision, StepKind, StepSet, StepStatus, VerificationStep, WebhookEvent,
};
pub use memory::MemoryKycRepository;
pub use postgres::PostgresKycRepository;
pub use provider::{
    DocumentUpload, ProviderError, ProviderReceipt, SdkToken, UploadFile, VerificationProvider,
};
pub use repository::{KycRepository, RepositoryError};
pub use router::kyc_router;
pub use service::{KycService, KycServiceError, PersistPolicy, ValidationError};
pub use state::{
    apply_upload, can_finalize, can_start, derive_status, Transition, TransitionError,
    UploadOutcome,
};
pub use sumsub::SumsubClient;
pub use views::{
    ApplicantView, DocumentListView, DocumentUploadRequest, MediaUploadRequest, ResultView,
    UploadView,
};
