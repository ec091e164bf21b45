use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::Args;
use kyc_gateway::error::AppError;
use kyc_gateway::workflows::kyc::{
    ApplicantId, ApplicantProfile, DocumentUpload, DocumentUploadRequest, KycService,
    KycServiceError, MediaUploadRequest, MemoryKycRepository, ProviderError, ProviderReceipt,
    ProviderReview, SdkToken, UploadFile, UploadOutcome, UploadView, VerificationProvider,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Accept every upload and fetch an approved decision instead of rejecting the ID document.
    #[arg(long)]
    pub(crate) approve: bool,
    /// External user id for the demo applicant.
    #[arg(long, default_value = "demo-user-1")]
    pub(crate) external_user_id: String,
}

/// Offline stand-in for the provider: answers instantly and approves reviews.
#[derive(Debug, Default)]
pub(crate) struct SandboxProvider {
    reject_documents: bool,
    sequence: AtomicU64,
}

impl SandboxProvider {
    pub(crate) fn rejecting_documents() -> Self {
        Self {
            reject_documents: true,
            ..Self::default()
        }
    }

    fn receipt(&self, prefix: &str) -> ProviderReceipt {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        ProviderReceipt::accepted(Some(format!("{prefix}-{id}")))
    }
}

#[async_trait]
impl VerificationProvider for SandboxProvider {
    async fn create_applicant(
        &self,
        profile: &ApplicantProfile,
    ) -> Result<ApplicantId, ProviderError> {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(ApplicantId(format!(
            "sandbox-{}-{id}",
            profile.external_user_id
        )))
    }

    async fn submit_document(
        &self,
        _applicant_id: &ApplicantId,
        document: &DocumentUpload,
    ) -> Result<ProviderReceipt, ProviderError> {
        if self.reject_documents {
            return Ok(ProviderReceipt {
                outcome: UploadOutcome::Rejected {
                    reason: format!(
                        "{} from {} is not accepted for this level",
                        document.document_type.label(),
                        document.country
                    ),
                },
                document_id: None,
            });
        }
        Ok(self.receipt("doc"))
    }

    async fn submit_liveness(
        &self,
        _applicant_id: &ApplicantId,
        _video: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError> {
        Ok(self.receipt("liveness"))
    }

    async fn submit_selfie(
        &self,
        _applicant_id: &ApplicantId,
        _image: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError> {
        Ok(self.receipt("selfie"))
    }

    async fn fetch_result(
        &self,
        _applicant_id: &ApplicantId,
    ) -> Result<ProviderReview, ProviderError> {
        Ok(ProviderReview {
            review_status: "completed".to_string(),
            review_answer: Some("GREEN".to_string()),
            reject_type: None,
            moderation_comment: None,
        })
    }

    async fn request_review(&self, _applicant_id: &ApplicantId) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn create_sdk_token(
        &self,
        external_user_id: &str,
        ttl_secs: u32,
    ) -> Result<SdkToken, ProviderError> {
        Ok(SdkToken {
            token: format!("_act-sandbox-{external_user_id}"),
            user_id: external_user_id.to_string(),
            ttl_secs,
        })
    }
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let provider = if args.approve {
        SandboxProvider::default()
    } else {
        SandboxProvider::rejecting_documents()
    };
    let service = KycService::new(Arc::new(MemoryKycRepository::default()), Arc::new(provider));

    println!("== KYC verification demo ==");
    let profile = ApplicantProfile {
        external_user_id: args.external_user_id,
        email: "demo.applicant@example.com".to_string(),
        phone: None,
        first_name: "Demo".to_string(),
        last_name: "Applicant".to_string(),
        country: "GBR".to_string(),
    };

    let created = match service.create_applicant(profile).await {
        Ok(view) => view,
        Err(err) => {
            println!("  Applicant creation failed: {err}");
            return Ok(());
        }
    };
    let id = created.applicant_id.clone();
    println!("  Applicant {} created (status: {})", id, created.status);
    for step in &created.steps {
        println!("    - {}: {}", step.step, step.status);
    }

    let liveness = service
        .upload_liveness(MediaUploadRequest {
            applicant_id: id.0.clone(),
            file_name: Some("liveness.mp4".to_string()),
            content_base64: STANDARD.encode(b"demo-liveness-video"),
        })
        .await;
    report_upload("Liveness video", liveness);

    let document = service
        .upload_document(DocumentUploadRequest {
            applicant_id: id.0.clone(),
            document_type: "PASSPORT".to_string(),
            country: "GBR".to_string(),
            file_name: "passport.jpg".to_string(),
            content_base64: STANDARD.encode(b"demo-passport-scan"),
        })
        .await;
    report_upload("Identity document", document);

    if args.approve {
        let selfie = service
            .upload_selfie(MediaUploadRequest {
                applicant_id: id.0.clone(),
                file_name: Some("selfie.jpg".to_string()),
                content_base64: STANDARD.encode(b"demo-selfie"),
            })
            .await;
        report_upload("Selfie", selfie);
    }

    match service.applicant(&id).await {
        Ok(view) => {
            println!(
                "  Applicant status: {} (finalizable: {})",
                view.status, view.can_finalize
            );
            for step in &view.steps {
                match &step.error_message {
                    Some(message) => println!("    - {}: {} ({})", step.step, step.status, message),
                    None => println!("    - {}: {}", step.step, step.status),
                }
            }
        }
        Err(err) => println!("  Applicant lookup failed: {err}"),
    }

    match service.result(&id).await {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("  Decision payload:\n{json}"),
            Err(err) => println!("  Decision payload unavailable: {err}"),
        },
        Err(err @ KycServiceError::NotFinalizable { .. }) => {
            println!("  Result refused [{}]: {err}", err.code());
        }
        Err(err) => println!("  Result lookup failed: {err}"),
    }

    Ok(())
}

fn report_upload(label: &str, result: Result<UploadView, KycServiceError>) {
    match result {
        Ok(view) => println!(
            "  {label}: {} -> {} (applicant {})",
            view.step, view.status, view.applicant_status
        ),
        Err(err) => println!("  {label} failed [{}]: {err}", err.code()),
    }
}
