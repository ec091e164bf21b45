//! HTTP client for the Sumsub identity-verification API.
//!
//! Every request is signed with the app token and secret (see [`signing`]).
//! Multipart bodies are encoded up front so the signature covers the exact
//! bytes on the wire.
//!
//! [`signing`]: super::signing

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::domain::{ApplicantId, ApplicantProfile, DocumentType, ProviderReview};
use super::provider::{
    DocumentUpload, ProviderError, ProviderReceipt, SdkToken, UploadFile, VerificationProvider,
};
use super::signing::{
    content_digest, request_signature, ACCESS_SIG_HEADER, ACCESS_TS_HEADER, APP_TOKEN_HEADER,
};
use super::state::UploadOutcome;
use crate::config::{ProviderConfig, ProviderCredentials};

const IMAGE_ID_HEADER: &str = "X-Image-Id";

pub struct SumsubClient {
    base_url: Url,
    credentials: ProviderCredentials,
    level_name: String,
    client: Client,
}

impl std::fmt::Debug for SumsubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SumsubClient")
            .field("base_url", &self.base_url.as_str())
            .field("level_name", &self.level_name)
            .finish_non_exhaustive()
    }
}

impl SumsubClient {
    pub fn new(
        config: &ProviderConfig,
        credentials: ProviderCredentials,
    ) -> Result<Self, ProviderError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|err| ProviderError::Transport(format!("invalid provider base URL: {err}")))?;
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("kyc-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        Ok(Self {
            base_url,
            credentials,
            level_name: config.level_name.clone(),
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Transport("provider base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<reqwest::Response, ProviderError> {
        let timestamp = Utc::now().timestamp();
        let signed_path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let signature = request_signature(
            &self.credentials.secret_key,
            timestamp,
            method.as_str(),
            &signed_path,
            &body,
        )
        .map_err(|err| ProviderError::Signing(err.to_string()))?;

        debug!(%method, path = %signed_path, bytes = body.len(), "provider request");

        let mut request = self
            .client
            .request(method, url)
            .header(APP_TOKEN_HEADER, &self.credentials.app_token)
            .header(ACCESS_TS_HEADER, timestamp.to_string())
            .header(ACCESS_SIG_HEADER, signature);
        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        request
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))
    }

    async fn send_json(
        &self,
        method: Method,
        url: Url,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = serde_json::to_vec(payload).map_err(|err| ProviderError::Decode(err.to_string()))?;
        self.send(method, url, body, Some(mime::APPLICATION_JSON.to_string()))
            .await
    }

    async fn upload(
        &self,
        applicant_id: &ApplicantId,
        segments: &[&str],
        metadata: Option<serde_json::Value>,
        file: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError> {
        let mut url_segments = vec!["resources", "applicants", applicant_id.0.as_str()];
        url_segments.extend_from_slice(segments);
        let url = self.endpoint(&url_segments)?;

        let mut form = MultipartBody::new(&file.content);
        if let Some(metadata) = metadata {
            form.text_part("metadata", mime::APPLICATION_JSON.as_ref(), &metadata.to_string());
        }
        form.file_part("content", &file.file_name, &file.mime_type, &file.content);
        let (content_type, body) = form.finish();

        let response = self.send(Method::POST, url, body, Some(content_type)).await?;
        let response = check_status(response, Some(applicant_id)).await?;

        let outcome = if response.status() == StatusCode::ACCEPTED {
            UploadOutcome::Processing
        } else {
            UploadOutcome::Accepted
        };
        let document_id = response
            .headers()
            .get(IMAGE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Ok(ProviderReceipt {
            outcome,
            document_id,
        })
    }
}

#[async_trait]
impl VerificationProvider for SumsubClient {
    async fn create_applicant(
        &self,
        profile: &ApplicantProfile,
    ) -> Result<ApplicantId, ProviderError> {
        let mut url = self.endpoint(&["resources", "applicants"])?;
        url.query_pairs_mut()
            .append_pair("levelName", &self.level_name);

        let mut info = json!({
            "firstName": profile.first_name,
            "lastName": profile.last_name,
            "country": profile.country,
        });
        if let Some(phone) = &profile.phone {
            info["phone"] = json!(phone);
        }
        let payload = json!({
            "externalUserId": profile.external_user_id,
            "email": profile.email,
            "fixedInfo": info,
        });

        let response = self.send_json(Method::POST, url, &payload).await?;
        let response = check_status(response, None).await?;
        let created: CreatedApplicant = decode(response).await?;
        Ok(ApplicantId(created.id))
    }

    async fn submit_document(
        &self,
        applicant_id: &ApplicantId,
        document: &DocumentUpload,
    ) -> Result<ProviderReceipt, ProviderError> {
        let metadata = json!({
            "idDocType": document.document_type.label(),
            "country": document.country,
        });
        self.upload(applicant_id, &["info", "idDoc"], Some(metadata), &document.file)
            .await
    }

    async fn submit_liveness(
        &self,
        applicant_id: &ApplicantId,
        video: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError> {
        self.upload(applicant_id, &["info", "faceLiveness"], None, video)
            .await
    }

    async fn submit_selfie(
        &self,
        applicant_id: &ApplicantId,
        image: &UploadFile,
    ) -> Result<ProviderReceipt, ProviderError> {
        let metadata = json!({ "idDocType": DocumentType::Selfie.label() });
        self.upload(applicant_id, &["info", "idDoc"], Some(metadata), image)
            .await
    }

    async fn fetch_result(
        &self,
        applicant_id: &ApplicantId,
    ) -> Result<ProviderReview, ProviderError> {
        let url = self.endpoint(&["resources", "applicants", &applicant_id.0, "one"])?;
        let response = self.send(Method::GET, url, Vec::new(), None).await?;
        let response = check_status(response, Some(applicant_id)).await?;
        let payload: ApplicantPayload = decode(response).await?;
        Ok(payload.into_review())
    }

    async fn request_review(&self, applicant_id: &ApplicantId) -> Result<(), ProviderError> {
        let url = self.endpoint(&[
            "resources",
            "applicants",
            &applicant_id.0,
            "status",
            "pending",
        ])?;
        let response = self.send(Method::POST, url, Vec::new(), None).await?;
        check_status(response, Some(applicant_id)).await?;
        Ok(())
    }

    async fn create_sdk_token(
        &self,
        external_user_id: &str,
        ttl_secs: u32,
    ) -> Result<SdkToken, ProviderError> {
        let url = self.endpoint(&["resources", "accessTokens", "sdk"])?;
        let payload = json!({
            "userId": external_user_id,
            "levelName": self.level_name,
            "ttlInSecs": ttl_secs,
        });
        let response = self.send_json(Method::POST, url, &payload).await?;
        let response = check_status(response, None).await?;
        let token: TokenPayload = decode(response).await?;
        Ok(SdkToken {
            token: token.token,
            user_id: token.user_id.unwrap_or_else(|| external_user_id.to_string()),
            ttl_secs,
        })
    }
}

async fn check_status(
    response: reqwest::Response,
    applicant_id: Option<&ApplicantId>,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        if let Some(id) = applicant_id {
            return Err(ProviderError::NotFound(id.clone()));
        }
    }

    if status.is_client_error() {
        let parsed: ErrorPayload = serde_json::from_str(&text).unwrap_or_default();
        let description = parsed
            .description
            .unwrap_or_else(|| format!("provider returned {status}"));
        let code = parsed
            .error_name
            .or_else(|| parsed.error_code.map(|code| code.to_string()));
        warn!(status = status.as_u16(), ?code, %description, "provider rejected request");
        return Err(ProviderError::Rejected {
            status: status.as_u16(),
            code,
            description,
        });
    }

    Err(ProviderError::Transport(format!("provider returned {status}: {text}")))
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let text = response
        .text()
        .await
        .map_err(|err| ProviderError::Transport(err.to_string()))?;
    serde_json::from_str(&text).map_err(|err| ProviderError::Decode(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct CreatedApplicant {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload {
    description: Option<String>,
    error_code: Option<i64>,
    error_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    token: String,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApplicantPayload {
    #[serde(default)]
    review: Option<ReviewPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewPayload {
    review_status: Option<String>,
    #[serde(default)]
    review_result: Option<ReviewResultPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewResultPayload {
    review_answer: Option<String>,
    review_reject_type: Option<String>,
    moderation_comment: Option<String>,
}

impl ApplicantPayload {
    fn into_review(self) -> ProviderReview {
        let review = self.review;
        let status = review
            .as_ref()
            .and_then(|review| review.review_status.clone())
            .unwrap_or_else(|| "init".to_string());
        let result = review.and_then(|review| review.review_result);
        ProviderReview {
            review_status: status,
            review_answer: result.as_ref().and_then(|r| r.review_answer.clone()),
            reject_type: result.as_ref().and_then(|r| r.review_reject_type.clone()),
            moderation_comment: result.and_then(|r| r.moderation_comment),
        }
    }
}

/// `multipart/form-data` body built in memory so it can be signed.
struct MultipartBody {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartBody {
    fn new(seed: &[u8]) -> Self {
        let digest = content_digest(seed);
        let nonce = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let boundary = format!("kyc-{}-{nonce:x}", &digest["sha256:".len()..][..24]);
        Self {
            boundary,
            body: Vec::new(),
        }
    }

    fn text_part(&mut self, name: &str, content_type: &str, value: &str) {
        self.header(name, None, content_type);
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
    }

    fn file_part(&mut self, name: &str, file_name: &str, content_type: &str, content: &[u8]) {
        self.header(name, Some(file_name), content_type);
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
    }

    fn header(&mut self, name: &str, file_name: Option<&str>, content_type: &str) {
        let disposition = match file_name {
            Some(file_name) => format!(
                "form-data; name=\"{name}\"; filename=\"{}\"",
                file_name.replace('"', "")
            ),
            None => format!("form-data; name=\"{name}\""),
        };
        let head = format!(
            "--{}\r\nContent-Disposition: {disposition}\r\nContent-Type: {content_type}\r\n\r\n",
            self.boundary
        );
        self.body.extend_from_slice(head.as_bytes());
    }

    fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}
