use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const APP_TOKEN_HEADER: &str = "X-App-Token";
pub const ACCESS_TS_HEADER: &str = "X-App-Access-Ts";
pub const ACCESS_SIG_HEADER: &str = "X-App-Access-Sig";
pub const WEBHOOK_DIGEST_HEADER: &str = "X-Payload-Digest";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

/// Lowercase hex HMAC-SHA256 over `ts + METHOD + path + body`.
///
/// `path` includes the query string exactly as sent.
pub fn request_signature(
    secret: &str,
    timestamp: i64,
    method: &str,
    path: &str,
    body: &[u8],
) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| SigningError::InvalidKey(err.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(method.to_ascii_uppercase().as_bytes());
    mac.update(path.as_bytes());
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a webhook digest (hex HMAC-SHA256 of the raw body) in constant time.
pub fn verify_webhook_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    let provided = signature.trim().to_ascii_lowercase();
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Storage reference for uploaded content, `sha256:<hex>`.
pub fn content_digest(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_signature_is_deterministic_hex() {
        let first = request_signature("secret", 1_700_000_000, "post", "/resources/applicants", b"{}")
            .expect("signature");
        let second =
            request_signature("secret", 1_700_000_000, "POST", "/resources/applicants", b"{}")
                .expect("signature");

        assert_eq!(first, second, "method casing must not change the digest");
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn request_signature_covers_timestamp_path_and_body() {
        let base = request_signature("secret", 1, "GET", "/a", b"").expect("signature");
        assert_ne!(base, request_signature("secret", 2, "GET", "/a", b"").expect("signature"));
        assert_ne!(base, request_signature("secret", 1, "GET", "/b", b"").expect("signature"));
        assert_ne!(base, request_signature("secret", 1, "GET", "/a", b"x").expect("signature"));
        assert_ne!(base, request_signature("other", 1, "GET", "/a", b"").expect("signature"));
    }

    #[test]
    fn webhook_signature_round_trip() {
        let payload = br#"{"applicantId":"abc","type":"applicantReviewed"}"#;
        let mut mac = HmacSha256::new_from_slice(b"hook-secret").expect("key");
        mac.update(payload);
        let digest = hex::encode(mac.finalize().into_bytes());

        assert!(verify_webhook_signature("hook-secret", payload, &digest));
        assert!(verify_webhook_signature(
            "hook-secret",
            payload,
            &digest.to_ascii_uppercase()
        ));
        assert!(!verify_webhook_signature("wrong", payload, &digest));
        assert!(!verify_webhook_signature("hook-secret", b"tampered", &digest));
        assert!(!verify_webhook_signature("hook-secret", payload, ""));
    }

    #[test]
    fn content_digest_is_prefixed_sha256() {
        let digest = content_digest(b"");
        assert_eq!(
            digest,
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
