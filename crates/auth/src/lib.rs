//! HMAC-SHA256 request signing for the API → PHI broker channel.
//!
//! The signed message is `"{timestamp}.{raw body}"`, where `timestamp` is the
//! exact `X-Sokana-Timestamp` header text (unix epoch milliseconds). The
//! verifier works on the raw body bytes as received, before any JSON parsing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hex::ToHex;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const TIMESTAMP_HEADER: &str = "x-sokana-timestamp";
pub const SIGNATURE_HEADER: &str = "x-sokana-signature";

/// Accepted distance between the sender's timestamp and the local clock.
pub const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("request signing secret is not configured")]
    MissingSecret,
    #[error("missing signature headers")]
    MissingHeaders,
    #[error("invalid request timestamp")]
    InvalidTimestamp,
    #[error("request timestamp outside the allowed window")]
    Expired,
    #[error("invalid request signature")]
    Mismatch,
}

impl SignatureError {
    /// Low-cardinality label for metrics and logs.
    pub fn reason(self) -> &'static str {
        match self {
            SignatureError::MissingSecret => "missing_secret",
            SignatureError::MissingHeaders => "missing_headers",
            SignatureError::InvalidTimestamp => "invalid_timestamp",
            SignatureError::Expired => "expired",
            SignatureError::Mismatch => "mismatch",
        }
    }
}

#[derive(Clone)]
struct SigningKey(HmacSha256);

impl SigningKey {
    fn new(secret: Option<&str>) -> Result<Self, SignatureError> {
        let secret = secret
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::MissingSecret)?;
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| SignatureError::MissingSecret)?;
        Ok(Self(mac))
    }

    fn tag(&self, timestamp: &str, body: &[u8]) -> [u8; 32] {
        let mut mac = self.0.clone();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);

        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp: String,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct RequestSigner {
    key: SigningKey,
}

impl RequestSigner {
    pub fn new(secret: &str) -> Result<Self, SignatureError> {
        Ok(Self {
            key: SigningKey::new(Some(secret))?,
        })
    }

    pub fn sign(&self, timestamp_ms: i64, body: &[u8]) -> String {
        self.key
            .tag(&timestamp_ms.to_string(), body)
            .encode_hex::<String>()
    }

    pub fn signed_headers(&self, body: &[u8]) -> SignedHeaders {
        let timestamp_ms = unix_epoch_ms_now();
        SignedHeaders {
            timestamp: timestamp_ms.to_string(),
            signature: self.sign(timestamp_ms, body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: SigningKey,
    max_skew_ms: i64,
}

impl SignatureVerifier {
    /// Refuses to exist without a secret; a broker that cannot verify must
    /// not serve.
    pub fn new(secret: Option<&str>) -> Result<Self, SignatureError> {
        Ok(Self {
            key: SigningKey::new(secret)?,
            max_skew_ms: MAX_CLOCK_SKEW_MS,
        })
    }

    pub fn verify_headers(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        now_ms: i64,
    ) -> Result<(), SignatureError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        self.verify(header(TIMESTAMP_HEADER), header(SIGNATURE_HEADER), body, now_ms)
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        now_ms: i64,
    ) -> Result<(), SignatureError> {
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            tracing::warn!(
                has_timestamp = timestamp.is_some(),
                has_signature = signature.is_some(),
                "signature.rejected_missing_headers"
            );
            return Err(SignatureError::MissingHeaders);
        };

        let Ok(sent_at_ms) = timestamp.parse::<i64>() else {
            tracing::warn!("signature.rejected_invalid_timestamp");
            return Err(SignatureError::InvalidTimestamp);
        };

        let age_ms = now_ms.saturating_sub(sent_at_ms);
        if age_ms.unsigned_abs() > self.max_skew_ms.unsigned_abs() {
            tracing::warn!(age_ms, "signature.rejected_outside_window");
            return Err(SignatureError::Expired);
        }

        let expected = self.key.tag(timestamp, body);
        let provided = hex::decode(signature).unwrap_or_default();
        let matches = provided.len() == expected.len() && bool::from(expected.ct_eq(&provided));
        if !matches {
            tracing::warn!(age_ms, "signature.rejected_mismatch");
            return Err(SignatureError::Mismatch);
        }

        Ok(())
    }
}

pub fn unix_epoch_ms_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration.as_millis().min(i64::MAX as u128) as i64
}
