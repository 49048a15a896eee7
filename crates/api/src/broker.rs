use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use sokana_auth::{RequestSigner, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use sokana_contracts::{ApiFailure, ApiSuccess, PhiData, PhiFetchRequest, PhiUpdateRequest};

pub const REQUEST_ID_HEADER: &str = "x-sokana-request-id";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("phi broker request timed out")]
    Timeout,
    #[error("phi broker unreachable")]
    Unreachable,
    #[error("phi broker returned an unreadable response")]
    InvalidResponse,
    /// Non-2xx answer. `message` is the broker's fixed error text.
    #[error("phi broker rejected the request with status {status}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },
}

/// Signed HTTP client for the PHI broker.
#[derive(Debug, Clone)]
pub struct PhiBrokerClient {
    http: reqwest::Client,
    base_url: String,
    signer: RequestSigner,
    timeout: Duration,
}

impl PhiBrokerClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        signer: RequestSigner,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            signer,
            timeout,
        }
    }

    pub async fn fetch_phi(
        &self,
        req: &PhiFetchRequest,
        request_id: &str,
    ) -> Result<PhiData, BrokerError> {
        self.post_signed("/v1/phi/client", req, request_id).await
    }

    pub async fn update_phi(
        &self,
        req: &PhiUpdateRequest,
        request_id: &str,
    ) -> Result<PhiData, BrokerError> {
        self.post_signed("/v1/phi/client/update", req, request_id).await
    }

    pub async fn health(&self) -> Result<(), BrokerError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BrokerError::Rejected {
                status: resp.status().as_u16(),
                code: None,
                message: None,
            })
        }
    }

    async fn post_signed<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        request_id: &str,
    ) -> Result<PhiData, BrokerError> {
        // The signature covers exactly these bytes; they are sent unchanged.
        let bytes = serde_json::to_vec(body).map_err(|_| BrokerError::InvalidResponse)?;
        let signed = self.signer.signed_headers(&bytes);

        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, signed.timestamp)
            .header(SIGNATURE_HEADER, signed.signature)
            .header(REQUEST_ID_HEADER, request_id)
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status.is_success() {
            let body = resp
                .json::<ApiSuccess<PhiData>>()
                .await
                .map_err(|_| BrokerError::InvalidResponse)?;
            return Ok(body.data);
        }

        let failure = resp.json::<ApiFailure>().await.ok();
        Err(BrokerError::Rejected {
            status: status.as_u16(),
            code: failure.as_ref().and_then(|f| f.code.clone()),
            message: failure.map(|f| f.error),
        })
    }
}

fn transport_error(err: reqwest::Error) -> BrokerError {
    if err.is_timeout() {
        BrokerError::Timeout
    } else {
        BrokerError::Unreachable
    }
}
