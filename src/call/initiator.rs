//! Call-initiation collaborator: a request/response call that asks the
//! telephony backend to dial.

use crate::call::error::CallError;
use crate::call::state::{CallInitiation, CallRequest};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait CallInitiator: Send + Sync {
    /// Ask the backend to place a call. A transport failure is an `Err`; a
    /// backend refusal is an `Ok` with `success: false`.
    async fn initiate(&self, request: &CallRequest) -> Result<CallInitiation, CallError>;
}

/// Posts the call request as JSON and reads a [`CallInitiation`] back.
#[derive(Debug, Clone)]
pub struct HttpCallInitiator {
    client: reqwest::Client,
    url: String,
}

impl HttpCallInitiator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CallError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::Initiation(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CallInitiator for HttpCallInitiator {
    async fn initiate(&self, request: &CallRequest) -> Result<CallInitiation, CallError> {
        debug!(url = %self.url, phone_number = %request.phone_number, "Requesting call initiation");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| CallError::Initiation(e.to_string()))?;

        let status = response.status();
        let body = response
            .json::<CallInitiation>()
            .await
            .map_err(|e| CallError::Initiation(format!("unreadable response ({}): {}", status, e)))?;

        // Some backends answer non-2xx with a well-formed body; trust the body
        // only when it agrees.
        if !status.is_success() && body.success {
            return Err(CallError::Initiation(format!("backend responded with {}", status)));
        }
        Ok(body)
    }
}
