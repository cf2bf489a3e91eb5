//! HTTP SMS gateway adapter.
//!
//! Posts outbound command texts to an external SMS provider endpoint. Used
//! by the command engine's text channel when configured; deployments
//! without a provider fall back to the mock gateway.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use domain::services::{SmsError, SmsGateway};

/// Delivery timeout for the provider call.
const SMS_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    body: &'a str,
}

/// SMS gateway speaking a minimal JSON POST contract.
pub struct HttpSmsGateway {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpSmsGateway {
    pub fn new(endpoint: String, api_key: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(SMS_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn send(&self, phone: &str, body: &str) -> Result<(), SmsError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&SmsRequest { to: phone, body })
            .send()
            .await
            .map_err(|e| SmsError::Unreachable(e.to_string()))?;

        if response.status().is_success() {
            tracing::info!(phone = %phone, "SMS command handed to gateway");
            Ok(())
        } else {
            Err(SmsError::Rejected(format!(
                "gateway returned {}",
                response.status()
            )))
        }
    }
}
