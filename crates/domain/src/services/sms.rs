//! SMS gateway collaborator for the text command channel.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by an SMS gateway.
#[derive(Debug, Error)]
pub enum SmsError {
    #[error("gateway rejected the message: {0}")]
    Rejected(String),
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
}

/// Outbound SMS delivery. The reply path stays unhooked; commands sent over
/// SMS only ever reach the SENT status.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, phone: &str, body: &str) -> Result<(), SmsError>;
}

/// Mock gateway for development and testing. Records every send.
#[derive(Debug, Default)]
pub struct MockSmsGateway {
    pub simulate_failure: bool,
    sent: Mutex<Vec<(String, String)>>,
}

impl MockSmsGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            simulate_failure: true,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Messages recorded so far as `(phone, body)` pairs.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsGateway for MockSmsGateway {
    async fn send(&self, phone: &str, body: &str) -> Result<(), SmsError> {
        if self.simulate_failure {
            tracing::warn!(phone = %phone, "Mock SMS gateway simulating failure");
            return Err(SmsError::Unreachable("simulated failure".to_string()));
        }
        tracing::info!(phone = %phone, body_len = body.len(), "Mock: would send SMS command");
        self.sent.lock().unwrap().push((phone.to_string(), body.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_gateway_records_sends() {
        let gateway = MockSmsGateway::new();
        gateway.send("+5585999990000", "REBOOT").await.unwrap();
        let sent = gateway.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+5585999990000");
        assert_eq!(sent[0].1, "REBOOT");
    }

    #[tokio::test]
    async fn test_mock_gateway_failure() {
        let gateway = MockSmsGateway::failing();
        let result = gateway.send("+0", "X").await;
        assert!(matches!(result, Err(SmsError::Unreachable(_))));
        assert!(gateway.sent().is_empty());
    }
}
