//! Agent gateway client
//!
//! Every instance runs a small HTTP server (the gateway) on its public URL.
//! The pool uses three endpoints: `GET /status` to probe readiness and
//! conversation binding, `POST /conversation` to start a fresh conversation,
//! and `POST /join` to join an existing one via invite URL.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Conversation reference reported by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
}

/// Response from `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ready: bool,
    /// Present once the instance is bound to a conversation
    pub conversation: Option<Conversation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

impl ProbeResult {
    pub fn has_conversation(&self) -> bool {
        self.conversation.is_some()
    }
}

/// Request body for `POST /conversation`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub name: String,
    pub profile_name: String,
    pub env: String,
}

/// Request body for `POST /join`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub invite_url: String,
    pub profile_name: String,
    pub env: String,
}

/// Response from `POST /conversation` or `POST /join`
///
/// Join mode can complete with `status: "waiting_for_acceptance"` and no
/// conversation id; callers must tolerate both fields being absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationGrant {
    pub conversation_id: Option<String>,
    pub invite_url: Option<String>,
    pub status: Option<String>,
}

/// Error type for gateway operations
#[derive(Debug)]
pub enum GatewayError {
    /// Transport failure or timeout; the instance counts as unhealthy
    Unavailable(String),
    /// The instance is already bound to a conversation (HTTP 409)
    Conflict,
    /// Any other non-2xx response
    Status(u16, String),
    /// The response body did not match the contract
    Parse(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Unavailable(msg) => write!(f, "gateway unreachable: {}", msg),
            GatewayError::Conflict => write!(f, "instance already bound to a conversation"),
            GatewayError::Status(code, body) => write!(f, "gateway returned {}: {}", code, body),
            GatewayError::Parse(msg) => write!(f, "bad gateway response: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Unavailable(e.to_string())
    }
}

/// Narrow interface to the per-instance agent gateway
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Probe readiness and conversation binding
    async fn probe(&self, base_url: &str) -> Result<ProbeResult, GatewayError>;

    /// Start a fresh conversation on the instance
    async fn create_conversation(
        &self,
        base_url: &str,
        request: &NewConversation,
    ) -> Result<ConversationGrant, GatewayError>;

    /// Join an existing conversation via invite URL
    async fn join(
        &self,
        base_url: &str,
        request: &JoinRequest,
    ) -> Result<ConversationGrant, GatewayError>;
}

/// HTTP client speaking the gateway contract
pub struct HttpGateway {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl HttpGateway {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            probe_timeout,
        }
    }

    async fn post_grant<T: Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<ConversationGrant, GatewayError> {
        let res = self
            .client
            .post(url)
            .timeout(Duration::from_secs(30))
            .json(body)
            .send()
            .await?;

        let status = res.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(GatewayError::Conflict);
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::Status(status.as_u16(), body));
        }

        res.json::<ConversationGrant>()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn probe(&self, base_url: &str) -> Result<ProbeResult, GatewayError> {
        let res = self
            .client
            .get(format!("{}/status", base_url))
            .timeout(self.probe_timeout)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::Status(status.as_u16(), body));
        }

        res.json::<ProbeResult>()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))
    }

    async fn create_conversation(
        &self,
        base_url: &str,
        request: &NewConversation,
    ) -> Result<ConversationGrant, GatewayError> {
        self.post_grant(&format!("{}/conversation", base_url), request)
            .await
    }

    async fn join(
        &self,
        base_url: &str,
        request: &JoinRequest,
    ) -> Result<ConversationGrant, GatewayError> {
        self.post_grant(&format!("{}/join", base_url), request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_result_parses_null_conversation() {
        let probe: ProbeResult =
            serde_json::from_str(r#"{"ready":true,"conversation":null}"#).unwrap();
        assert!(probe.ready);
        assert!(!probe.has_conversation());
    }

    #[test]
    fn test_probe_result_parses_bound_conversation() {
        let probe: ProbeResult =
            serde_json::from_str(r#"{"ready":true,"conversation":{"id":"conv-1"},"streaming":false}"#)
                .unwrap();
        assert!(probe.has_conversation());
        assert_eq!(probe.conversation.unwrap().id, "conv-1");
    }

    #[test]
    fn test_grant_tolerates_pending_join() {
        let grant: ConversationGrant =
            serde_json::from_str(r#"{"status":"waiting_for_acceptance"}"#).unwrap();
        assert!(grant.conversation_id.is_none());
        assert_eq!(grant.status.as_deref(), Some("waiting_for_acceptance"));
    }
}
