//! Claim coordinator
//!
//! Serializes the idle-to-claimed transition. Concurrent claims race only on
//! inserting into the claim-in-progress set, which happens synchronously
//! while selecting the instance; everything after that point owns the
//! service exclusively until the guard drops.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::gateway::{GatewayError, JoinRequest, NewConversation};
use crate::metrics;
use crate::provider::ProviderError;
use crate::store::MetadataRecord;

use super::{ClaimGuard, Instance, PoolManager, PoolState};

/// Path the instructions file is written to inside the instance workspace
const INSTRUCTIONS_PATH: &str = "/workspace/INSTRUCTIONS.md";

/// A claim request from the control plane
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub agent_name: String,
    pub instructions: String,
    /// When present, join this conversation instead of creating one
    pub join_url: Option<String>,
}

/// Result of a successful claim
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub instance_id: String,
    /// Absent when a join is still waiting for acceptance
    pub conversation_id: Option<String>,
    pub invite_url: Option<String>,
    pub joined: bool,
}

/// Error type for claim operations
#[derive(Debug)]
pub enum ClaimError {
    /// No idle instance is available right now
    NoIdleAvailable,
    /// The instance reported it is already bound to a conversation
    AlreadyBound,
    Gateway(GatewayError),
    Provider(ProviderError),
    Store(std::io::Error),
}

impl std::fmt::Display for ClaimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimError::NoIdleAvailable => write!(f, "no idle instance available"),
            ClaimError::AlreadyBound => write!(f, "instance already bound to a conversation"),
            ClaimError::Gateway(e) => write!(f, "gateway error: {}", e),
            ClaimError::Provider(e) => write!(f, "provider error: {}", e),
            ClaimError::Store(e) => write!(f, "metadata store error: {}", e),
        }
    }
}

impl std::error::Error for ClaimError {}

impl From<ProviderError> for ClaimError {
    fn from(e: ProviderError) -> Self {
        ClaimError::Provider(e)
    }
}

impl From<std::io::Error> for ClaimError {
    fn from(e: std::io::Error) -> Self {
        ClaimError::Store(e)
    }
}

impl PoolManager {
    /// Move an idle instance to claimed and hand back its conversation
    ///
    /// Until metadata is written the instance is untouched from the pool's
    /// point of view: any failure releases the guard and the next tick
    /// re-derives it as idle. A 409 from the gateway aborts the claim
    /// without releasing the remote conversation, whose state is unknown.
    pub async fn claim(self: &Arc<Self>, request: ClaimRequest) -> Result<ClaimOutcome, ClaimError> {
        let started = Instant::now();

        let (instance, url, _guard) = match self.select_idle() {
            Some(selection) => selection,
            None => {
                metrics::CLAIMS_TOTAL.with_label_values(&["no_idle"]).inc();
                return Err(ClaimError::NoIdleAvailable);
            }
        };
        info!(instance = %instance.id, agent = %request.agent_name, "claiming instance");

        match self.bind_conversation(&instance, &url, &request).await {
            Ok(outcome) => {
                metrics::CLAIMS_TOTAL.with_label_values(&["ok"]).inc();
                metrics::CLAIM_DURATION.observe(started.elapsed().as_secs_f64());
                self.maybe_backfill();
                Ok(outcome)
            }
            Err(e) => {
                let label = match &e {
                    ClaimError::AlreadyBound => "conflict",
                    _ => "error",
                };
                metrics::CLAIMS_TOTAL.with_label_values(&[label]).inc();
                warn!(instance = %instance.id, error = %e, "claim failed");
                Err(e)
            }
        }
    }

    /// Pick an idle instance and mark it claim-in-progress, synchronously
    ///
    /// Selection and insertion happen back-to-back under the set's own lock
    /// semantics: between finding the candidate and inserting its id there
    /// is no await point, so two racing claims can never select the same
    /// service.
    fn select_idle(&self) -> Option<(Instance, String, ClaimGuard)> {
        let candidates = self.cache.snapshot();
        for instance in candidates {
            if instance.state != PoolState::Idle {
                continue;
            }
            let Some(url) = instance.url.clone() else {
                continue;
            };
            if let Some(guard) = self.claims.try_insert(&instance.service_id) {
                return Some((instance, url, guard));
            }
        }
        None
    }

    async fn bind_conversation(
        self: &Arc<Self>,
        instance: &Instance,
        url: &str,
        request: &ClaimRequest,
    ) -> Result<ClaimOutcome, ClaimError> {
        // Instructions land in the workspace before the conversation exists
        // so the agent sees them from its very first turn.
        let script = instructions_script(&request.instructions);
        let result = self.provider.exec(&instance.service_id, &script).await?;
        if !result.success() {
            return Err(ClaimError::Provider(ProviderError::Fatal(format!(
                "instructions write exited {}: {}",
                result.exit_code, result.stderr
            ))));
        }

        let joined = request.join_url.is_some();
        let grant = match &request.join_url {
            Some(join_url) => self
                .gateway
                .join(
                    url,
                    &JoinRequest {
                        invite_url: join_url.clone(),
                        profile_name: request.agent_name.clone(),
                        env: self.config.environment.clone(),
                    },
                )
                .await,
            None => self
                .gateway
                .create_conversation(
                    url,
                    &NewConversation {
                        name: request.agent_name.clone(),
                        profile_name: request.agent_name.clone(),
                        env: self.config.environment.clone(),
                    },
                )
                .await,
        }
        .map_err(|e| match e {
            GatewayError::Conflict => ClaimError::AlreadyBound,
            other => ClaimError::Gateway(other),
        })?;

        // Commit point: from here the claim is durable and only cosmetic
        // steps may fail.
        let claimed_at = Utc::now();
        let record = MetadataRecord {
            id: instance.id.clone(),
            service_id: instance.service_id.clone(),
            agent_name: request.agent_name.clone(),
            conversation_id: grant.conversation_id.clone(),
            invite_url: grant.invite_url.clone(),
            instructions: request.instructions.clone(),
            checkpoint_id: instance.checkpoint_id.clone(),
            created_at: instance.created_at,
            claimed_at,
        };
        self.store.save(&record)?;

        let display_name = format!("{} ({})", instance.name, request.agent_name);
        if let Err(e) = self
            .provider
            .rename_service(&instance.service_id, &display_name)
            .await
        {
            warn!(instance = %instance.id, error = %e, "cosmetic rename failed");
        }

        self.cache.update(&instance.id, |entry| {
            entry.state = PoolState::Claimed;
            entry.enrich_from(&record);
        });

        Ok(ClaimOutcome {
            instance_id: instance.id.clone(),
            conversation_id: grant.conversation_id,
            invite_url: grant.invite_url,
            joined,
        })
    }
}

/// Shell script writing the instructions file into the workspace
fn instructions_script(instructions: &str) -> String {
    // Quoted heredoc, with a guard against an EOF marker in the body
    let body = instructions.replace("INSTRUCTIONS_EOF", "INSTRUCTIONS-EOF");
    format!(
        "set -e\nmkdir -p /workspace\ncat > {} <<'INSTRUCTIONS_EOF'\n{}\nINSTRUCTIONS_EOF\n",
        INSTRUCTIONS_PATH, body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instructions_script_quotes_heredoc() {
        let script = instructions_script("plan trips\nbook hotels");
        assert!(script.contains("<<'INSTRUCTIONS_EOF'"));
        assert!(script.contains("plan trips\nbook hotels"));
    }

    #[test]
    fn test_instructions_script_escapes_marker() {
        let script = instructions_script("sneaky\nINSTRUCTIONS_EOF\nrest");
        // The body must not be able to terminate the heredoc early
        assert_eq!(script.matches("\nINSTRUCTIONS_EOF\n").count(), 1);
    }
}
