//! Pure status derivation
//!
//! Maps one observation of an instance - provider deploy status, optional
//! gateway probe, and age - onto a pool state. Total and deterministic over
//! its inputs so the whole table is unit-testable. The contextual rewrite of
//! `dead`/`sleeping` to `crashed` when claim metadata exists depends on the
//! store and therefore lives in the reconciler, not here.

use std::time::Duration;

use crate::gateway::ProbeResult;
use crate::provider::DeployStatus;

use super::PoolState;

/// Derive the pool state of one instance
///
/// # Arguments
/// * `deploy` - latest deploy status, None if the service never deployed
/// * `probe` - gateway /status result, None if the probe failed or was skipped
/// * `age` - time since the service was created
/// * `stuck_timeout` - age at which an unreachable instance counts as dead
pub fn derive_state(
    deploy: Option<&DeployStatus>,
    probe: Option<&ProbeResult>,
    age: Duration,
    stuck_timeout: Duration,
) -> PoolState {
    match deploy {
        Some(
            DeployStatus::Queued
            | DeployStatus::Waiting
            | DeployStatus::Building
            | DeployStatus::Deploying,
        ) => PoolState::Starting,
        Some(DeployStatus::Sleeping) => PoolState::Sleeping,
        Some(
            DeployStatus::Failed
            | DeployStatus::Crashed
            | DeployStatus::Removed
            | DeployStatus::Skipped,
        ) => PoolState::Dead,
        Some(DeployStatus::Success) => match probe {
            // A probe that answered but is not ready yet counts the same as
            // no probe: the gateway process is still coming up.
            Some(p) if p.ready => {
                if p.has_conversation() {
                    PoolState::Claimed
                } else {
                    PoolState::Idle
                }
            }
            _ => starting_or_stuck(age, stuck_timeout),
        },
        Some(DeployStatus::Unknown(_)) | None => starting_or_stuck(age, stuck_timeout),
    }
}

fn starting_or_stuck(age: Duration, stuck_timeout: Duration) -> PoolState {
    if age >= stuck_timeout {
        PoolState::Dead
    } else {
        PoolState::Starting
    }
}
