use serde::Serialize;

use filament_primitives::{AuthorityId, BlockNumber, Hash};

/// Telemetry events emitted by the vote receive loop. Field names follow
/// the telemetry server's schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum TelemetryEvent {
    AfgReceivedPrevote {
        target_hash: String,
        target_number: String,
        voter: String,
    },
    AfgReceivedPrecommit {
        target_hash: String,
        target_number: String,
        voter: String,
    },
}

impl TelemetryEvent {
    pub fn afg_received_prevote(hash: Hash, number: BlockNumber, voter: AuthorityId) -> Self {
        Self::AfgReceivedPrevote {
            target_hash: hash.to_string(),
            target_number: number.to_string(),
            voter: voter.to_string(),
        }
    }

    pub fn afg_received_precommit(hash: Hash, number: BlockNumber, voter: AuthorityId) -> Self {
        Self::AfgReceivedPrecommit {
            target_hash: hash.to_string(),
            target_number: number.to_string(),
            voter: voter.to_string(),
        }
    }
}

/// Best-effort telemetry sink. Implementations must not block the caller;
/// delivery failures are at most logged.
pub trait Telemetry: Send + Sync {
    fn send(&self, event: TelemetryEvent);
}

/// Telemetry sink that drops everything, for nodes running without a
/// telemetry endpoint.
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn send(&self, _event: TelemetryEvent) {}
}
