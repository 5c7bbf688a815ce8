use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use filament_primitives::network::PeerId;

use crate::telemetry::TelemetryEvent;
use crate::{Error, GrandpaService, Subround, VoteMessage};

/// Single-consumer dispatcher for inbound vote messages.
///
/// Announces readiness on `ready` before consuming traffic, then reads
/// `(peer, vote)` pairs until the channel closes or `cancel` fires, and
/// finally reports the terminal error (or `None`) on `done`. Cancellation
/// is cooperative: once signalled, the loop returns promptly without
/// draining the channel.
pub async fn receive_vote_messages(
    service: Arc<GrandpaService>,
    mut messages: mpsc::Receiver<(PeerId, VoteMessage)>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
    done: oneshot::Sender<Option<Error>>,
) {
    let _ = ready.send(());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::trace!(target: "grandpa", "returning from receive_vote_messages");
                break;
            }
            received = messages.recv() => {
                let Some((peer, message)) = received else { break };
                tracing::debug!(target: "grandpa", %peer, ?message, "received vote message");

                let signed = &message.message;
                let event = match signed.stage {
                    Subround::Prevote | Subround::PrimaryProposal => {
                        TelemetryEvent::afg_received_prevote(
                            signed.block_hash,
                            signed.number,
                            signed.authority_id,
                        )
                    }
                    Subround::Precommit => TelemetryEvent::afg_received_precommit(
                        signed.block_hash,
                        signed.number,
                        signed.authority_id,
                    ),
                };
                service.telemetry().send(event);

                match service.validate_vote_message(&peer, &message) {
                    Ok(Some(vote)) => tracing::debug!(
                        target: "grandpa",
                        ?vote,
                        round = message.round,
                        prevotes = service.prevote_count(),
                        precommits = service.precommit_count(),
                        "validated vote message",
                    ),
                    Ok(None) => {}
                    Err(err) => tracing::debug!(
                        target: "grandpa",
                        %err,
                        %peer,
                        "failed to validate vote message",
                    ),
                }
            }
        }
    }

    let _ = done.send(None);
}
