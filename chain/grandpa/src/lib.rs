//! The receive/validate half of the finality gadget: verifies signed
//! prevote/precommit messages, enforces round and set-id policy, detects
//! equivocation, defers votes that arrived too early, and answers lagging
//! peers with commit messages.

use std::collections::HashMap;
use std::sync::Arc;

use parity_scale_codec::Encode;
use parking_lot::Mutex;

use filament_chain::BlockState;
use filament_crypto::ed25519::{PublicKey, Signature};
use filament_crypto::{GlobalKeystore, KeyType};
use filament_primitives::network::{PeerId, ReputationChange};
use filament_primitives::{AuthorityId, Hash, Header};

pub mod messages;
mod receiver;
pub mod telemetry;
mod tracker;

#[cfg(test)]
mod tests;

pub use messages::{
    CommitMessage, FullVote, SignedMessage, SignedVote, Subround, Vote, VoteMessage, Voter,
};
pub use receiver::receive_vote_messages;
pub use telemetry::{NoopTelemetry, Telemetry, TelemetryEvent};

use tracker::VoteTracker;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("set ids do not match")]
    SetIdMismatch,
    #[error("rounds do not match: got {got}, expected {expected}")]
    RoundMismatch { got: u64, expected: u64 },
    #[error("vote is equivocatory")]
    Equivocation,
    #[error("vote is from ourselves, ignoring")]
    VoteFromSelf,
    #[error("authority {0} is not in the current set")]
    AuthorityNotInSet(AuthorityId),
    #[error("block {0} does not exist")]
    BlockDoesNotExist(Hash),
    #[error("voted block is not a descendant of the finalised head")]
    VoteBlockMismatch,
    #[error("no grandpa keypair in the keystore")]
    NoGrandpaKey,
    #[error(transparent)]
    Chain(#[from] filament_chain::Error),
}

impl Error {
    /// Errors meaning the voted block is simply not known yet; the vote is
    /// deferred instead of dropped.
    fn defers_vote(&self) -> bool {
        match self {
            Error::BlockDoesNotExist(_) => true,
            Error::Chain(err) => err.is_missing_block(),
            _ => false,
        }
    }
}

/// Network seam used by the vote validator: unicast replies to a specific
/// peer and reputation reporting. Send failures are logged, never fatal.
pub trait Network: Send + Sync {
    fn send_message(&self, to: &PeerId, message: CommitMessage) -> std::io::Result<()>;
    fn report_peer(&self, peer: &PeerId, change: ReputationChange);
}

/// Round-scoped state, guarded by the service's round lock so no vote is
/// admitted into a round that is simultaneously changing.
struct RoundState {
    round: u64,
    set_id: u64,
    voters: Vec<Voter>,
    /// Last finalised block; every valid vote must descend from it.
    head: Hash,
}

impl RoundState {
    fn voter(&self, authority_id: &AuthorityId) -> Option<&Voter> {
        self.voters.iter().find(|voter| voter.key == *authority_id)
    }
}

/// Per-stage vote storage, guarded by the map lock (strictly nested inside
/// the round lock).
#[derive(Default)]
struct VoteMaps {
    prevotes: HashMap<AuthorityId, SignedVote>,
    precommits: HashMap<AuthorityId, SignedVote>,
    pv_equivocations: HashMap<AuthorityId, Vec<SignedVote>>,
    pc_equivocations: HashMap<AuthorityId, Vec<SignedVote>>,
}

pub struct GrandpaService {
    block_state: Arc<BlockState>,
    network: Arc<dyn Network>,
    telemetry: Arc<dyn Telemetry>,
    /// Our own GRANDPA public key; votes from it are rejected as echoes.
    public_key: AuthorityId,
    state: Mutex<RoundState>,
    votes: Mutex<VoteMaps>,
    tracker: Mutex<VoteTracker>,
    /// Precommit sets of recently finalised rounds, used to answer lagging
    /// peers with a justified commit message.
    justifications: Mutex<HashMap<(u64, u64), Vec<SignedVote>>>,
}

impl GrandpaService {
    pub fn new(
        block_state: Arc<BlockState>,
        network: Arc<dyn Network>,
        telemetry: Arc<dyn Telemetry>,
        keystore: &GlobalKeystore,
        voters: Vec<Voter>,
        round: u64,
        set_id: u64,
    ) -> Result<Self, Error> {
        let public_key = keystore
            .keystore(KeyType::Grandpa)
            .public_keys()
            .into_iter()
            .next()
            .ok_or(Error::NoGrandpaKey)?;
        let head = block_state.get_highest_finalised_header()?.hash();
        Ok(Self {
            block_state,
            network,
            telemetry,
            public_key,
            state: Mutex::new(RoundState { round, set_id, voters, head }),
            votes: Mutex::new(VoteMaps::default()),
            tracker: Mutex::new(VoteTracker::new()),
            justifications: Mutex::new(HashMap::new()),
        })
    }

    pub fn round(&self) -> u64 {
        self.state.lock().round
    }

    pub fn set_id(&self) -> u64 {
        self.state.lock().set_id
    }

    pub(crate) fn telemetry(&self) -> &dyn Telemetry {
        &*self.telemetry
    }

    /// Records the precommit set that finalised `(round, set_id)` so
    /// lagging peers can be answered with a justified commit.
    pub fn record_justification(
        &self,
        round: u64,
        set_id: u64,
        precommits: Vec<SignedVote>,
    ) {
        self.justifications.lock().insert((round, set_id), precommits);
    }

    /// Moves the service into a new round: the per-round vote maps reset,
    /// the finalised head is re-read, and votes deferred for this or
    /// earlier rounds are re-fed through validation.
    pub fn advance_to_round(&self, round: u64) -> Result<(), Error> {
        let head = self.block_state.get_highest_finalised_header()?.hash();
        {
            let mut state = self.state.lock();
            state.round = round;
            state.head = head;
            *self.votes.lock() = VoteMaps::default();
        }
        let deferred = self.tracker.lock().drain_round_votes(round);
        self.retry_deferred(deferred);
        Ok(())
    }

    /// Called when a block was imported: votes deferred on it get another
    /// pass through validation.
    pub fn handle_imported_block(&self, block_hash: Hash) {
        let deferred = self.tracker.lock().drain_block_votes(&block_hash);
        self.retry_deferred(deferred);
    }

    fn retry_deferred(&self, deferred: Vec<(PeerId, VoteMessage)>) {
        for (peer, message) in deferred {
            match self.validate_vote_message(&peer, &message) {
                Ok(Some(vote)) => {
                    tracing::debug!(target: "grandpa", ?vote, %peer, "deferred vote accepted")
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(target: "grandpa", %err, %peer, "deferred vote rejected")
                }
            }
        }
    }

    /// Validates a vote message and stores the resulting vote.
    ///
    /// Returns `Ok(Some(vote))` for an accepted vote, `Ok(None)` for a
    /// silently discarded message (round outside the accepted window), and
    /// an error otherwise. Missing-block errors additionally defer the
    /// message to the tracker.
    pub fn validate_vote_message(
        &self,
        from: &PeerId,
        message: &VoteMessage,
    ) -> Result<Option<Vote>, Error> {
        // Hold the round lock for the whole validation so the round cannot
        // change underneath us.
        let state = self.state.lock();

        let vote = Vote::new(message.message.block_hash, message.message.number);
        self.verify_signature(message, &vote)?;

        if message.set_id != state.set_id {
            return Err(Error::SetIdMismatch);
        }

        const MAX_ROUNDS_LAG: u64 = 1;
        const MAX_ROUNDS_AHEAD: u64 = 1;
        let min_round_accepted = state.round.saturating_sub(MAX_ROUNDS_LAG);
        let max_round_accepted = state.round + MAX_ROUNDS_AHEAD;
        if message.round < min_round_accepted || message.round > max_round_accepted {
            // Discard the message entirely.
            return Ok(None);
        }

        if message.round < state.round {
            // The peer does not know the round was finalised: answer with a
            // commit message for that round.
            let header = self.block_state.get_finalised_header(message.round, message.set_id)?;
            let commit = self.new_commit_message(&header, message.round, message.set_id);
            if let Err(err) = self.network.send_message(from, commit) {
                tracing::warn!(target: "grandpa", %err, %from, "failed to send commit message");
            }
            return Err(Error::RoundMismatch { got: message.round, expected: state.round });
        }

        if message.round > state.round {
            // We may be lagging; park the message for a retry once our
            // round catches up.
            self.tracker.lock().add_round_vote(from.clone(), *message);
            return Err(Error::RoundMismatch { got: message.round, expected: state.round });
        }

        let voter = state
            .voter(&message.message.authority_id)
            .ok_or(Error::AuthorityNotInSet(message.message.authority_id))?
            .clone();

        if message.message.authority_id == self.public_key {
            return Err(Error::VoteFromSelf);
        }

        if let Err(err) = self.validate_vote(&state, &vote) {
            if err.defers_vote() {
                self.tracker.lock().add_block_vote(from.clone(), *message);
            }
            return Err(err);
        }

        let signed_vote = SignedVote {
            vote,
            signature: message.message.signature,
            authority_id: message.message.authority_id,
        };

        if self.check_for_equivocation(&voter, signed_vote, message.message.stage) {
            return Err(Error::Equivocation);
        }

        let mut votes = self.votes.lock();
        match message.message.stage {
            Subround::Prevote | Subround::PrimaryProposal => {
                votes.prevotes.insert(voter.key, signed_vote);
            }
            Subround::Precommit => {
                votes.precommits.insert(voter.key, signed_vote);
            }
        }
        Ok(Some(vote))
    }

    fn verify_signature(&self, message: &VoteMessage, vote: &Vote) -> Result<(), Error> {
        let public_key = PublicKey::try_from(&message.message.authority_id)
            .map_err(|_| Error::InvalidSignature)?;
        let full_vote = FullVote {
            stage: message.message.stage,
            vote: *vote,
            round: message.round,
            set_id: message.set_id,
        };
        let signature = Signature(message.message.signature);
        if !public_key.verify(&full_vote.encode(), &signature) {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    /// The voted block must exist and descend from the finalised head.
    fn validate_vote(&self, state: &RoundState, vote: &Vote) -> Result<(), Error> {
        if !self.block_state.has_header(&vote.hash)? {
            return Err(Error::BlockDoesNotExist(vote.hash));
        }
        if !self.block_state.is_descendant_of(&state.head, &vote.hash)? {
            return Err(Error::VoteBlockMismatch);
        }
        Ok(())
    }

    /// Detects an equivocation: a second vote by the same authority in the
    /// same stage for a different block. Both votes move into the stage's
    /// equivocation map (they may still be used in justifications); further
    /// votes from a known equivocator are appended there directly.
    fn check_for_equivocation(
        &self,
        voter: &Voter,
        vote: SignedVote,
        stage: Subround,
    ) -> bool {
        let mut votes = self.votes.lock();
        let maps = &mut *votes;
        let (stage_votes, equivocations) = match stage {
            Subround::Prevote | Subround::PrimaryProposal => {
                (&mut maps.prevotes, &mut maps.pv_equivocations)
            }
            Subround::Precommit => (&mut maps.precommits, &mut maps.pc_equivocations),
        };

        if let Some(entries) = equivocations.get_mut(&voter.key) {
            // Already equivocated: every further vote this round is
            // equivocatory too.
            entries.push(vote);
            return true;
        }

        match stage_votes.get(&voter.key) {
            Some(existing) if existing.vote.hash != vote.vote.hash => {
                let existing = stage_votes
                    .remove(&voter.key)
                    .expect("entry was just read under the same lock");
                equivocations.insert(voter.key, vec![existing, vote]);
                true
            }
            _ => false,
        }
    }

    fn new_commit_message(&self, header: &Header, round: u64, set_id: u64) -> CommitMessage {
        let precommits =
            self.justifications.lock().get(&(round, set_id)).cloned().unwrap_or_default();
        CommitMessage { round, set_id, vote: Vote::from_header(header), precommits }
    }

    pub fn prevote_count(&self) -> usize {
        self.votes.lock().prevotes.len()
    }

    pub fn precommit_count(&self) -> usize {
        self.votes.lock().precommits.len()
    }

    #[cfg(test)]
    fn prevote_for(&self, authority: &AuthorityId) -> Option<SignedVote> {
        self.votes.lock().prevotes.get(authority).copied()
    }

    #[cfg(test)]
    fn precommit_for(&self, authority: &AuthorityId) -> Option<SignedVote> {
        self.votes.lock().precommits.get(authority).copied()
    }

    #[cfg(test)]
    fn prevote_equivocations_for(&self, authority: &AuthorityId) -> Vec<SignedVote> {
        self.votes.lock().pv_equivocations.get(authority).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    fn deferred_block_votes(&self, block_hash: &Hash) -> usize {
        self.tracker.lock().deferred_for_block(block_hash)
    }

    #[cfg(test)]
    fn deferred_round_votes(&self, round: u64) -> usize {
        self.tracker.lock().deferred_for_round(round)
    }
}
