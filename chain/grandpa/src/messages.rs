use parity_scale_codec::{Decode, Encode};

use filament_primitives::{AuthorityId, BlockNumber, Hash, Header};

pub const SIGNATURE_LENGTH: usize = 64;

/// The three vote stages of a round. The discriminants are the wire
/// encoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Subround {
    #[codec(index = 0)]
    PrimaryProposal,
    #[codec(index = 1)]
    Prevote,
    #[codec(index = 2)]
    Precommit,
}

/// A vote for a block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Vote {
    pub hash: Hash,
    pub number: BlockNumber,
}

impl Vote {
    pub fn new(hash: Hash, number: BlockNumber) -> Self {
        Self { hash, number }
    }

    pub fn from_header(header: &Header) -> Self {
        Self { hash: header.hash(), number: header.number }
    }
}

/// A vote accompanied by the authority that cast it and its signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SignedVote {
    pub vote: Vote,
    pub signature: [u8; SIGNATURE_LENGTH],
    pub authority_id: AuthorityId,
}

/// The vote payload carried inside a [`VoteMessage`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SignedMessage {
    pub stage: Subround,
    pub block_hash: Hash,
    pub number: BlockNumber,
    pub signature: [u8; SIGNATURE_LENGTH],
    pub authority_id: AuthorityId,
}

/// A gossiped vote. Wire layout:
/// `round || set_id || stage || block_hash || number || signature || authority_id`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct VoteMessage {
    pub round: u64,
    pub set_id: u64,
    pub message: SignedMessage,
}

/// The object a voter actually signs: the vote bound to its stage, round
/// and set id, so a signature cannot be replayed across rounds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct FullVote {
    pub stage: Subround,
    pub vote: Vote,
    pub round: u64,
    pub set_id: u64,
}

/// Announces a finalised block together with the precommits justifying it.
/// Sent unicast to peers observed voting in an already-finalised round.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CommitMessage {
    pub round: u64,
    pub set_id: u64,
    pub vote: Vote,
    pub precommits: Vec<SignedVote>,
}

/// A member of the current authority set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Voter {
    pub key: AuthorityId,
    pub id: u64,
}
