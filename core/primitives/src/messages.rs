use parity_scale_codec::{Decode, Encode};

use crate::block::{Body, Extrinsic};
use crate::hash::Hash;
use crate::header::{Digest, Header};
use crate::BlockNumber;

/// Announcement of a freshly imported block, gossiped to all peers.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlockAnnounce {
    pub parent_hash: Hash,
    #[codec(compact)]
    pub number: BlockNumber,
    pub state_root: Hash,
    pub extrinsics_root: Hash,
    pub digest: Digest,
    pub best_block: bool,
}

impl BlockAnnounce {
    pub fn new(header: &Header, best_block: bool) -> Self {
        Self {
            parent_hash: header.parent_hash,
            number: header.number,
            state_root: header.state_root,
            extrinsics_root: header.extrinsics_root,
            digest: header.digest.clone(),
            best_block,
        }
    }
}

/// Batch of extrinsics relayed from a peer's transaction pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct TransactionMessage {
    pub extrinsics: Vec<Extrinsic>,
}

/// Bitmap of the [`BlockData`] fields a [`BlockRequest`] asks for.
pub mod requested_data {
    pub const HEADER: u32 = 1;
    pub const BODY: u32 = 1 << 1;
    pub const RECEIPT: u32 = 1 << 2;
    pub const MESSAGE_QUEUE: u32 = 1 << 3;
    pub const JUSTIFICATION: u32 = 1 << 4;
    pub const ALL: u32 = HEADER | BODY | RECEIPT | MESSAGE_QUEUE | JUSTIFICATION;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Direction {
    #[codec(index = 0)]
    Ascending,
    #[codec(index = 1)]
    Descending,
}

/// Starting point of a block request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum FromBlock {
    #[codec(index = 0)]
    Hash(Hash),
    #[codec(index = 1)]
    Number(u64),
}

/// Request for a range of blocks, served by the sync collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlockRequest {
    pub fields: u32,
    pub from_block: FromBlock,
    pub to_block: Option<Hash>,
    pub direction: Direction,
    pub max_blocks: Option<u32>,
}

/// Data for a single block inside a [`BlockResponse`].
///
/// `justification: Some(vec![])` means "present but empty", which is distinct
/// from `None` ("absent") and must survive the wire round trip.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlockData {
    pub hash: Hash,
    pub header: Option<Header>,
    pub body: Option<Body>,
    pub receipt: Option<Vec<u8>>,
    pub message_queue: Option<Vec<u8>>,
    pub justification: Option<Vec<u8>>,
}

impl BlockData {
    pub fn empty(hash: Hash) -> Self {
        Self { hash, header: None, body: None, receipt: None, message_queue: None, justification: None }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct BlockResponse {
    pub blocks: Vec<BlockData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_request_round_trips() {
        let request = BlockRequest {
            fields: requested_data::HEADER | requested_data::BODY,
            from_block: FromBlock::Number(7),
            to_block: None,
            direction: Direction::Ascending,
            max_blocks: Some(128),
        };
        let encoded = request.encode();
        assert_eq!(BlockRequest::decode(&mut &encoded[..]).unwrap(), request);
    }

    #[test]
    fn absent_and_empty_justifications_stay_distinct() {
        let mut with_empty = BlockData::empty(Hash::hash_bytes(b"block"));
        with_empty.justification = Some(vec![]);
        let absent = BlockData::empty(Hash::hash_bytes(b"block"));

        let decoded_empty = BlockData::decode(&mut &with_empty.encode()[..]).unwrap();
        let decoded_absent = BlockData::decode(&mut &absent.encode()[..]).unwrap();

        assert_eq!(decoded_empty.justification, Some(vec![]));
        assert_eq!(decoded_absent.justification, None);
        assert_ne!(decoded_empty, decoded_absent);
    }

    #[test]
    fn block_announce_copies_header_fields() {
        let header = Header::new(
            Hash::hash_bytes(b"parent"),
            3,
            Hash::hash_bytes(b"state"),
            Hash::hash_bytes(b"ext"),
            Digest::default(),
        );
        let announce = BlockAnnounce::new(&header, true);
        assert_eq!(announce.parent_hash, header.parent_hash);
        assert_eq!(announce.number, 3);
        assert!(announce.best_block);
    }
}
