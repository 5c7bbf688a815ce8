//! Canonical node encoding.
//!
//! Layout: a header byte carrying the node variant in its two high bits and
//! the partial key length in the remaining six (with continuation bytes once
//! the length saturates), the partial key packed little-endian, the value
//! SCALE length-prefixed (leaves and branches with value), then for branches
//! a u16 little-endian children bitmap followed by the SCALE byte-vec child
//! references in ascending index order. A child reference is the child's
//! encoding when shorter than a hash, otherwise its Blake2b-256.

use std::sync::Arc;

use parity_scale_codec::{Decode, Encode, Input};

use filament_primitives::Hash;

use crate::trie::nibbles::unpack_nibbles;
use crate::trie::node::{Branch, Children, Leaf, Node, NodeCache, NodeHandle};

/// Encoding of the empty trie: a lone header byte with the empty variant.
pub(crate) const EMPTY_NODE_ENCODING: [u8; 1] = [0x00];

const VARIANT_MASK: u8 = 0b1100_0000;
const LEAF_VARIANT: u8 = 0b0100_0000;
const BRANCH_VARIANT: u8 = 0b1000_0000;
const BRANCH_WITH_VALUE_VARIANT: u8 = 0b1100_0000;

const KEY_LEN_MASK: u8 = 0b0011_1111;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown node variant {0:#04x}")]
    UnknownVariant(u8),
    #[error("invalid partial key padding")]
    Padding,
    #[error("child reference of {0} bytes")]
    BadChildLength(usize),
    #[error("{0}")]
    Codec(#[from] parity_scale_codec::Error),
}

fn encode_header(variant: u8, partial_key_len: usize, out: &mut Vec<u8>) {
    if partial_key_len < usize::from(KEY_LEN_MASK) {
        out.push(variant | partial_key_len as u8);
        return;
    }
    out.push(variant | KEY_LEN_MASK);
    let mut remaining = partial_key_len - usize::from(KEY_LEN_MASK);
    while remaining >= 255 {
        out.push(255);
        remaining -= 255;
    }
    out.push(remaining as u8);
}

fn decode_header<I: Input>(input: &mut I) -> Result<(u8, usize), DecodeError> {
    let header = input.read_byte()?;
    let variant = header & VARIANT_MASK;
    let mut partial_key_len = usize::from(header & KEY_LEN_MASK);
    if partial_key_len == usize::from(KEY_LEN_MASK) {
        loop {
            let byte = input.read_byte()?;
            partial_key_len += usize::from(byte);
            if byte < 255 {
                break;
            }
        }
    }
    Ok((variant, partial_key_len))
}

impl Node {
    /// Returns the canonical encoding, computing and caching it together
    /// with the merkle values of any dirty descendants.
    pub(crate) fn encoding(&mut self) -> Vec<u8> {
        if let Some(encoding) = &self.cache().encoding {
            return encoding.clone();
        }
        let encoding = match self {
            Node::Leaf(leaf) => {
                let mut out = Vec::with_capacity(leaf.partial_key.len() / 2 + leaf.value.len() + 8);
                encode_header(LEAF_VARIANT, leaf.partial_key.len(), &mut out);
                out.extend(super::nibbles::nibbles_to_key(&leaf.partial_key));
                leaf.value.encode_to(&mut out);
                out
            }
            Node::Branch(branch) => {
                let variant = if branch.value.is_some() {
                    BRANCH_WITH_VALUE_VARIANT
                } else {
                    BRANCH_VARIANT
                };
                let mut out = Vec::new();
                encode_header(variant, branch.partial_key.len(), &mut out);
                out.extend(super::nibbles::nibbles_to_key(&branch.partial_key));
                if let Some(value) = &branch.value {
                    value.encode_to(&mut out);
                }
                out.extend(branch.children.bitmap().to_le_bytes());
                for slot in branch.children.0.iter_mut() {
                    match slot {
                        None => {}
                        Some(NodeHandle::Hash(hash)) => {
                            hash.0.as_slice().encode_to(&mut out);
                        }
                        Some(NodeHandle::InMemory(child)) => {
                            let merkle_value = Arc::make_mut(child).merkle_value(false);
                            merkle_value.encode_to(&mut out);
                        }
                    }
                }
                out
            }
        };
        self.cache_mut().encoding = Some(encoding.clone());
        encoding
    }

    /// The reference this node's parent embeds: the encoding itself when it
    /// is shorter than a hash (inlined node), otherwise the Blake2b-256 of
    /// the encoding. The root is always referenced by hash.
    pub(crate) fn merkle_value(&mut self, is_root: bool) -> Vec<u8> {
        if let Some(merkle_value) = &self.cache().merkle_value {
            if !is_root || merkle_value.len() == Hash::LENGTH {
                return merkle_value.clone();
            }
        }
        let encoding = self.encoding();
        let merkle_value = if !is_root && encoding.len() < Hash::LENGTH {
            encoding
        } else {
            Hash::hash_bytes(&encoding).0.to_vec()
        };
        self.cache_mut().merkle_value = Some(merkle_value.clone());
        merkle_value
    }

    /// Blake2b-256 of the encoding, the database key this node is stored
    /// under regardless of inlining.
    pub(crate) fn node_hash(&mut self) -> Hash {
        Hash::hash_bytes(&self.encoding())
    }
}

/// Decodes a node. Decoded nodes start out clean with empty caches; inline
/// children are materialised recursively with their encodings cached.
pub(crate) fn decode_node<I: Input>(input: &mut I) -> Result<Node, DecodeError> {
    let (variant, partial_key_len) = decode_header(input)?;
    let mut key_bytes = vec![0u8; partial_key_len / 2 + partial_key_len % 2];
    input.read(&mut key_bytes)?;
    let partial_key = unpack_nibbles(&key_bytes, partial_key_len).ok_or(DecodeError::Padding)?;

    match variant {
        LEAF_VARIANT => {
            let value = Vec::<u8>::decode(input)?;
            Ok(Node::Leaf(Leaf { partial_key, value, cache: NodeCache::default() }))
        }
        BRANCH_VARIANT | BRANCH_WITH_VALUE_VARIANT => {
            let value = if variant == BRANCH_WITH_VALUE_VARIANT {
                Some(Vec::<u8>::decode(input)?)
            } else {
                None
            };
            let mut bitmap_bytes = [0u8; 2];
            input.read(&mut bitmap_bytes)?;
            let bitmap = u16::from_le_bytes(bitmap_bytes);

            let mut children = Children::default();
            let mut descendants = 0u32;
            for index in 0..16u8 {
                if bitmap & (1 << index) == 0 {
                    continue;
                }
                let reference = Vec::<u8>::decode(input)?;
                let handle = match reference.len() {
                    0 => return Err(DecodeError::BadChildLength(0)),
                    Hash::LENGTH => {
                        NodeHandle::Hash(Hash::from_slice(&reference).expect("length checked"))
                    }
                    n if n > Hash::LENGTH => return Err(DecodeError::BadChildLength(n)),
                    _ => {
                        // Inlined child: its encoding is embedded verbatim.
                        let mut child = decode_node(&mut reference.as_slice())?;
                        child.cache_mut().encoding = Some(reference.clone());
                        child.cache_mut().merkle_value = Some(reference);
                        if let Node::Branch(branch) = &child {
                            descendants += branch.descendants;
                        }
                        NodeHandle::InMemory(Arc::new(child))
                    }
                };
                children[index] = Some(handle);
                descendants += 1;
            }
            Ok(Node::Branch(Branch {
                partial_key,
                value,
                children,
                descendants,
                cache: NodeCache::default(),
            }))
        }
        other => Err(DecodeError::UnknownVariant(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_continuation() {
        let mut out = Vec::new();
        encode_header(LEAF_VARIANT, 62, &mut out);
        assert_eq!(out, vec![LEAF_VARIANT | 62]);

        let mut out = Vec::new();
        encode_header(LEAF_VARIANT, 63, &mut out);
        assert_eq!(out, vec![LEAF_VARIANT | 63, 0]);

        let mut out = Vec::new();
        encode_header(LEAF_VARIANT, 63 + 255 + 7, &mut out);
        assert_eq!(out, vec![LEAF_VARIANT | 63, 255, 7]);

        for len in [0usize, 1, 62, 63, 64, 317, 63 + 255, 63 + 255 + 255] {
            let mut out = Vec::new();
            encode_header(BRANCH_VARIANT, len, &mut out);
            let (variant, decoded) = decode_header(&mut out.as_slice()).unwrap();
            assert_eq!((variant, decoded), (BRANCH_VARIANT, len));
        }
    }

    #[test]
    fn leaf_round_trips() {
        let mut leaf = Node::new_leaf(vec![0xa, 0xb, 0xc], b"value".to_vec());
        let encoding = leaf.encoding();
        assert_eq!(encoding[0], LEAF_VARIANT | 3);

        let decoded = decode_node(&mut encoding.as_slice()).unwrap();
        assert_eq!(decoded.partial_key(), &[0xa, 0xb, 0xc]);
        assert_eq!(decoded.value(), Some(b"value".as_slice()));
        assert!(!decoded.is_dirty());
    }

    #[test]
    fn branch_with_inline_and_hashed_children() {
        let small = Arc::new(Node::new_leaf(vec![0x1], b"s".to_vec()));
        let hashed = Hash::hash_bytes(b"far away child");

        let mut branch = Node::new_branch(vec![0xf], Some(b"branch value".to_vec()));
        branch.children[0] = Some(NodeHandle::InMemory(small));
        branch.children[7] = Some(NodeHandle::Hash(hashed));
        branch.descendants = 2;
        let mut node = Node::Branch(branch);

        let encoding = node.encoding();
        assert_eq!(encoding[0] & VARIANT_MASK, BRANCH_WITH_VALUE_VARIANT);

        let decoded = decode_node(&mut encoding.as_slice()).unwrap();
        let Node::Branch(decoded) = decoded else { panic!("expected branch") };
        assert_eq!(decoded.value, Some(b"branch value".to_vec()));
        assert_eq!(decoded.children.bitmap(), 1 | 1 << 7);
        // The small child came back inline, the big one as a hash pointer.
        let inline = decoded.children[0].as_ref().unwrap().as_node().unwrap();
        assert_eq!(inline.value(), Some(b"s".as_slice()));
        match decoded.children[7].as_ref().unwrap() {
            NodeHandle::Hash(h) => assert_eq!(*h, hashed),
            NodeHandle::InMemory(_) => panic!("expected hash pointer"),
        }
    }

    #[test]
    fn large_node_is_referenced_by_hash() {
        let mut big = Node::new_leaf(vec![0x1, 0x2], vec![0xee; 64]);
        let merkle_value = big.merkle_value(false);
        assert_eq!(merkle_value.len(), Hash::LENGTH);

        let mut small = Node::new_leaf(vec![0x1], b"v".to_vec());
        let merkle_value = small.merkle_value(false);
        assert!(merkle_value.len() < Hash::LENGTH);
        assert_eq!(merkle_value, small.encoding());
        // As a root even a small node hashes.
        assert_eq!(small.merkle_value(true).len(), Hash::LENGTH);
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let err = decode_node(&mut [0x00u8].as_slice()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownVariant(0)));
    }
}
