use parity_scale_codec::{Decode, Encode};

use crate::header::Header;

/// An opaque transaction-like byte string consumed by the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Extrinsic(pub Vec<u8>);

impl Extrinsic {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Extrinsic {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Extrinsic {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Ordered sequence of extrinsics making up a block body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Body(pub Vec<Extrinsic>);

impl Body {
    pub fn iter(&self) -> impl Iterator<Item = &Extrinsic> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Extrinsic>> for Body {
    fn from(extrinsics: Vec<Extrinsic>) -> Self {
        Self(extrinsics)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

impl Block {
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }
}
