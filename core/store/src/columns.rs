use std::fmt;

/// Columns of the database. A column is a prefix table: all keys of one
/// subsystem live in one column, so iteration and deletion stay scoped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum DBCol {
    /// `block hash -> SCALE encoded header`.
    BlockHeader,
    /// `block hash -> SCALE encoded body`.
    BlockBody,
    /// Chain metadata: genesis hash, leaves, finalised heads per
    /// `(round, set id)`.
    BlockMeta,
    /// `little endian block number -> SCALE encoded list of block hashes`.
    NumberToHash,
    /// Trie nodes: `Blake2b-256(encoding) -> encoding`.
    State,
    /// Epoch data: scalar keys plus `epochinfo`/`configinfo` records.
    Epoch,
}

impl DBCol {
    pub const COUNT: usize = 6;

    pub const ALL: [DBCol; Self::COUNT] = [
        DBCol::BlockHeader,
        DBCol::BlockBody,
        DBCol::BlockMeta,
        DBCol::NumberToHash,
        DBCol::State,
        DBCol::Epoch,
    ];
}

impl fmt::Display for DBCol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
