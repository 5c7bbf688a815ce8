use filament_primitives::Hash;
use filament_store::TrieError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Block is not known, neither in memory nor in the database.
    #[error("block {0} does not exist")]
    BlockDoesNotExist(Hash),
    /// Ancestry query start block is unknown.
    #[error("start node {0} not found")]
    StartNodeNotFound(Hash),
    /// Ancestry query end block is unknown.
    #[error("end node {0} not found")]
    EndNodeNotFound(Hash),
    /// Walking back from `descendant` never reached `ancestor`.
    #[error("descendant of {ancestor} not found walking back from {descendant}")]
    DescendantNotFound { ancestor: Hash, descendant: Hash },
    /// Body was pruned or never stored.
    #[error("body for block {0} not found")]
    BodyNotFound(Hash),
    /// No runtime registered for the block or any of its ancestors.
    #[error("no runtime registered for block {0}")]
    RuntimeNotFound(Hash),
    /// The `:code` entry is missing from the trie state.
    #[error(":code entry missing from trie state")]
    CodeEmpty,
    /// No block finalised yet for the given round and set id.
    #[error("no finalised head for round {round}, set id {set_id}")]
    FinalisedHeadNotFound { round: u64, set_id: u64 },
    /// Adding a block whose parent is unknown.
    #[error("parent {0} not found")]
    ParentNotFound(Hash),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Trie(#[from] TrieError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the "block not known yet" family of errors, which callers
    /// like the GRANDPA tracker treat as retriable rather than fatal.
    pub fn is_missing_block(&self) -> bool {
        matches!(
            self,
            Error::BlockDoesNotExist(_)
                | Error::StartNodeNotFound(_)
                | Error::EndNodeNotFound(_)
                | Error::DescendantNotFound { .. }
        )
    }
}

/// Failure while instantiating a runtime from a WASM blob.
#[derive(Debug, thiserror::Error)]
#[error("runtime instantiation failed: {0}")]
pub struct RuntimeError(pub String);
