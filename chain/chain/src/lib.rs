//! Block state and storage state: the chain's view of headers, bodies,
//! ancestry and best chain, the per-block runtime registry, and the mapping
//! from state roots to trie snapshots.

pub mod block_state;
pub mod error;
pub mod runtime;
pub mod storage_state;
pub mod test_utils;


pub use block_state::BlockState;
pub use error::{Error, RuntimeError};
pub use runtime::{Runtime, RuntimeInstantiator, RuntimeVersion};
pub use storage_state::StorageState;
