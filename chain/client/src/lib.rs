//! The core service: wires block state, storage state, epoch state and the
//! transaction pool together around block import, and handles inbound
//! transactions from the network.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use filament_chain::runtime::{Runtime, RuntimeInstantiator, RuntimeVersion};
use filament_chain::{BlockState, StorageState};
use filament_crypto::{GlobalKeystore, Keypair};
use filament_epoch_manager::EpochState;
use filament_pool::{TransactionPool, ValidTransaction};
use filament_primitives::messages::{BlockAnnounce, TransactionMessage};
use filament_primitives::network::{rep, PeerId, ReputationChange};
use filament_primitives::transaction::{TransactionValidityError, Validity};
use filament_primitives::{AuthorityId, Block, Extrinsic, Hash};
use filament_store::TrieState;


#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("code substitute for block {0} is empty")]
    EmptySubstitute(Hash),
    #[error(transparent)]
    Chain(#[from] filament_chain::Error),
    #[error(transparent)]
    Epoch(#[from] filament_epoch_manager::Error),
    #[error(transparent)]
    Keystore(#[from] filament_crypto::Error),
}

/// Messages the core service pushes out to the network collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkMessage {
    BlockAnnounce(BlockAnnounce),
    Transactions(TransactionMessage),
}

/// Network seam consumed by the core service.
pub trait Network: Send + Sync {
    fn gossip_message(&self, message: NetworkMessage);
    fn report_peer(&self, peer: &PeerId, change: ReputationChange);
    /// Whether initial sync has completed; inbound transactions are ignored
    /// until then.
    fn is_synced(&self) -> bool;
}

/// Runtime wrapper used for code substitution: the substituted instance
/// answers every call, but keeps reporting the code hash of the runtime it
/// replaced so a later genuine `:code` upgrade is still detected.
struct SubstitutedRuntime {
    inner: Arc<dyn Runtime>,
    code_hash: Hash,
}

impl Runtime for SubstitutedRuntime {
    fn version(&self) -> RuntimeVersion {
        self.inner.version()
    }

    fn metadata(&self) -> Vec<u8> {
        self.inner.metadata()
    }

    fn validate_transaction(
        &self,
        extrinsic: &Extrinsic,
    ) -> Result<Validity, TransactionValidityError> {
        self.inner.validate_transaction(extrinsic)
    }

    fn set_context_storage(&self, trie_state: TrieState) {
        self.inner.set_context_storage(trie_state)
    }

    fn code_hash(&self) -> Hash {
        self.code_hash
    }
}

pub struct Config {
    pub block_state: Arc<BlockState>,
    pub storage_state: Arc<StorageState>,
    pub epoch_state: Arc<EpochState>,
    pub network: Arc<dyn Network>,
    pub keystore: Arc<GlobalKeystore>,
    pub instantiator: Arc<dyn RuntimeInstantiator>,
    /// Operator-configured runtime overrides: the WASM blob to use from the
    /// given block hash on, without an on-chain upgrade.
    pub code_substitutes: HashMap<Hash, Vec<u8>>,
}

pub struct Service {
    block_state: Arc<BlockState>,
    storage_state: Arc<StorageState>,
    epoch_state: Arc<EpochState>,
    transaction_pool: Mutex<TransactionPool>,
    network: Arc<dyn Network>,
    keystore: Arc<GlobalKeystore>,
    instantiator: Arc<dyn RuntimeInstantiator>,
    code_substitutes: HashMap<Hash, Vec<u8>>,
    code_substituted_block: Mutex<Option<Hash>>,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Self {
            block_state: config.block_state,
            storage_state: config.storage_state,
            epoch_state: config.epoch_state,
            transaction_pool: Mutex::new(TransactionPool::new()),
            network: config.network,
            keystore: config.keystore,
            instantiator: config.instantiator,
            code_substitutes: config.code_substitutes,
            code_substituted_block: Mutex::new(None),
        }
    }

    pub fn block_state(&self) -> &Arc<BlockState> {
        &self.block_state
    }

    pub fn storage_state(&self) -> &Arc<StorageState> {
        &self.storage_state
    }

    pub fn epoch_state(&self) -> &Arc<EpochState> {
        &self.epoch_state
    }

    /// Pooled transactions, best first.
    pub fn pending_transactions(&self) -> Vec<ValidTransaction> {
        self.transaction_pool.lock().pending()
    }

    /// The block hash most recently subjected to a code substitution.
    pub fn code_substituted_block_hash(&self) -> Option<Hash> {
        *self.code_substituted_block.lock()
    }

    /// Imports a block produced by our own authoring collaborator and
    /// announces it to the network as our new best block.
    pub fn handle_block_produced(
        &self,
        block: &Block,
        trie_state: &mut TrieState,
    ) -> Result<(), Error> {
        self.handle_block(block, trie_state)?;
        let announce = BlockAnnounce::new(&block.header, true);
        self.network.gossip_message(NetworkMessage::BlockAnnounce(announce));
        Ok(())
    }

    /// Imports a block: persists it, commits its post-state trie, detects
    /// runtime upgrades and code substitutions, records its consensus
    /// digests, and maintains the transaction pool when the best chain
    /// moved.
    pub fn handle_block(&self, block: &Block, trie_state: &mut TrieState) -> Result<(), Error> {
        let block_hash = block.header.hash();
        let parent_runtime = self.block_state.get_runtime(Some(&block.header.parent_hash))?;
        let previous_best = self.block_state.best_block_hash();

        self.block_state.add_block(block)?;
        self.storage_state.store_trie(trie_state)?;
        self.block_state.handle_runtime_changes(trie_state, parent_runtime, block_hash)?;
        self.handle_code_substitution(block_hash, trie_state, &*self.instantiator)?;
        self.epoch_state.handle_babe_digests(&block.header)?;

        let new_best = self.block_state.best_block_hash();
        if new_best == block_hash {
            if previous_best != block.header.parent_hash {
                self.handle_chain_reorg(&previous_best, &new_best)?;
            }
            self.maintain_transaction_pool(block)?;
        }

        tracing::debug!(
            target: "core",
            block = %block_hash,
            number = block.header.number,
            best = new_best == block_hash,
            "block imported",
        );
        Ok(())
    }

    /// Applies an operator-configured code substitution for `hash`, if one
    /// exists. The substituted runtime keeps the previous code hash so a
    /// genuine upgrade in a descendant block supersedes it.
    pub fn handle_code_substitution(
        &self,
        hash: Hash,
        trie_state: &TrieState,
        instantiator: &dyn RuntimeInstantiator,
    ) -> Result<(), Error> {
        let Some(code) = self.code_substitutes.get(&hash) else { return Ok(()) };
        if code.is_empty() {
            return Err(Error::EmptySubstitute(hash));
        }

        let current = self.block_state.get_runtime(Some(&hash))?;
        let substituted = instantiator
            .instantiate(code)
            .map_err(filament_chain::Error::from)?;
        substituted.set_context_storage(trie_state.clone());
        let wrapped =
            Arc::new(SubstitutedRuntime { inner: substituted, code_hash: current.code_hash() });
        self.block_state.store_runtime(hash, wrapped);
        *self.code_substituted_block.lock() = Some(hash);

        tracing::info!(target: "core", block = %hash, "runtime code substituted");
        Ok(())
    }

    /// Handles a best-chain switch from `from` to `to`: extrinsics included
    /// on the abandoned branch are re-validated against the runtime at the
    /// new head and the still-valid ones return to the pool with their
    /// fresh validity. Invalid ones are dropped silently.
    pub fn handle_chain_reorg(&self, from: &Hash, to: &Hash) -> Result<(), Error> {
        let ancestor = self.block_state.highest_common_ancestor(from, to)?;
        if ancestor == *from {
            // `from` is part of the new chain: nothing was abandoned.
            return Ok(());
        }
        tracing::info!(target: "core", %from, %to, %ancestor, "chain reorg");

        let runtime = self.block_state.get_runtime(Some(to))?;
        let head_root = self.block_state.get_header(to)?.state_root;
        runtime.set_context_storage(self.storage_state.trie_state(Some(head_root))?);

        let mut current = *from;
        while current != ancestor {
            let header = self.block_state.get_header(&current)?;
            let body = self.block_state.get_block_body(&current)?;
            for extrinsic in body.iter() {
                match runtime.validate_transaction(extrinsic) {
                    Ok(validity) => {
                        self.transaction_pool
                            .lock()
                            .insert(ValidTransaction::new(extrinsic.clone(), validity));
                    }
                    Err(err) => tracing::debug!(
                        target: "core",
                        %err,
                        "dropping transaction from abandoned branch",
                    ),
                }
            }
            current = header.parent_hash;
        }
        Ok(())
    }

    /// Removes the extrinsics included in `block` from the pool, then
    /// re-validates everything left against the runtime at the new head,
    /// refreshing validities and evicting what no longer validates.
    pub fn maintain_transaction_pool(&self, block: &Block) -> Result<(), Error> {
        let mut pool = self.transaction_pool.lock();
        for extrinsic in block.body.iter() {
            pool.remove_extrinsic(extrinsic);
        }
        if pool.is_empty() {
            return Ok(());
        }

        let runtime = self.block_state.get_runtime(None)?;
        runtime.set_context_storage(self.storage_state.trie_state(None)?);
        for transaction in pool.pending() {
            match runtime.validate_transaction(&transaction.extrinsic) {
                Ok(validity) => {
                    pool.insert(ValidTransaction::new(transaction.extrinsic, validity));
                }
                Err(err) => {
                    tracing::debug!(target: "core", %err, "evicting transaction from pool");
                    pool.remove_extrinsic(&transaction.extrinsic);
                }
            }
        }
        Ok(())
    }

    /// Validates extrinsics relayed by a peer and pools the good ones.
    /// Returns whether the message is worth propagating further, i.e. at
    /// least one extrinsic was accepted. Peers relaying extrinsics with bad
    /// proofs are reported.
    pub fn handle_transaction_message(
        &self,
        from: &PeerId,
        message: &TransactionMessage,
    ) -> Result<bool, Error> {
        if !self.network.is_synced() {
            return Ok(false);
        }

        let runtime = self.block_state.get_runtime(None)?;
        runtime.set_context_storage(self.storage_state.trie_state(None)?);

        let mut propagate = false;
        for extrinsic in &message.extrinsics {
            match runtime.validate_transaction(extrinsic) {
                Ok(validity) => {
                    self.transaction_pool
                        .lock()
                        .insert(ValidTransaction::new(extrinsic.clone(), validity));
                    self.network.report_peer(from, rep::GOOD_TRANSACTION);
                    propagate = true;
                }
                Err(err) if err.is_bad_proof() => {
                    tracing::debug!(target: "core", %from, %err, "bad transaction from peer");
                    self.network.report_peer(from, rep::BAD_TRANSACTION);
                }
                Err(err) => {
                    tracing::debug!(target: "core", %from, %err, "unusable transaction");
                }
            }
        }
        Ok(propagate)
    }

    /// Validates a locally submitted extrinsic, pools it and relays it to
    /// the network.
    pub fn handle_submitted_extrinsic(&self, extrinsic: Extrinsic) -> Result<(), Error> {
        let runtime = self.block_state.get_runtime(None)?;
        runtime.set_context_storage(self.storage_state.trie_state(None)?);
        match runtime.validate_transaction(&extrinsic) {
            Ok(validity) => {
                self.transaction_pool
                    .lock()
                    .insert(ValidTransaction::new(extrinsic.clone(), validity));
                self.network.gossip_message(NetworkMessage::Transactions(TransactionMessage {
                    extrinsics: vec![extrinsic],
                }));
                Ok(())
            }
            Err(err) => {
                tracing::debug!(target: "core", %err, "submitted extrinsic rejected");
                Ok(())
            }
        }
    }

    /// Marks a block finalised and promotes any next-epoch announcements it
    /// carries onto the finalised chain. Promotion failures are logged:
    /// most finalised blocks simply carry no announcements.
    pub fn finalize_block(&self, hash: &Hash, round: u64, set_id: u64) -> Result<(), Error> {
        let header = self.block_state.get_header(hash)?;
        self.block_state.set_finalised_hash(hash, round, set_id)?;

        if let Err(err) = self.epoch_state.finalize_babe_next_epoch_data(&header) {
            tracing::warn!(target: "core", %err, block = %hash, "cannot promote next epoch data");
        }
        if let Err(err) = self.epoch_state.finalize_babe_next_config_data(&header) {
            tracing::warn!(target: "core", %err, block = %hash, "cannot promote next config data");
        }
        Ok(())
    }

    /// The version of the runtime at the given block (best block when
    /// `None`).
    pub fn runtime_version(&self, hash: Option<&Hash>) -> Result<RuntimeVersion, Error> {
        Ok(self.block_state.get_runtime(hash)?.version())
    }

    /// Routes a keypair into the named keystore namespace.
    pub fn insert_key(&self, name: &str, keypair: Keypair) -> Result<(), Error> {
        Ok(self.keystore.insert_key(name, keypair)?)
    }

    /// Whether the named keystore namespace holds the given public key.
    pub fn has_key(&self, public_key: &AuthorityId, name: &str) -> Result<bool, Error> {
        Ok(self.keystore.has_key(public_key, name)?)
    }
}
