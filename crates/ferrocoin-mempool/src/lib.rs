//! # Transaction memory pool
//!
//! An in-memory directed acyclic graph of unconfirmed transactions, indexed
//! by several orderings, with recursively maintained ancestor/descendant
//! aggregate statistics and size-based eviction.
//!
//! 1. Graph maintenance
//!     - Entries track their direct parents and children plus cached rollups
//!       over the transitive closures in both directions.
//!     - Every insertion, removal, block connection, reorg, prioritisation
//!       and expiry keeps the rollups exact.
//! 2. Fee management
//!     - Eviction picks the lowest-paying descendant package and raises a
//!       decaying rolling minimum fee floor.
//! 3. Auditing
//!     - A sampled consistency check re-derives every invariant against the
//!       caller's UTXO view.
//!
//! Script validation, chain state and fee estimation internals live outside
//! this crate and are reached through the traits in [`coins_view`],
//! [`fees`] and [`types`].

mod arena;
mod coins_view;
mod epoch;
mod error;
mod fees;
mod inner;
mod memusage;
mod options;
#[cfg(test)]
mod tests;
mod types;

pub use self::arena::{MemPoolArena, TxMemPoolEntry};
pub use self::coins_view::{
    Coin, CoinsView, CoinsViewCache, CoinsViewMemPool, COINBASE_MATURITY, MEMPOOL_HEIGHT,
};
pub use self::error::MempoolError;
pub use self::fees::FeeEstimator;
pub use self::inner::MemPoolInner;
pub use self::options::{MemPoolLimits, MemPoolOptions, MemPoolOptionsBuilder};
pub use self::types::{
    ChainOracle, EntryAddedCallback, EntryId, EntryRemovedCallback, FeeRate, LockPoints,
    RemovalReason, TxMempoolInfo,
};

use bitcoin::{OutPoint, Transaction, Txid};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Seconds since the Unix epoch.
fn current_time_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_secs() as i64
}

/// Thread-safe transaction memory pool.
///
/// A single mutex serialises every reading and mutating operation; the data
/// structure is not internally concurrent. Callers that need to combine pool
/// operations with UTXO-view operations atomically should take [`Self::lock`]
/// once and work through the inner handle.
pub struct MemPool {
    inner: Mutex<MemPoolInner>,
}

impl MemPool {
    /// Create a new mempool with default options.
    pub fn new() -> Self {
        Self::with_options(MemPoolOptions::default())
    }

    /// Create a new mempool with custom options.
    pub fn with_options(options: MemPoolOptions) -> Self {
        Self {
            inner: Mutex::new(MemPoolInner::new(options, current_time_secs())),
        }
    }

    /// Acquire the pool lock. All [`MemPoolInner`] operations are available
    /// through the guard; no operation suspends while holding it.
    pub fn lock(&self) -> MutexGuard<'_, MemPoolInner> {
        self.inner.lock()
    }

    /// Install the fee estimator.
    pub fn set_estimator(&self, estimator: Box<dyn FeeEstimator>) {
        self.inner.lock().set_estimator(estimator);
    }

    /// Install the entry-added subscriber.
    pub fn on_entry_added(&self, callback: EntryAddedCallback) {
        self.inner.lock().set_entry_added_callback(callback);
    }

    /// Install the entry-removed subscriber.
    pub fn on_entry_removed(&self, callback: EntryRemovedCallback) {
        self.inner.lock().set_entry_removed_callback(callback);
    }

    /// Set the consistency-check sampling ratio in [0, 1].
    pub fn set_check_ratio(&self, ratio: f64) {
        self.inner.lock().set_check_ratio(ratio);
    }

    /// Add an entry without checking anything. Used by acceptance logic
    /// which has already done all the appropriate checks.
    pub fn add_unchecked(&self, entry: TxMemPoolEntry, valid_fee_estimate: bool) {
        self.inner.lock().add_unchecked(entry, valid_fee_estimate);
    }

    /// Add an entry whose ancestor set the caller has already computed.
    pub fn add_unchecked_with_ancestors(
        &self,
        entry: TxMemPoolEntry,
        ancestors: Vec<EntryId>,
        valid_fee_estimate: bool,
    ) {
        self.inner
            .lock()
            .add_unchecked_with_ancestors(entry, ancestors, valid_fee_estimate);
    }

    /// Remove a transaction and all of its in-pool descendants.
    pub fn remove_recursive(&self, tx: &Transaction, reason: RemovalReason) {
        self.inner.lock().remove_recursive(tx, reason);
    }

    /// Remove the transactions confirmed by a connected block, plus their
    /// conflicts, and update the fee estimator.
    pub fn remove_for_block(&self, vtx: &[Arc<Transaction>], block_height: u32) {
        self.inner
            .lock()
            .remove_for_block(vtx, block_height, current_time_secs());
    }

    /// Remove transactions invalidated by a reorg.
    pub fn remove_for_reorg(
        &self,
        view: &dyn CoinsView,
        oracle: &dyn ChainOracle,
        mempool_height: u32,
        flags: i32,
    ) {
        self.inner
            .lock()
            .remove_for_reorg(view, oracle, mempool_height, flags);
    }

    /// Remove every transaction conflicting with `tx`, recursively.
    pub fn remove_conflicts(&self, tx: &Transaction) {
        self.inner.lock().remove_conflicts(tx);
    }

    /// Repair graph links and rollups after re-adding a disconnected
    /// block's transactions.
    pub fn update_transactions_from_block(&self, hashes_to_update: &[Txid]) {
        self.inner
            .lock()
            .update_transactions_from_block(hashes_to_update);
    }

    /// Apply a persistent fee delta to a transaction's priority.
    pub fn prioritise_transaction(&self, txid: &Txid, fee_delta: i64) {
        self.inner.lock().prioritise_transaction(txid, fee_delta);
    }

    /// The accumulated prioritisation delta for `txid`, in satoshis.
    pub fn apply_delta(&self, txid: &Txid) -> i64 {
        self.inner.lock().apply_delta(txid)
    }

    pub fn clear_prioritisation(&self, txid: &Txid) {
        self.inner.lock().clear_prioritisation(txid);
    }

    /// Remove everything that arrived before `cutoff`, with descendants.
    /// Returns the number of removed entries.
    pub fn expire(&self, cutoff: i64) -> usize {
        self.inner.lock().expire(cutoff)
    }

    /// Evict lowest-scoring packages until usage fits `sizelimit`.
    pub fn trim_to_size(
        &self,
        sizelimit: usize,
        no_spends_remaining: Option<&mut Vec<OutPoint>>,
    ) {
        self.inner.lock().trim_to_size(sizelimit, no_spends_remaining);
    }

    /// The current minimum acceptance feerate under `sizelimit`.
    pub fn get_min_fee(&self, sizelimit: usize) -> FeeRate {
        self.inner.lock().get_min_fee(sizelimit, current_time_secs())
    }

    /// All resident txids in depth-and-score order.
    pub fn query_hashes(&self) -> Vec<Txid> {
        self.inner.lock().query_hashes()
    }

    /// Summaries of all resident entries in depth-and-score order.
    pub fn info_all(&self) -> Vec<TxMempoolInfo> {
        self.inner.lock().info_all()
    }

    pub fn get(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.inner.lock().get(txid)
    }

    pub fn info(&self, txid: &Txid) -> Option<TxMempoolInfo> {
        self.inner.lock().info(txid)
    }

    pub fn get_iter(&self, txid: &Txid) -> Option<EntryId> {
        self.inner.lock().get_iter(txid)
    }

    /// The resident transaction spending `prevout`, if any.
    pub fn get_conflict_tx(&self, prevout: &OutPoint) -> Option<Arc<Transaction>> {
        self.inner.lock().get_conflict_tx(prevout)
    }

    /// Whether `outpoint` is spent by a resident transaction.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.inner.lock().is_spent(outpoint)
    }

    /// Whether no input of `tx` is an output of a resident transaction.
    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        self.inner.lock().has_no_inputs_of(tx)
    }

    /// Whether `a` sorts before `b` in depth-and-score order.
    pub fn compare_depth_and_score(&self, a: &Txid, b: &Txid) -> bool {
        self.inner.lock().compare_depth_and_score(a, b)
    }

    /// Estimated total heap usage of the pool.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.inner.lock().dynamic_memory_usage()
    }

    /// Number of resident transactions.
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    /// Monotonic count of pool mutations, for callers polling for change.
    pub fn transactions_updated(&self) -> u64 {
        self.inner.lock().transactions_updated()
    }

    pub fn add_transactions_updated(&self, n: u64) {
        self.inner.lock().add_transactions_updated(n);
    }

    /// Ancestor count and maximum descendant count for `txid`.
    pub fn get_transaction_ancestry(&self, txid: &Txid) -> Option<(u64, u64)> {
        self.inner.lock().get_transaction_ancestry(txid)
    }

    /// Drop every entry. Prioritisation deltas survive.
    pub fn clear(&self) {
        self.inner.lock().clear(current_time_secs());
    }

    /// Sampled consistency audit against `view`.
    pub fn check(&self, view: &dyn CoinsView) {
        self.inner.lock().check(view);
    }
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new()
    }
}
