//! Mempool graph state protected by the pool lock, and every algorithm that
//! mutates or audits it.
//!
//! All methods assume the caller holds the pool lock (they take `&self` or
//! `&mut self` on the inner state, which is only reachable through it).
//! Nothing here suspends; traversals mark visited entries through a scoped
//! [`EpochGuard`](crate::epoch::EpochGuard) instead of allocating sets.

use crate::arena::{MemPoolArena, TxMemPoolEntry};
use crate::coins_view::{CoinsView, CoinsViewCache, COINBASE_MATURITY};
use crate::epoch::{EpochGuard, EpochState};
use crate::error::MempoolError;
use crate::fees::FeeEstimator;
use crate::memusage;
use crate::options::{MemPoolLimits, MemPoolOptions};
use crate::types::{
    ChainOracle, EntryAddedCallback, EntryId, EntryRemovedCallback, FeeRate, LockPoints,
    RemovalReason, TxMempoolInfo,
};
use bitcoin::{OutPoint, Transaction, Txid, Wtxid};
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

const LOG_TARGET: &str = "mempool";

/// Base-layer size of the working cache used by the consistency audit.
const CHECK_CACHE_SIZE: u32 = 10_000;

/// Mempool graph state. One instance lives behind the [`crate::MemPool`]
/// lock; it is not internally concurrent.
pub struct MemPoolInner {
    pub(crate) arena: MemPoolArena,

    /// Every spent outpoint mapped to its in-pool spender, ordered by
    /// `(txid, vout)` so a range scan enumerates one transaction's spent
    /// outputs.
    pub(crate) map_next_tx: BTreeMap<OutPoint, EntryId>,

    /// Prioritisation deltas by txid. Outlives entry residency; cleared only
    /// when a transaction confirms or is removed for a conflict.
    map_deltas: HashMap<Txid, i64>,

    /// Witness hashes of all entries, in insertion order with O(1)
    /// swap-removal; each entry stores its index back into this vector.
    vtx_hashes: Vec<(Wtxid, EntryId)>,

    epoch: EpochState,

    options: MemPoolOptions,

    /// Audit sampling threshold over the u32 range; zero disables audits.
    check_frequency: u32,

    /// Sum of all resident virtual sizes.
    total_tx_size: u64,

    /// Heap usage of transaction bodies and edge sets, maintained
    /// incrementally and verified by the audit.
    cached_inner_usage: usize,

    transactions_updated: u64,

    rolling_minimum_feerate: f64,
    last_rolling_fee_update: i64,
    block_since_last_rolling_fee_bump: bool,

    estimator: Option<Box<dyn FeeEstimator>>,
    entry_added: Option<EntryAddedCallback>,
    entry_removed: Option<EntryRemovedCallback>,
}

impl MemPoolInner {
    pub fn new(options: MemPoolOptions, now: i64) -> Self {
        let check_frequency = (options.check_ratio.clamp(0.0, 1.0) * u32::MAX as f64) as u32;
        Self {
            arena: MemPoolArena::new(),
            map_next_tx: BTreeMap::new(),
            map_deltas: HashMap::new(),
            vtx_hashes: Vec::new(),
            epoch: EpochState::new(),
            options,
            check_frequency,
            total_tx_size: 0,
            cached_inner_usage: 0,
            transactions_updated: 0,
            rolling_minimum_feerate: 0.0,
            last_rolling_fee_update: now,
            block_since_last_rolling_fee_bump: false,
            estimator: None,
            entry_added: None,
            entry_removed: None,
        }
    }

    pub fn options(&self) -> &MemPoolOptions {
        &self.options
    }

    /// Install the fee estimator slot.
    pub fn set_estimator(&mut self, estimator: Box<dyn FeeEstimator>) {
        self.estimator = Some(estimator);
    }

    /// Install the entry-added subscriber. The callback must not re-enter
    /// the pool.
    pub fn set_entry_added_callback(&mut self, callback: EntryAddedCallback) {
        self.entry_added = Some(callback);
    }

    /// Install the entry-removed subscriber. The callback must not re-enter
    /// the pool.
    pub fn set_entry_removed_callback(&mut self, callback: EntryRemovedCallback) {
        self.entry_removed = Some(callback);
    }

    /// Set the audit sampling ratio in [0, 1].
    pub fn set_check_ratio(&mut self, ratio: f64) {
        self.check_frequency = (ratio.clamp(0.0, 1.0) * u32::MAX as f64) as u32;
    }

    // === Insertion ===

    /// Add an entry whose transitive in-pool ancestors have already been
    /// computed. Performs no policy checks; the caller has done them all.
    pub fn add_unchecked_with_ancestors(
        &mut self,
        entry: TxMemPoolEntry,
        ancestors: Vec<EntryId>,
        valid_fee_estimate: bool,
    ) {
        if let Some(callback) = &self.entry_added {
            callback(entry.tx());
        }

        let tx = entry.tx().clone();
        let txid = entry.txid();
        let wtxid = entry.wtxid();
        self.cached_inner_usage += entry.dynamic_memory_usage();
        self.total_tx_size += entry.tx_size() as u64;
        let id = self.arena.insert(entry);

        // Apply any delta persisted by an earlier prioritise_transaction.
        if let Some(&delta) = self.map_deltas.get(&txid) {
            if delta != 0 {
                self.arena.update_fee_delta(id, delta);
            }
        }

        {
            let guard = self.epoch.guard();
            for input in &tx.input {
                self.map_next_tx.insert(input.previous_output, id);
                if let Some(parent_id) = self.arena.get_by_txid(&input.previous_output.txid) {
                    // Multiple inputs may spend the same parent; the mark
                    // dedupes the edge.
                    if !guard.already_touched(&self.arena.entry(parent_id).epoch)
                        && self.arena.add_parent(id, parent_id)
                    {
                        self.cached_inner_usage += memusage::node_usage::<EntryId>();
                    }
                }
            }
        }

        // A newly arriving transaction cannot have in-pool children (they
        // would have been orphans), with one exception: a transaction
        // re-entering after a block disconnect. That path runs
        // update_transactions_from_block afterwards to repair the links.
        self.update_ancestors_of(true, id, &ancestors);
        self.update_entry_for_ancestors(id, &ancestors);

        self.transactions_updated += 1;
        if let Some(mut estimator) = self.estimator.take() {
            estimator.process_transaction(self.arena.entry(id), valid_fee_estimate);
            self.estimator = Some(estimator);
        }

        self.vtx_hashes.push((wtxid, id));
        self.arena.set_vtx_hashes_idx(id, self.vtx_hashes.len() - 1);
    }

    /// Add an entry, computing its ancestors limit-free first.
    pub fn add_unchecked(&mut self, entry: TxMemPoolEntry, valid_fee_estimate: bool) {
        let ancestors = self
            .calculate_mem_pool_ancestors(&entry, &MemPoolLimits::unbounded(), true)
            .expect("unbounded limits cannot be exceeded");
        self.add_unchecked_with_ancestors(entry, ancestors, valid_fee_estimate);
    }

    // === Removal ===

    /// Unlink and delete one entry. The caller must already have updated the
    /// ancestor/descendant rollups via `update_for_remove_from_mempool`.
    fn remove_unchecked(&mut self, id: EntryId, reason: RemovalReason) {
        if let Some(callback) = &self.entry_removed {
            callback(self.arena.entry(id).tx(), reason);
        }

        let entry = self.arena.remove(id).expect("staged entry is resident");
        for input in entry.tx().input.iter() {
            self.map_next_tx.remove(&input.previous_output);
        }

        if self.vtx_hashes.len() > 1 {
            let idx = entry.vtx_hashes_idx;
            self.vtx_hashes.swap_remove(idx);
            if idx < self.vtx_hashes.len() {
                let moved = self.vtx_hashes[idx].1;
                self.arena.set_vtx_hashes_idx(moved, idx);
            }
            if self.vtx_hashes.len() * 2 < self.vtx_hashes.capacity() {
                self.vtx_hashes.shrink_to_fit();
            }
        } else {
            self.vtx_hashes.clear();
        }

        self.total_tx_size -= entry.tx_size() as u64;
        self.cached_inner_usage -= entry.dynamic_memory_usage();
        self.cached_inner_usage -=
            memusage::node_usage::<EntryId>() * (entry.parents.len() + entry.children.len());
        self.transactions_updated += 1;
        if let Some(estimator) = self.estimator.as_mut() {
            estimator.remove_tx(&entry.txid(), false);
        }
    }

    /// Remove a closed set of entries, updating all surviving rollups first.
    ///
    /// `update_descendants` should be true whenever the stage is not already
    /// descendant-closed, e.g. when transactions are confirmed in a block.
    pub fn remove_staged(
        &mut self,
        stage: Vec<EntryId>,
        update_descendants: bool,
        reason: RemovalReason,
    ) {
        self.update_for_remove_from_mempool(&stage, update_descendants);
        for id in stage {
            self.remove_unchecked(id, reason);
        }
    }

    fn update_for_remove_from_mempool(&mut self, stage: &[EntryId], update_descendants: bool) {
        if update_descendants {
            // Only statistics are updated here, not the edge sets, which
            // must be preserved until every staged entry has walked them.
            for &remove_id in stage {
                let mut descendants = Vec::new();
                {
                    let guard = self.epoch.guard();
                    self.calculate_descendants_vec(&guard, remove_id, &mut descendants);
                }
                let (size, fees, sigops) = {
                    let entry = self.arena.entry(remove_id);
                    (-entry.tx_size(), -entry.modified_fee(), -entry.sigop_cost())
                };
                for descendant in descendants {
                    self.arena
                        .update_ancestor_state(descendant, size, fees, -1, sigops);
                }
            }
        }
        for &remove_id in stage {
            // The stored parent edges are authoritative here: mid-reorg the
            // graph may be missing child links for re-added block
            // transactions, and the stored edges are exactly the set whose
            // packages include this entry.
            let ancestors = self
                .calculate_mem_pool_ancestors(
                    self.arena.entry(remove_id),
                    &MemPoolLimits::unbounded(),
                    false,
                )
                .expect("unbounded limits cannot be exceeded");
            self.update_ancestors_of(false, remove_id, &ancestors);
        }
        // With all rollups updated, sever the links from each removed entry
        // to its surviving children.
        for &remove_id in stage {
            self.update_children_for_removal(remove_id);
        }
    }

    /// Remove a transaction and its descendant closure. If the transaction
    /// itself is absent, its in-pool children are the seeds; this happens
    /// during reorgs when it was not re-accepted.
    pub fn remove_recursive(&mut self, tx: &Transaction, reason: RemovalReason) {
        let mut to_remove: Vec<EntryId> = Vec::new();
        {
            let guard = self.epoch.guard();
            let txid = tx.compute_txid();
            if let Some(id) = self.arena.get_by_txid(&txid) {
                to_remove.push(id);
                guard.already_touched(&self.arena.entry(id).epoch);
            } else {
                for vout in 0..tx.output.len() as u32 {
                    let Some(&spender) = self.map_next_tx.get(&OutPoint::new(txid, vout)) else {
                        continue;
                    };
                    if guard.already_touched(&self.arena.entry(spender).epoch) {
                        continue;
                    }
                    to_remove.push(spender);
                }
            }
            // Seeds are all marked, so the expansion cannot duplicate them.
            let max_idx = to_remove.len();
            for idx in 0..max_idx {
                let id = to_remove[idx];
                self.calculate_descendants_vec(&guard, id, &mut to_remove);
            }
        }
        self.remove_staged(to_remove, false, reason);
    }

    /// Remove every transaction spending an outpoint that `tx` spends,
    /// recursively.
    pub fn remove_conflicts(&mut self, tx: &Transaction) {
        let txid = tx.compute_txid();
        for input in &tx.input {
            let Some(&conflict_id) = self.map_next_tx.get(&input.previous_output) else {
                continue;
            };
            let conflict_tx = self.arena.entry(conflict_id).tx().clone();
            let conflict_txid = self.arena.entry(conflict_id).txid();
            if conflict_txid != txid {
                self.clear_prioritisation(&conflict_txid);
                self.remove_recursive(&conflict_tx, RemovalReason::Conflict);
            }
        }
    }

    /// Called when a block is connected: removes the confirmed transactions
    /// and their conflicts, and updates the fee estimator.
    pub fn remove_for_block(&mut self, vtx: &[Arc<Transaction>], block_height: u32, now: i64) {
        if self.estimator.is_some() {
            // The estimator sees the entries before they are removed.
            let ids: Vec<EntryId> = vtx
                .iter()
                .filter_map(|tx| self.arena.get_by_txid(&tx.compute_txid()))
                .collect();
            let mut estimator = self.estimator.take().expect("estimator probed above");
            {
                let entries: Vec<&TxMemPoolEntry> =
                    ids.iter().map(|&id| self.arena.entry(id)).collect();
                estimator.process_block(block_height, &entries);
            }
            self.estimator = Some(estimator);
        }
        for tx in vtx {
            let txid = tx.compute_txid();
            if let Some(id) = self.arena.get_by_txid(&txid) {
                self.remove_staged(vec![id], true, RemovalReason::Block);
            }
            self.remove_conflicts(tx);
            self.clear_prioritisation(&txid);
        }
        self.last_rolling_fee_update = now;
        self.block_since_last_rolling_fee_bump = true;
    }

    /// Remove transactions no longer valid after a reorg: non-final ones,
    /// failed sequence locks, and spends of now-immature or missing
    /// coinbases. Stale lock points of surviving entries are refreshed in
    /// place.
    pub fn remove_for_reorg(
        &mut self,
        view: &dyn CoinsView,
        oracle: &dyn ChainOracle,
        mempool_height: u32,
        flags: i32,
    ) {
        let mut to_remove: Vec<EntryId> = Vec::new();
        let mut lock_point_updates: Vec<(EntryId, LockPoints)> = Vec::new();
        for (id, entry) in self.arena.iter() {
            let tx = entry.tx();
            let mut lock_points = entry.lock_points().clone();
            let valid_lp = oracle.test_lock_point_validity(&lock_points);
            if !oracle.check_final_tx(tx, flags)
                || !oracle.check_sequence_locks(tx, flags, &mut lock_points, valid_lp)
            {
                // A failed sequence-lock evaluation may leave the lock
                // points invalid, so the entry goes regardless of them.
                to_remove.push(id);
            } else if entry.spends_coinbase() {
                for input in &tx.input {
                    if self.arena.get_by_txid(&input.previous_output.txid).is_some() {
                        continue;
                    }
                    let coin = view.get_coin(&input.previous_output);
                    if self.check_frequency != 0 {
                        assert!(coin.is_some());
                    }
                    match coin {
                        None => {
                            to_remove.push(id);
                            break;
                        }
                        Some(coin)
                            if coin.is_coinbase
                                && (mempool_height as i64 - coin.height as i64)
                                    < COINBASE_MATURITY as i64 =>
                        {
                            to_remove.push(id);
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
            if !valid_lp {
                lock_point_updates.push((id, lock_points));
            }
        }
        for (id, lock_points) in lock_point_updates {
            self.arena.update_lock_points(id, lock_points);
        }

        {
            let guard = self.epoch.guard();
            // Mark all seeds first so the expansion cannot duplicate them.
            for &id in &to_remove {
                guard.already_touched(&self.arena.entry(id).epoch);
            }
            let max_idx = to_remove.len();
            for idx in 0..max_idx {
                let id = to_remove[idx];
                self.calculate_descendants_vec(&guard, id, &mut to_remove);
            }
        }
        self.remove_staged(to_remove, false, RemovalReason::Reorg);
    }

    // === Traversals ===

    /// Compute the transitive in-pool ancestor closure of `entry`, enforcing
    /// the four package limits.
    ///
    /// With `search_for_parents` the seeds come from the entry's inputs
    /// (valid for a transaction not yet in the pool); without it, from the
    /// stored parent edges, which requires residency and is authoritative
    /// mid-reorg.
    pub fn calculate_mem_pool_ancestors(
        &self,
        entry: &TxMemPoolEntry,
        limits: &MemPoolLimits,
        search_for_parents: bool,
    ) -> Result<Vec<EntryId>, MempoolError> {
        let guard = self.epoch.guard();
        let mut ancestors: Vec<EntryId> = Vec::new();

        if search_for_parents {
            for input in &entry.tx().input {
                let Some(parent_id) = self.arena.get_by_txid(&input.previous_output.txid) else {
                    continue;
                };
                if guard.already_touched(&self.arena.entry(parent_id).epoch) {
                    continue;
                }
                ancestors.push(parent_id);
                if ancestors.len() as u64 + 1 > limits.max_ancestors {
                    return Err(MempoolError::TooManyParents {
                        limit: limits.max_ancestors,
                    });
                }
            }
        } else {
            let id = self
                .arena
                .get_by_txid(&entry.txid())
                .expect("entry must be resident when not searching for parents");
            let parent_set = &self.arena.entry(id).parents;
            ancestors.reserve(parent_set.len());
            for &parent_id in parent_set {
                ancestors.push(parent_id);
                // Touch before walking so the walk cannot re-add it.
                guard.already_touched(&self.arena.entry(parent_id).epoch);
            }
        }

        let mut total_size_with_ancestors = entry.tx_size();
        let mut next_idx = 0;
        while next_idx < ancestors.len() {
            let stage_id = ancestors[next_idx];
            next_idx += 1;
            let stage = self.arena.entry(stage_id);
            total_size_with_ancestors += stage.tx_size();

            if (stage.size_with_descendants() + entry.tx_size()) as u64
                > limits.max_descendant_size
            {
                return Err(MempoolError::ExceedsDescendantSize {
                    txid: stage.txid(),
                    limit: limits.max_descendant_size,
                });
            } else if stage.count_with_descendants() + 1 > limits.max_descendants {
                return Err(MempoolError::TooManyDescendants {
                    txid: stage.txid(),
                    limit: limits.max_descendants,
                });
            } else if total_size_with_ancestors as u64 > limits.max_ancestor_size {
                return Err(MempoolError::ExceedsAncestorSize {
                    limit: limits.max_ancestor_size,
                });
            }

            for &parent_id in &stage.parents {
                if guard.already_touched(&self.arena.entry(parent_id).epoch) {
                    continue;
                }
                ancestors.push(parent_id);
                if ancestors.len() as u64 + 1 > limits.max_ancestors {
                    return Err(MempoolError::TooManyAncestors {
                        limit: limits.max_ancestors,
                    });
                }
            }
        }
        Ok(ancestors)
    }

    /// Append the not-yet-visited descendants of `id` to `descendants` and
    /// walk them to closure. `id` itself is never appended. The caller holds
    /// the guard and has marked any entries the walk must not re-add.
    pub(crate) fn calculate_descendants_vec(
        &self,
        guard: &EpochGuard<'_>,
        id: EntryId,
        descendants: &mut Vec<EntryId>,
    ) {
        let mut current = id;
        let mut idx = descendants.len();
        loop {
            for &child in &self.arena.entry(current).children {
                if guard.already_touched(&self.arena.entry(child).epoch) {
                    continue;
                }
                descendants.push(child);
            }
            if idx == descendants.len() {
                break;
            }
            current = descendants[idx];
            idx += 1;
        }
    }

    // === Edge and rollup maintenance ===

    /// Add or remove `id` as a child of each of its direct parents, and add
    /// or subtract its contribution from every ancestor's descendant rollup.
    fn update_ancestors_of(&mut self, add: bool, id: EntryId, ancestors: &[EntryId]) {
        let parents: Vec<EntryId> = self.arena.entry(id).parents.iter().copied().collect();
        for parent in parents {
            let changed = if add {
                self.arena.add_child(parent, id)
            } else {
                self.arena.remove_child(parent, id)
            };
            if changed {
                let usage = memusage::node_usage::<EntryId>();
                if add {
                    self.cached_inner_usage += usage;
                } else {
                    self.cached_inner_usage -= usage;
                }
            }
        }
        let count: i64 = if add { 1 } else { -1 };
        let (size, fees) = {
            let entry = self.arena.entry(id);
            (count * entry.tx_size(), count * entry.modified_fee())
        };
        for &ancestor in ancestors {
            self.arena.update_descendant_state(ancestor, size, fees, count);
        }
    }

    /// Initialize the new entry's ancestor rollup from its ancestor set.
    fn update_entry_for_ancestors(&mut self, id: EntryId, ancestors: &[EntryId]) {
        let mut size = 0i64;
        let mut fees = 0i64;
        let mut sigops = 0i64;
        for &ancestor in ancestors {
            let entry = self.arena.entry(ancestor);
            size += entry.tx_size();
            fees += entry.modified_fee();
            sigops += entry.sigop_cost();
        }
        self.arena
            .update_ancestor_state(id, size, fees, ancestors.len() as i64, sigops);
    }

    /// Sever the parent link that each direct child keeps to `id`.
    fn update_children_for_removal(&mut self, id: EntryId) {
        let children: Vec<EntryId> = self.arena.entry(id).children.iter().copied().collect();
        for child in children {
            if self.arena.remove_parent(child, id) {
                self.cached_inner_usage -= memusage::node_usage::<EntryId>();
            }
        }
    }

    // === Reorg repair ===

    /// For each hash of a disconnected block that has been re-added to the
    /// pool, discover its in-pool descendants that are outside the re-added
    /// set, fold their fee/size into the entry's descendant rollup, and fold
    /// the entry into each such descendant's ancestor rollup.
    ///
    /// Iterates in reverse so that when a transaction is processed, all of
    /// its in-pool descendants have been processed already; this maximizes
    /// the benefit of the descendant cache and guarantees the child edge
    /// sets are complete, which `update_for_descendants` assumes.
    pub fn update_transactions_from_block(&mut self, hashes_to_update: &[Txid]) {
        let mut descendants_cache: HashMap<EntryId, Vec<EntryId>> = HashMap::new();
        let already_included: HashSet<Txid> = hashes_to_update.iter().copied().collect();

        for hash in hashes_to_update.iter().rev() {
            let Some(id) = self.arena.get_by_txid(hash) else {
                continue;
            };
            {
                let guard = self.epoch.guard();
                // Children discovered through map_next_tx; link both
                // directions unless the child is itself in the re-added set
                // (those are already accounted for in their ancestors).
                let children: Vec<(Txid, EntryId)> = self
                    .map_next_tx
                    .range(OutPoint::new(*hash, 0)..)
                    .take_while(|(outpoint, _)| outpoint.txid == *hash)
                    .map(|(_, &child_id)| (self.arena.entry(child_id).txid(), child_id))
                    .collect();
                for (child_hash, child_id) in children {
                    if !guard.already_touched(&self.arena.entry(child_id).epoch)
                        && !already_included.contains(&child_hash)
                    {
                        if self.arena.add_child(id, child_id) {
                            self.cached_inner_usage += memusage::node_usage::<EntryId>();
                        }
                        if self.arena.add_parent(child_id, id) {
                            self.cached_inner_usage += memusage::node_usage::<EntryId>();
                        }
                    }
                }
            }
            self.update_for_descendants(id, &mut descendants_cache, &already_included);
        }
    }

    /// Fold the descendants of `update_id` that are outside `exclude` into
    /// its descendant rollup, and `update_id` into their ancestor rollups.
    /// Assumes the child edge sets of `update_id` and all descendants are
    /// complete.
    fn update_for_descendants(
        &mut self,
        update_id: EntryId,
        cache: &mut HashMap<EntryId, Vec<EntryId>>,
        exclude: &HashSet<Txid>,
    ) {
        let guard = self.epoch.guard();
        let mut modify_size = 0i64;
        let mut modify_fees = 0i64;
        let mut modify_count = 0i64;
        let (update_size, update_fees, update_sigops) = {
            let entry = self.arena.entry(update_id);
            (entry.tx_size(), entry.modified_fee(), entry.sigop_cost())
        };

        let direct_children: Vec<EntryId> =
            self.arena.entry(update_id).children.iter().copied().collect();
        let mut update_cache: Vec<EntryId> = Vec::with_capacity(direct_children.len());
        for child in direct_children {
            update_cache.push(child);
            guard.already_touched(&self.arena.entry(child).epoch);
        }

        let mut already_traversed = 0usize;
        while already_traversed < update_cache.len() {
            // Rotate the back entry to the front, or drop it if excluded.
            let child_id = *update_cache.last().expect("loop condition");
            let child_txid = self.arena.entry(child_id).txid();
            if exclude.contains(&child_txid) {
                update_cache.pop();
            } else {
                let last = update_cache.len() - 1;
                update_cache.swap(already_traversed, last);
                already_traversed += 1;
                let (child_size, child_fees) = {
                    let child = self.arena.entry(child_id);
                    (child.tx_size(), child.modified_fee())
                };
                modify_size += child_size;
                modify_fees += child_fees;
                modify_count += 1;
                self.arena.update_ancestor_state(
                    child_id,
                    update_size,
                    update_fees,
                    1,
                    update_sigops,
                );
            }

            // N.B. grandchildren may also be direct children.
            let grand_children: Vec<EntryId> =
                self.arena.entry(child_id).children.iter().copied().collect();
            for grand_child in grand_children {
                if guard.already_touched(&self.arena.entry(grand_child).epoch) {
                    continue;
                }
                if let Some(cached) = cache.get(&grand_child) {
                    // No exclusion check needed: cached sets never contain
                    // excluded entries.
                    let cached: Vec<EntryId> = cached.clone();
                    for great_grand_child in cached {
                        if guard.already_touched(&self.arena.entry(great_grand_child).epoch) {
                            continue;
                        }
                        // Place on the back, then swap into the traversed
                        // region so the loop does not walk it again.
                        update_cache.push(great_grand_child);
                        let last = update_cache.len() - 1;
                        update_cache.swap(already_traversed, last);
                        already_traversed += 1;
                    }
                } else {
                    update_cache.push(grand_child);
                }
            }
        }

        if !update_cache.is_empty() {
            cache.insert(update_id, update_cache);
        }
        self.arena
            .update_descendant_state(update_id, modify_size, modify_fees, modify_count);
    }

    // === Prioritisation ===

    /// Apply a fee delta to a transaction's priority, persisting it across
    /// residency and propagating it through all affected rollups.
    pub fn prioritise_transaction(&mut self, txid: &Txid, fee_delta: i64) {
        let accumulated = {
            let delta = self.map_deltas.entry(*txid).or_insert(0);
            *delta += fee_delta;
            *delta
        };
        if let Some(id) = self.arena.get_by_txid(txid) {
            self.arena.update_fee_delta(id, accumulated);
            let ancestors = self
                .calculate_mem_pool_ancestors(
                    self.arena.entry(id),
                    &MemPoolLimits::unbounded(),
                    false,
                )
                .expect("unbounded limits cannot be exceeded");
            for ancestor in ancestors {
                self.arena.update_descendant_state(ancestor, 0, fee_delta, 0);
            }
            let mut descendants = Vec::new();
            {
                let guard = self.epoch.guard();
                self.calculate_descendants_vec(&guard, id, &mut descendants);
            }
            for descendant in descendants {
                self.arena.update_ancestor_state(descendant, 0, fee_delta, 0, 0);
            }
            self.transactions_updated += 1;
        }
        tracing::info!(target: LOG_TARGET, "Prioritised transaction {txid}: fee delta += {fee_delta} sat");
    }

    /// The accumulated prioritisation delta for `txid`, in satoshis.
    pub fn apply_delta(&self, txid: &Txid) -> i64 {
        self.map_deltas.get(txid).copied().unwrap_or(0)
    }

    pub fn clear_prioritisation(&mut self, txid: &Txid) {
        self.map_deltas.remove(txid);
    }

    // === Eviction, expiry, rolling fee ===

    /// Evict lowest-descendant-score packages until dynamic memory usage is
    /// within `sizelimit`. Outpoints spent by evicted packages that no
    /// remaining entry spends are appended to `no_spends_remaining` for the
    /// caller to prune from its UTXO cache.
    pub fn trim_to_size(
        &mut self,
        sizelimit: usize,
        mut no_spends_remaining: Option<&mut Vec<OutPoint>>,
    ) {
        let mut txn_removed = 0usize;
        let mut max_feerate_removed = FeeRate::ZERO;
        while !self.arena.is_empty() && self.dynamic_memory_usage() > sizelimit {
            let (worst_id, removed_rate) = {
                let (id, entry) = self
                    .arena
                    .iter_by_descendant_score()
                    .next()
                    .expect("arena is non-empty");
                // The new minimum is the evicted package's rate plus the
                // incremental relay fee, so nothing re-enters at a rate equal
                // to what was just evicted with no block in between.
                let rate = FeeRate::from_fee_and_vsize(
                    entry.mod_fees_with_descendants(),
                    entry.size_with_descendants(),
                )
                .saturating_add(self.options.incremental_relay_feerate);
                (id, rate)
            };
            self.track_package_removed(removed_rate);
            max_feerate_removed = max_feerate_removed.max(removed_rate);

            let mut stage = Vec::new();
            {
                let guard = self.epoch.guard();
                self.calculate_descendants_vec(&guard, worst_id, &mut stage);
            }
            // The seed goes last so its edges are still present while its
            // descendants update their rollups.
            stage.push(worst_id);
            txn_removed += stage.len();

            let removed_txs: Vec<Arc<Transaction>> = if no_spends_remaining.is_some() {
                stage.iter().map(|&id| self.arena.entry(id).tx().clone()).collect()
            } else {
                Vec::new()
            };
            self.remove_staged(stage, false, RemovalReason::SizeLimit);
            if let Some(out) = no_spends_remaining.as_mut() {
                for tx in &removed_txs {
                    for input in &tx.input {
                        if self.arena.get_by_txid(&input.previous_output.txid).is_some() {
                            continue;
                        }
                        out.push(input.previous_output);
                    }
                }
            }
        }
        if max_feerate_removed > FeeRate::ZERO {
            tracing::debug!(
                target: LOG_TARGET,
                "Removed {txn_removed} txn, rolling minimum fee bumped to {max_feerate_removed}"
            );
        }
    }

    /// Raise the rolling minimum fee floor to `rate` if higher.
    fn track_package_removed(&mut self, rate: FeeRate) {
        if rate.to_sat_per_kvb() as f64 > self.rolling_minimum_feerate {
            self.rolling_minimum_feerate = rate.to_sat_per_kvb() as f64;
            self.block_since_last_rolling_fee_bump = false;
        }
    }

    /// The current minimum feerate for acceptance: the rolling fee floor,
    /// decayed exponentially since the last block, faster when the pool is
    /// far below `sizelimit`.
    pub fn get_min_fee(&mut self, sizelimit: usize, now: i64) -> FeeRate {
        if !self.block_since_last_rolling_fee_bump || self.rolling_minimum_feerate == 0.0 {
            return FeeRate::from_sat_per_kvb(self.rolling_minimum_feerate.round() as u64);
        }
        if now > self.last_rolling_fee_update + 10 {
            let mut halflife = self.options.rolling_fee_halflife as f64;
            let usage = self.dynamic_memory_usage();
            if usage < sizelimit / 4 {
                halflife /= 4.0;
            } else if usage < sizelimit / 2 {
                halflife /= 2.0;
            }

            self.rolling_minimum_feerate /=
                2f64.powf((now - self.last_rolling_fee_update) as f64 / halflife);
            self.last_rolling_fee_update = now;

            if self.rolling_minimum_feerate
                < self.options.incremental_relay_feerate.to_sat_per_kvb() as f64 / 2.0
            {
                self.rolling_minimum_feerate = 0.0;
                return FeeRate::ZERO;
            }
        }
        FeeRate::from_sat_per_kvb(self.rolling_minimum_feerate.round() as u64)
            .max(self.options.incremental_relay_feerate)
    }

    /// Remove every transaction that arrived before `cutoff`, along with its
    /// descendants. Returns the number of removed entries.
    pub fn expire(&mut self, cutoff: i64) -> usize {
        let mut to_remove: Vec<EntryId> = Vec::new();
        {
            let guard = self.epoch.guard();
            for (id, entry) in self.arena.iter_by_entry_time() {
                if entry.time() >= cutoff {
                    break;
                }
                if !guard.already_touched(&entry.epoch) {
                    to_remove.push(id);
                }
            }
            let mut idx = 0;
            while idx < to_remove.len() {
                let id = to_remove[idx];
                self.calculate_descendants_vec(&guard, id, &mut to_remove);
                idx += 1;
            }
        }
        let removed = to_remove.len();
        self.remove_staged(to_remove, false, RemovalReason::Expiry);
        removed
    }

    // === Queries ===

    /// Whether `a` sorts before `b` in depth-and-score order. Absent
    /// transactions sort last.
    pub fn compare_depth_and_score(&self, a: &Txid, b: &Txid) -> bool {
        let Some(id_a) = self.arena.get_by_txid(a) else {
            return false;
        };
        let Some(id_b) = self.arena.get_by_txid(b) else {
            return true;
        };
        self.depth_and_score_cmp(id_a, id_b) == Ordering::Less
    }

    /// Canonical output ordering: fewer unconfirmed ancestors first (no
    /// unmet dependencies), then higher score, then descending txid.
    fn depth_and_score_cmp(&self, a: EntryId, b: EntryId) -> Ordering {
        let entry_a = self.arena.entry(a);
        let entry_b = self.arena.entry(b);
        entry_a
            .count_with_ancestors()
            .cmp(&entry_b.count_with_ancestors())
            .then_with(|| {
                let f1 = entry_a.modified_fee() as i128 * entry_b.tx_size() as i128;
                let f2 = entry_b.modified_fee() as i128 * entry_a.tx_size() as i128;
                f2.cmp(&f1).then_with(|| entry_b.txid().cmp(&entry_a.txid()))
            })
    }

    fn sorted_depth_and_score(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.arena.iter().map(|(id, _)| id).collect();
        ids.sort_by(|&a, &b| self.depth_and_score_cmp(a, b));
        ids
    }

    /// All resident txids in depth-and-score order.
    pub fn query_hashes(&self) -> Vec<Txid> {
        self.sorted_depth_and_score()
            .into_iter()
            .map(|id| self.arena.entry(id).txid())
            .collect()
    }

    /// Summaries of all resident entries in depth-and-score order.
    pub fn info_all(&self) -> Vec<TxMempoolInfo> {
        self.sorted_depth_and_score()
            .into_iter()
            .map(|id| self.entry_info(id))
            .collect()
    }

    /// Iterate resident entries in mining order: highest ancestor score
    /// first.
    pub fn iter_by_ancestor_score(&self) -> impl Iterator<Item = &TxMemPoolEntry> {
        self.arena.iter_by_ancestor_score().map(|(_, entry)| entry)
    }

    /// Iterate resident entries by their own modified feerate, highest
    /// first.
    pub fn iter_by_score(&self) -> impl Iterator<Item = &TxMemPoolEntry> {
        self.arena.iter_by_score().map(|(_, entry)| entry)
    }

    /// Iterate resident entries by eviction order: lowest descendant score
    /// first.
    pub fn iter_by_descendant_score(&self) -> impl Iterator<Item = &TxMemPoolEntry> {
        self.arena.iter_by_descendant_score().map(|(_, entry)| entry)
    }

    fn entry_info(&self, id: EntryId) -> TxMempoolInfo {
        let entry = self.arena.entry(id);
        TxMempoolInfo {
            tx: entry.tx().clone(),
            time: entry.time(),
            fee: entry.fee(),
            vsize: entry.tx_size(),
            fee_delta: entry.fee_delta(),
        }
    }

    pub fn get(&self, txid: &Txid) -> Option<Arc<Transaction>> {
        self.arena
            .get_by_txid(txid)
            .map(|id| self.arena.entry(id).tx().clone())
    }

    pub fn get_entry(&self, txid: &Txid) -> Option<&TxMemPoolEntry> {
        self.arena.get_by_txid(txid).map(|id| self.arena.entry(id))
    }

    pub fn info(&self, txid: &Txid) -> Option<TxMempoolInfo> {
        self.arena.get_by_txid(txid).map(|id| self.entry_info(id))
    }

    pub fn get_iter(&self, txid: &Txid) -> Option<EntryId> {
        self.arena.get_by_txid(txid)
    }

    /// The resident transaction spending `prevout`, if any.
    pub fn get_conflict_tx(&self, prevout: &OutPoint) -> Option<Arc<Transaction>> {
        self.map_next_tx
            .get(prevout)
            .map(|&id| self.arena.entry(id).tx().clone())
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.map_next_tx.contains_key(outpoint)
    }

    /// Whether no input of `tx` is an output of a resident transaction.
    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        tx.input
            .iter()
            .all(|input| self.arena.get_by_txid(&input.previous_output.txid).is_none())
    }

    pub fn size(&self) -> usize {
        self.arena.len()
    }

    /// Sum of all resident virtual sizes.
    pub fn total_tx_size(&self) -> u64 {
        self.total_tx_size
    }

    pub fn transactions_updated(&self) -> u64 {
        self.transactions_updated
    }

    pub fn add_transactions_updated(&mut self, n: u64) {
        self.transactions_updated += n;
    }

    /// Estimated total heap usage of the pool. The arena's per-entry
    /// overhead has no exact formula, so it is approximated as the entry
    /// plus a dozen pointers of index bookkeeping.
    pub fn dynamic_memory_usage(&self) -> usize {
        memusage::malloc_usage(
            std::mem::size_of::<TxMemPoolEntry>() + 12 * std::mem::size_of::<usize>(),
        ) * self.arena.len()
            + memusage::node_usage::<(OutPoint, EntryId)>() * self.map_next_tx.len()
            + memusage::node_usage::<(Txid, i64)>() * self.map_deltas.len()
            + memusage::vec_usage::<(Wtxid, EntryId)>(self.vtx_hashes.capacity())
            + self.cached_inner_usage
    }

    /// Ancestor count and maximum descendant count for `txid`.
    ///
    /// The descendant figure is the maximum `count_with_descendants` over
    /// any chain of ancestors; with diamond ancestry it is an upper bound on
    /// the true descendant count, not an exact value.
    pub fn get_transaction_ancestry(&self, txid: &Txid) -> Option<(u64, u64)> {
        let id = self.arena.get_by_txid(txid)?;
        Some((
            self.arena.entry(id).count_with_ancestors(),
            self.calculate_descendant_maximum(id),
        ))
    }

    /// Walk up the ancestor graph looking for the root with the highest
    /// descendant count. Allocation-free along single-parent chains; only
    /// branch points spill onto a candidate stack.
    fn calculate_descendant_maximum(&self, id: EntryId) -> u64 {
        let guard = self.epoch.guard();
        let mut candidates: Vec<EntryId> = Vec::new();
        let mut maximum = 0u64;
        let mut candidate = id;
        loop {
            let entry = self.arena.entry(candidate);
            if entry.parents.is_empty() {
                maximum = maximum.max(entry.count_with_descendants());
            } else if entry.parents.len() == 1 {
                let parent = *entry.parents.iter().next().expect("len checked");
                candidate = parent;
                if !guard.already_touched(&self.arena.entry(parent).epoch) {
                    continue;
                }
            } else {
                let mut found_one_already = false;
                for &parent in &entry.parents {
                    if guard.already_touched(&self.arena.entry(parent).epoch) {
                        continue;
                    }
                    if !found_one_already {
                        candidate = parent;
                    } else {
                        candidates.push(parent);
                    }
                    found_one_already = true;
                }
                if found_one_already {
                    continue;
                }
            }
            let Some(next) = candidates.pop() else {
                break;
            };
            candidate = next;
        }
        maximum
    }

    // === Lifecycle ===

    /// Drop every entry and reset the statistics. Prioritisation deltas
    /// survive, matching their pool-lifetime contract.
    pub fn clear(&mut self, now: i64) {
        self.arena = MemPoolArena::new();
        self.map_next_tx.clear();
        self.vtx_hashes.clear();
        self.total_tx_size = 0;
        self.cached_inner_usage = 0;
        self.last_rolling_fee_update = now;
        self.block_since_last_rolling_fee_bump = false;
        self.rolling_minimum_feerate = 0.0;
        self.transactions_updated += 1;
        self.epoch = EpochState::new();
    }

    // === Consistency audit ===

    /// Audit every invariant against `view`, with probability
    /// `check_frequency / u32::MAX`. Expensive: O(n²) in pool size.
    pub fn check(&self, view: &dyn CoinsView) {
        if self.check_frequency == 0 {
            return;
        }
        if rand::thread_rng().gen::<u32>() >= self.check_frequency {
            return;
        }
        self.check_internal(view);
    }

    pub(crate) fn check_internal(&self, view: &dyn CoinsView) {
        tracing::debug!(
            target: LOG_TARGET,
            "Checking mempool with {} transactions and {} inputs",
            self.arena.len(),
            self.map_next_tx.len()
        );

        let mut check_total = 0u64;
        let mut inner_usage = 0usize;
        let mut cache = CoinsViewCache::new(view, CHECK_CACHE_SIZE);
        let mut waiting_on_dependants: VecDeque<EntryId> = VecDeque::new();

        for (id, entry) in self.arena.iter() {
            check_total += entry.tx_size() as u64;
            inner_usage += entry.dynamic_memory_usage()
                + memusage::node_usage::<EntryId>() * (entry.parents.len() + entry.children.len());
            let tx = entry.tx();

            let mut depends_wait = false;
            let mut parent_check: BTreeSet<EntryId> = BTreeSet::new();
            for input in &tx.input {
                // Every input refers to an available coin or another
                // resident transaction.
                if let Some(parent_id) = self.arena.get_by_txid(&input.previous_output.txid) {
                    let parent_tx = self.arena.entry(parent_id).tx();
                    assert!(parent_tx.output.len() > input.previous_output.vout as usize);
                    depends_wait = true;
                    parent_check.insert(parent_id);
                } else {
                    assert!(view.have_coin(&input.previous_output));
                }
                assert_eq!(self.map_next_tx.get(&input.previous_output), Some(&id));
            }
            assert!(parent_check.iter().eq(entry.parents.iter()));

            // The cached ancestor rollup equals a fresh recomputation.
            let ancestors = self
                .calculate_mem_pool_ancestors(entry, &MemPoolLimits::unbounded(), true)
                .expect("unbounded limits cannot be exceeded");
            let mut size_check = entry.tx_size();
            let mut fees_check = entry.modified_fee();
            let mut sigop_check = entry.sigop_cost();
            for &ancestor_id in &ancestors {
                let ancestor = self.arena.entry(ancestor_id);
                size_check += ancestor.tx_size();
                fees_check += ancestor.modified_fee();
                sigop_check += ancestor.sigop_cost();
            }
            assert_eq!(entry.count_with_ancestors(), ancestors.len() as u64 + 1);
            assert_eq!(entry.size_with_ancestors(), size_check);
            assert_eq!(entry.sigop_cost_with_ancestors(), sigop_check);
            assert_eq!(entry.mod_fees_with_ancestors(), fees_check);

            // The child set matches what map_next_tx derives.
            let txid = entry.txid();
            let mut children_check: BTreeSet<EntryId> = BTreeSet::new();
            let mut child_sizes = 0i64;
            for (outpoint, &child_id) in self.map_next_tx.range(OutPoint::new(txid, 0)..) {
                if outpoint.txid != txid {
                    break;
                }
                if children_check.insert(child_id) {
                    child_sizes += self.arena.entry(child_id).tx_size();
                }
            }
            assert!(children_check.iter().eq(entry.children.iter()));
            // Not definitive, just a sanity bound on the descendant rollup.
            assert!(entry.size_with_descendants() >= child_sizes + entry.tx_size());

            if depends_wait {
                waiting_on_dependants.push_back(id);
            } else {
                assert!(cache.have_inputs(tx));
                cache.update_coins(tx, u32::MAX);
            }
        }

        // Replay entries with in-pool dependencies once their inputs are
        // covered; the step counter proves progress on each full rotation.
        let mut steps_since_last_remove = 0usize;
        while let Some(id) = waiting_on_dependants.pop_front() {
            let tx = self.arena.entry(id).tx();
            if !cache.have_inputs(tx) {
                waiting_on_dependants.push_back(id);
                steps_since_last_remove += 1;
                assert!(steps_since_last_remove < waiting_on_dependants.len());
            } else {
                cache.update_coins(tx, u32::MAX);
                steps_since_last_remove = 0;
            }
        }

        for (_, &spender) in &self.map_next_tx {
            let txid = self.arena.entry(spender).txid();
            assert_eq!(self.arena.get_by_txid(&txid), Some(spender));
        }

        assert_eq!(self.total_tx_size, check_total);
        assert_eq!(self.cached_inner_usage, inner_usage);
    }
}
