//! Arena-based mempool entry storage with multi-index support.
//!
//! The arena uses a slotmap for handle-based entry storage, avoiding
//! reference cycles and enabling safe mutation. Sorted secondary indices are
//! plain `BTreeSet`s of comparable keys derived from entry state; any
//! mutation that changes a score removes the affected keys first, applies
//! the mutation, then reinserts the recomputed keys.

use crate::memusage;
use crate::types::{EntryId, LockPoints};
use bitcoin::{Amount, Transaction, Txid, Weight, Wtxid};
use slotmap::SlotMap;
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Weight-unit cost assigned to one signature operation when computing
/// virtual size.
const BYTES_PER_SIGOP: i64 = 20;

/// An exact fee-per-size fraction, compared by i128 cross-multiplication so
/// equal ratios with different magnitudes compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FeeFrac {
    fee: i64,
    size: i64,
}

impl FeeFrac {
    fn cmp_ratio(&self, other: &Self) -> Ordering {
        (self.fee as i128 * other.size as i128).cmp(&(other.fee as i128 * self.size as i128))
    }
}

/// Key for the descendant-score index: `mod_fees_with_descendants /
/// size_with_descendants`, ascending, ties broken by entry time (older
/// first) then handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DescendantScoreKey {
    frac: FeeFrac,
    time: i64,
    id: EntryId,
}

impl Ord for DescendantScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.frac
            .cmp_ratio(&other.frac)
            .then_with(|| self.time.cmp(&other.time))
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.frac.fee.cmp(&other.frac.fee))
            .then_with(|| self.frac.size.cmp(&other.frac.size))
    }
}

impl PartialOrd for DescendantScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key for the ancestor-score and score-only indices: a fee-per-size
/// fraction ascending, ties broken by txid then handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScoreKey {
    frac: FeeFrac,
    txid: Txid,
    id: EntryId,
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.frac
            .cmp_ratio(&other.frac)
            .then_with(|| self.txid.cmp(&other.txid))
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.frac.fee.cmp(&other.frac.fee))
            .then_with(|| self.frac.size.cmp(&other.frac.size))
    }
}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One record in the mempool, representing one unconfirmed transaction
/// together with cached rollups over its in-pool ancestors and descendants.
///
/// The cached aggregates always equal the values a full traversal would
/// recompute; every insertion, removal and prioritisation maintains them
/// incrementally.
pub struct TxMemPoolEntry {
    tx: Arc<Transaction>,
    txid: Txid,
    wtxid: Wtxid,
    fee: Amount,
    tx_weight: Weight,
    usage_size: usize,
    time: i64,
    entry_height: u32,
    spends_coinbase: bool,
    sigop_cost: i64,
    lock_points: LockPoints,
    /// Prioritisation delta in satoshis, applied on top of `fee`.
    fee_delta: i64,

    // Rollups over this entry plus all transitive descendants.
    count_with_descendants: u64,
    size_with_descendants: i64,
    mod_fees_with_descendants: i64,

    // Rollups over this entry plus all transitive ancestors.
    count_with_ancestors: u64,
    size_with_ancestors: i64,
    mod_fees_with_ancestors: i64,
    sigop_cost_with_ancestors: i64,

    /// Direct in-pool dependencies.
    pub(crate) parents: BTreeSet<EntryId>,
    /// Direct in-pool dependents.
    pub(crate) children: BTreeSet<EntryId>,

    /// Back-index into the pool's witness-hash vector.
    pub(crate) vtx_hashes_idx: usize,

    /// Visitation mark, see [`crate::epoch`].
    pub(crate) epoch: Cell<u64>,
}

impl TxMemPoolEntry {
    pub fn new(
        tx: Arc<Transaction>,
        fee: Amount,
        time: i64,
        entry_height: u32,
        spends_coinbase: bool,
        sigop_cost: i64,
        lock_points: LockPoints,
    ) -> Self {
        let txid = tx.compute_txid();
        let wtxid = tx.compute_wtxid();
        let tx_weight = tx.weight();
        let usage_size = memusage::tx_usage(&tx);
        let mut entry = Self {
            tx,
            txid,
            wtxid,
            fee,
            tx_weight,
            usage_size,
            time,
            entry_height,
            spends_coinbase,
            sigop_cost,
            lock_points,
            fee_delta: 0,
            count_with_descendants: 1,
            size_with_descendants: 0,
            mod_fees_with_descendants: fee.to_sat() as i64,
            count_with_ancestors: 1,
            size_with_ancestors: 0,
            mod_fees_with_ancestors: fee.to_sat() as i64,
            sigop_cost_with_ancestors: sigop_cost,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            vtx_hashes_idx: 0,
            epoch: Cell::new(0),
        };
        entry.size_with_descendants = entry.tx_size();
        entry.size_with_ancestors = entry.tx_size();
        entry
    }

    pub fn tx(&self) -> &Arc<Transaction> {
        &self.tx
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn wtxid(&self) -> Wtxid {
        self.wtxid
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    /// Base fee plus the prioritisation delta, in satoshis.
    pub fn modified_fee(&self) -> i64 {
        self.fee.to_sat() as i64 + self.fee_delta
    }

    pub fn fee_delta(&self) -> i64 {
        self.fee_delta
    }

    pub fn tx_weight(&self) -> Weight {
        self.tx_weight
    }

    /// Virtual size in bytes, accounting for witness discount and signature
    /// operation cost.
    pub fn tx_size(&self) -> i64 {
        let weight = self.tx_weight.to_wu() as i64;
        (weight.max(self.sigop_cost * BYTES_PER_SIGOP) + 3) / 4
    }

    /// Approximate heap usage of the shared transaction body.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.usage_size
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn entry_height(&self) -> u32 {
        self.entry_height
    }

    pub fn spends_coinbase(&self) -> bool {
        self.spends_coinbase
    }

    pub fn sigop_cost(&self) -> i64 {
        self.sigop_cost
    }

    pub fn lock_points(&self) -> &LockPoints {
        &self.lock_points
    }

    pub fn count_with_descendants(&self) -> u64 {
        self.count_with_descendants
    }

    pub fn size_with_descendants(&self) -> i64 {
        self.size_with_descendants
    }

    pub fn mod_fees_with_descendants(&self) -> i64 {
        self.mod_fees_with_descendants
    }

    pub fn count_with_ancestors(&self) -> u64 {
        self.count_with_ancestors
    }

    pub fn size_with_ancestors(&self) -> i64 {
        self.size_with_ancestors
    }

    pub fn mod_fees_with_ancestors(&self) -> i64 {
        self.mod_fees_with_ancestors
    }

    pub fn sigop_cost_with_ancestors(&self) -> i64 {
        self.sigop_cost_with_ancestors
    }

    fn apply_descendant_delta(&mut self, size: i64, fees: i64, count: i64) {
        self.size_with_descendants += size;
        assert!(self.size_with_descendants > 0);
        self.mod_fees_with_descendants += fees;
        self.count_with_descendants = (self.count_with_descendants as i64 + count) as u64;
        assert!(self.count_with_descendants > 0);
    }

    fn apply_ancestor_delta(&mut self, size: i64, fees: i64, count: i64, sigops: i64) {
        self.size_with_ancestors += size;
        assert!(self.size_with_ancestors > 0);
        self.mod_fees_with_ancestors += fees;
        self.count_with_ancestors = (self.count_with_ancestors as i64 + count) as u64;
        assert!(self.count_with_ancestors > 0);
        self.sigop_cost_with_ancestors += sigops;
        assert!(self.sigop_cost_with_ancestors >= 0);
    }

    fn apply_fee_delta(&mut self, new_delta: i64) {
        self.mod_fees_with_descendants += new_delta - self.fee_delta;
        self.mod_fees_with_ancestors += new_delta - self.fee_delta;
        self.fee_delta = new_delta;
    }
}

/// Arena holding all mempool entries with multi-index support.
///
/// Entries are pinned: an [`EntryId`] stays valid for the entry's entire
/// lifetime. Secondary indices reference entries by id only.
pub struct MemPoolArena {
    entries: SlotMap<slotmap::DefaultKey, TxMemPoolEntry>,

    by_txid: HashMap<Txid, EntryId>,

    /// Sorted by arrival time, oldest first (expiry order).
    by_entry_time: BTreeSet<(i64, EntryId)>,

    /// Sorted by descendant score, lowest first (eviction order).
    by_descendant_score: BTreeSet<DescendantScoreKey>,

    /// Sorted by ancestor score; iterated in reverse for mining order.
    by_ancestor_score: BTreeSet<ScoreKey>,

    /// Sorted by the entry's own modified feerate.
    by_score: BTreeSet<ScoreKey>,
}

impl MemPoolArena {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::new(),
            by_txid: HashMap::new(),
            by_entry_time: BTreeSet::new(),
            by_descendant_score: BTreeSet::new(),
            by_ancestor_score: BTreeSet::new(),
            by_score: BTreeSet::new(),
        }
    }

    fn descendant_key(entry: &TxMemPoolEntry, id: EntryId) -> DescendantScoreKey {
        DescendantScoreKey {
            frac: FeeFrac {
                fee: entry.mod_fees_with_descendants,
                size: entry.size_with_descendants,
            },
            time: entry.time,
            id,
        }
    }

    fn ancestor_key(entry: &TxMemPoolEntry, id: EntryId) -> ScoreKey {
        ScoreKey {
            frac: FeeFrac {
                fee: entry.mod_fees_with_ancestors,
                size: entry.size_with_ancestors,
            },
            txid: entry.txid,
            id,
        }
    }

    fn score_key(entry: &TxMemPoolEntry, id: EntryId) -> ScoreKey {
        ScoreKey {
            frac: FeeFrac {
                fee: entry.modified_fee(),
                size: entry.tx_size(),
            },
            txid: entry.txid,
            id,
        }
    }

    /// Insert a new entry, registering it in every index.
    pub fn insert(&mut self, entry: TxMemPoolEntry) -> EntryId {
        let txid = entry.txid;
        let time = entry.time;
        let id = EntryId(self.entries.insert(entry));
        let entry = &self.entries[id.0];
        self.by_txid.insert(txid, id);
        self.by_entry_time.insert((time, id));
        self.by_descendant_score.insert(Self::descendant_key(entry, id));
        self.by_ancestor_score.insert(Self::ancestor_key(entry, id));
        self.by_score.insert(Self::score_key(entry, id));
        id
    }

    /// Remove an entry from the arena and every index.
    pub fn remove(&mut self, id: EntryId) -> Option<TxMemPoolEntry> {
        let entry = self.entries.get(id.0)?;
        let desc_key = Self::descendant_key(entry, id);
        let anc_key = Self::ancestor_key(entry, id);
        let score_key = Self::score_key(entry, id);
        let entry = self.entries.remove(id.0).expect("entry probed above");
        self.by_txid.remove(&entry.txid);
        self.by_entry_time.remove(&(entry.time, id));
        self.by_descendant_score.remove(&desc_key);
        self.by_ancestor_score.remove(&anc_key);
        self.by_score.remove(&score_key);
        Some(entry)
    }

    pub fn get(&self, id: EntryId) -> Option<&TxMemPoolEntry> {
        self.entries.get(id.0)
    }

    /// Resolve a handle known to be live. A stale handle is a programming
    /// bug: edges are severed before neighbour removal, so ids held by the
    /// algorithms never dangle.
    pub fn entry(&self, id: EntryId) -> &TxMemPoolEntry {
        &self.entries[id.0]
    }

    pub fn get_by_txid(&self, txid: &Txid) -> Option<EntryId> {
        self.by_txid.get(txid).copied()
    }

    /// Apply a delta to the descendant rollup, reindexing the descendant
    /// score.
    pub fn update_descendant_state(&mut self, id: EntryId, size: i64, fees: i64, count: i64) {
        let old_key = Self::descendant_key(&self.entries[id.0], id);
        self.by_descendant_score.remove(&old_key);
        let entry = &mut self.entries[id.0];
        entry.apply_descendant_delta(size, fees, count);
        let new_key = Self::descendant_key(&self.entries[id.0], id);
        self.by_descendant_score.insert(new_key);
    }

    /// Apply a delta to the ancestor rollup, reindexing the ancestor score.
    pub fn update_ancestor_state(
        &mut self,
        id: EntryId,
        size: i64,
        fees: i64,
        count: i64,
        sigops: i64,
    ) {
        let old_key = Self::ancestor_key(&self.entries[id.0], id);
        self.by_ancestor_score.remove(&old_key);
        let entry = &mut self.entries[id.0];
        entry.apply_ancestor_delta(size, fees, count, sigops);
        let new_key = Self::ancestor_key(&self.entries[id.0], id);
        self.by_ancestor_score.insert(new_key);
    }

    /// Replace the prioritisation delta; every score index is affected.
    pub fn update_fee_delta(&mut self, id: EntryId, new_delta: i64) {
        let entry = &self.entries[id.0];
        let old_desc = Self::descendant_key(entry, id);
        let old_anc = Self::ancestor_key(entry, id);
        let old_score = Self::score_key(entry, id);
        self.by_descendant_score.remove(&old_desc);
        self.by_ancestor_score.remove(&old_anc);
        self.by_score.remove(&old_score);
        self.entries[id.0].apply_fee_delta(new_delta);
        let entry = &self.entries[id.0];
        self.by_descendant_score.insert(Self::descendant_key(entry, id));
        self.by_ancestor_score.insert(Self::ancestor_key(entry, id));
        self.by_score.insert(Self::score_key(entry, id));
    }

    /// Refresh stale lock points in place; no index is affected.
    pub fn update_lock_points(&mut self, id: EntryId, lock_points: LockPoints) {
        self.entries[id.0].lock_points = lock_points;
    }

    pub(crate) fn set_vtx_hashes_idx(&mut self, id: EntryId, idx: usize) {
        self.entries[id.0].vtx_hashes_idx = idx;
    }

    /// Record `parent` as a direct dependency of `child`. Returns whether the
    /// edge was new.
    pub fn add_parent(&mut self, child: EntryId, parent: EntryId) -> bool {
        self.entries[child.0].parents.insert(parent)
    }

    pub fn remove_parent(&mut self, child: EntryId, parent: EntryId) -> bool {
        self.entries[child.0].parents.remove(&parent)
    }

    /// Record `child` as a direct dependent of `parent`. Returns whether the
    /// edge was new.
    pub fn add_child(&mut self, parent: EntryId, child: EntryId) -> bool {
        self.entries[parent.0].children.insert(child)
    }

    pub fn remove_child(&mut self, parent: EntryId, child: EntryId) -> bool {
        self.entries[parent.0].children.remove(&child)
    }

    /// Iterate all entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.entries.iter().map(|(key, entry)| (EntryId(key), entry))
    }

    /// Iterate entries by arrival time, oldest first.
    pub fn iter_by_entry_time(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_entry_time
            .iter()
            .map(|&(_, id)| (id, &self.entries[id.0]))
    }

    /// Iterate entries by descendant score, lowest first. This is the
    /// eviction order.
    pub fn iter_by_descendant_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_descendant_score
            .iter()
            .map(|key| (key.id, &self.entries[key.id.0]))
    }

    /// Iterate entries by ancestor score, highest first. This is the mining
    /// order.
    pub fn iter_by_ancestor_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_ancestor_score
            .iter()
            .rev()
            .map(|key| (key.id, &self.entries[key.id.0]))
    }

    /// Iterate entries by their own modified feerate, highest first.
    pub fn iter_by_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_score
            .iter()
            .rev()
            .map(|key| (key.id, &self.entries[key.id.0]))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemPoolArena {
    fn default() -> Self {
        Self::new()
    }
}
