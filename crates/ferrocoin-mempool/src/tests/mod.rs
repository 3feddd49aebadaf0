//! Integration tests for the mempool graph, eviction and removal paths.

use crate::arena::TxMemPoolEntry;
use crate::coins_view::{Coin, CoinsView};
use crate::fees::FeeEstimator;
use crate::inner::MemPoolInner;
use crate::options::MemPoolOptions;
use crate::types::{ChainOracle, LockPoints};
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, transaction, Amount, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

mod removal_tests;

/// Fluent transaction builder for tests.
pub struct TxBuilder {
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
}

impl TxBuilder {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, outpoint: OutPoint) -> Self {
        self.inputs.push(TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::default(),
            sequence: bitcoin::Sequence::MAX,
            witness: bitcoin::Witness::default(),
        });
        self
    }

    pub fn output(mut self, value: u64) -> Self {
        self.outputs.push(TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::default(),
        });
        self
    }

    pub fn build(self) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: self.inputs,
            output: self.outputs,
        })
    }
}

impl Default for TxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An outpoint of the all-zero "confirmed funding" transaction.
pub fn funding_outpoint(vout: u32) -> OutPoint {
    OutPoint::new(Txid::all_zeros(), vout)
}

/// Entry with fixed metadata, arriving at time zero.
pub fn test_entry(tx: &Arc<Transaction>, fee: u64) -> TxMemPoolEntry {
    test_entry_at(tx, fee, 0)
}

/// Entry with fixed metadata, arriving at `time`.
pub fn test_entry_at(tx: &Arc<Transaction>, fee: u64, time: i64) -> TxMemPoolEntry {
    TxMemPoolEntry::new(
        tx.clone(),
        Amount::from_sat(fee),
        time,
        1,
        false,
        0,
        LockPoints::default(),
    )
}

/// Pool state with default options and a zeroed clock.
pub fn test_pool() -> MemPoolInner {
    MemPoolInner::new(MemPoolOptions::default(), 0)
}

/// In-memory UTXO set for audit and reorg tests.
pub struct MockCoinsView {
    coins: Mutex<HashMap<OutPoint, Coin>>,
}

impl MockCoinsView {
    pub fn new() -> Self {
        Self {
            coins: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_coin(&self, outpoint: OutPoint, value: u64, height: u32, is_coinbase: bool) {
        self.coins.lock().unwrap().insert(
            outpoint,
            Coin {
                output: TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: ScriptBuf::default(),
                },
                height,
                is_coinbase,
            },
        );
    }

    pub fn remove_coin(&self, outpoint: &OutPoint) {
        self.coins.lock().unwrap().remove(outpoint);
    }
}

impl CoinsView for MockCoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.lock().unwrap().get(outpoint).cloned()
    }
}

/// Chain oracle with scripted verdicts.
pub struct TestOracle {
    pub non_final: HashSet<Txid>,
    pub sequence_lock_failures: HashSet<Txid>,
    pub lock_points_valid: bool,
}

impl TestOracle {
    pub fn permissive() -> Self {
        Self {
            non_final: HashSet::new(),
            sequence_lock_failures: HashSet::new(),
            lock_points_valid: true,
        }
    }
}

impl ChainOracle for TestOracle {
    fn check_final_tx(&self, tx: &Transaction, _flags: i32) -> bool {
        !self.non_final.contains(&tx.compute_txid())
    }

    fn check_sequence_locks(
        &self,
        tx: &Transaction,
        _flags: i32,
        lock_points: &mut LockPoints,
        use_existing_lock_points: bool,
    ) -> bool {
        if !use_existing_lock_points {
            *lock_points = LockPoints::default();
        }
        !self.sequence_lock_failures.contains(&tx.compute_txid())
    }

    fn test_lock_point_validity(&self, _lock_points: &LockPoints) -> bool {
        self.lock_points_valid
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum EstimatorEvent {
    Transaction(Txid, bool),
    Block(u32, Vec<Txid>),
    Removed(Txid, bool),
}

/// Estimator slot that records every call.
pub struct RecordingEstimator {
    pub events: Arc<Mutex<Vec<EstimatorEvent>>>,
}

impl RecordingEstimator {
    pub fn new() -> (Self, Arc<Mutex<Vec<EstimatorEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
            },
            events,
        )
    }
}

impl FeeEstimator for RecordingEstimator {
    fn process_transaction(&mut self, entry: &TxMemPoolEntry, valid_fee_estimate: bool) {
        self.events
            .lock()
            .unwrap()
            .push(EstimatorEvent::Transaction(entry.txid(), valid_fee_estimate));
    }

    fn process_block(&mut self, block_height: u32, entries: &[&TxMemPoolEntry]) {
        self.events.lock().unwrap().push(EstimatorEvent::Block(
            block_height,
            entries.iter().map(|entry| entry.txid()).collect(),
        ));
    }

    fn remove_tx(&mut self, txid: &Txid, in_block: bool) {
        self.events
            .lock()
            .unwrap()
            .push(EstimatorEvent::Removed(*txid, in_block));
    }
}

/// Build a chain of `fees.len()` transactions, the first funded by
/// `funding_outpoint(vout)`, each subsequent one spending its parent's
/// first output, and add them all to `pool`.
pub fn add_chain(pool: &mut MemPoolInner, vout: u32, fees: &[u64]) -> Vec<Arc<Transaction>> {
    let mut txs = Vec::with_capacity(fees.len());
    let mut prevout = funding_outpoint(vout);
    let mut value = 1_000_000u64;
    for &fee in fees {
        value -= fee;
        let tx = TxBuilder::new().input(prevout).output(value).build();
        pool.add_unchecked(test_entry(&tx, fee), true);
        prevout = OutPoint::new(tx.compute_txid(), 0);
        txs.push(tx);
    }
    txs
}

/// Assert a transaction is resident.
pub fn assert_in_pool(pool: &MemPoolInner, txid: &Txid) {
    assert!(
        pool.get(txid).is_some(),
        "Expected transaction {txid} to be in mempool"
    );
}

/// Assert a transaction is not resident.
pub fn assert_not_in_pool(pool: &MemPoolInner, txid: &Txid) {
    assert!(
        pool.get(txid).is_none(),
        "Expected transaction {txid} to NOT be in mempool"
    );
}

#[test]
fn test_thread_safe_wrapper_surface() {
    let mempool = crate::MemPool::new();
    let view = MockCoinsView::new();
    view.add_coin(funding_outpoint(0), 1_000_000, 1, false);

    let tx = TxBuilder::new().input(funding_outpoint(0)).output(99_000).build();
    let txid = tx.compute_txid();
    mempool.add_unchecked(test_entry(&tx, 1000), true);

    assert_eq!(mempool.size(), 1);
    assert!(mempool.get(&txid).is_some());
    assert!(mempool.is_spent(&funding_outpoint(0)));
    assert_eq!(mempool.query_hashes(), vec![txid]);
    assert_eq!(mempool.get_transaction_ancestry(&txid), Some((1, 1)));
    assert!(mempool.transactions_updated() > 0);
    mempool.check(&view);

    mempool.prioritise_transaction(&txid, 100);
    assert_eq!(mempool.apply_delta(&txid), 100);

    // Callers combining pool and view reads hold the lock once.
    {
        let inner = mempool.lock();
        let overlay = crate::CoinsViewMemPool::new(&view, &inner);
        assert!(overlay.get_coin(&bitcoin::OutPoint::new(txid, 0)).is_some());
    }

    mempool.remove_recursive(&tx, crate::RemovalReason::Replaced);
    assert_eq!(mempool.size(), 0);
    assert_eq!(mempool.expire(i64::MAX), 0);
    assert_eq!(
        mempool.get_min_fee(300_000_000),
        crate::FeeRate::ZERO
    );
}
