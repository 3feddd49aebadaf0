//! Fee estimation seam.

use crate::arena::TxMemPoolEntry;
use bitcoin::Txid;

/// Miner policy estimator slot. The mempool feeds it every accepted entry,
/// every connected block (before the contained entries are removed), and
/// every removal.
pub trait FeeEstimator: Send {
    /// A transaction entered the pool. `valid_fee_estimate` is false when
    /// the entry is not representative (e.g. re-added during a reorg).
    fn process_transaction(&mut self, entry: &TxMemPoolEntry, valid_fee_estimate: bool);

    /// A block was connected; `entries` are the block's transactions that
    /// were resident, still carrying their pool state.
    fn process_block(&mut self, block_height: u32, entries: &[&TxMemPoolEntry]);

    /// A transaction left the pool. `in_block` is true when it was removed
    /// because it confirmed.
    fn remove_tx(&mut self, txid: &Txid, in_block: bool);
}
