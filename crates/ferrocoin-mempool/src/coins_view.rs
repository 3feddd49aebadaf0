//! UTXO view seam and the mempool overlay over it.

use crate::inner::MemPoolInner;
use bitcoin::{OutPoint, Transaction, TxOut};
use schnellru::{ByLength, LruMap};
use std::collections::{HashMap, HashSet};

/// Synthetic height assigned to coins created by unconfirmed transactions.
pub const MEMPOOL_HEIGHT: u32 = 0x7FFF_FFFF;

/// Number of blocks a coinbase output must age before it is spendable.
pub const COINBASE_MATURITY: u32 = 100;

/// One unspent transaction output together with its creation metadata.
#[derive(Debug, Clone)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

/// Read access to a UTXO set. Implemented by the caller's chain state; the
/// mempool only ever reads through it.
pub trait CoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.get_coin(outpoint).is_some()
    }
}

/// A UTXO view that overlays the mempool's unconfirmed outputs on a base
/// view.
///
/// If an entry in the mempool exists it is always preferred: it is
/// guaranteed never to conflict with the underlying view and cannot be a
/// pruned entry, whereas checking the base first could return one.
pub struct CoinsViewMemPool<'a, V: CoinsView> {
    base: &'a V,
    mempool: &'a MemPoolInner,
}

impl<'a, V: CoinsView> CoinsViewMemPool<'a, V> {
    pub fn new(base: &'a V, mempool: &'a MemPoolInner) -> Self {
        Self { base, mempool }
    }
}

impl<V: CoinsView> CoinsView for CoinsViewMemPool<'_, V> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(tx) = self.mempool.get(&outpoint.txid) {
            return tx.output.get(outpoint.vout as usize).map(|output| Coin {
                output: output.clone(),
                height: MEMPOOL_HEIGHT,
                is_coinbase: false,
            });
        }
        self.base.get_coin(outpoint)
    }
}

/// Working cache over a base view: an LRU layer for base reads plus an
/// overlay of coins created and spent while replaying transactions.
///
/// Used by the consistency audit to re-apply every resident transaction in
/// topological order.
pub struct CoinsViewCache<'a, V: CoinsView + ?Sized> {
    base: &'a V,

    /// Coins fetched from the base view, including negative results.
    base_cache: LruMap<OutPoint, Option<Coin>, ByLength>,

    /// Coins created by replayed transactions.
    overlay: HashMap<OutPoint, Coin>,

    /// Outputs spent by replayed transactions.
    spent: HashSet<OutPoint>,
}

impl<'a, V: CoinsView + ?Sized> CoinsViewCache<'a, V> {
    pub fn new(base: &'a V, cache_size: u32) -> Self {
        Self {
            base,
            base_cache: LruMap::new(ByLength::new(cache_size)),
            overlay: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    /// Get a coin with overlay priority: spends shadow everything, then
    /// overlay coins, then the (cached) base view.
    pub fn get_coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        if self.spent.contains(outpoint) {
            return None;
        }
        if let Some(coin) = self.overlay.get(outpoint) {
            return Some(coin.clone());
        }
        if let Some(cached) = self.base_cache.peek(outpoint) {
            return cached.clone();
        }
        let coin = self.base.get_coin(outpoint);
        self.base_cache.insert(*outpoint, coin.clone());
        coin
    }

    pub fn have_coin(&mut self, outpoint: &OutPoint) -> bool {
        self.get_coin(outpoint).is_some()
    }

    /// Whether every input of `tx` resolves to an unspent coin.
    pub fn have_inputs(&mut self, tx: &Transaction) -> bool {
        tx.input
            .iter()
            .all(|input| self.have_coin(&input.previous_output))
    }

    /// Replay `tx`: mark its inputs spent and add its outputs at `height`.
    pub fn update_coins(&mut self, tx: &Transaction, height: u32) {
        for input in &tx.input {
            self.spent.insert(input.previous_output);
            self.overlay.remove(&input.previous_output);
        }
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            self.overlay.insert(
                OutPoint::new(txid, vout as u32),
                Coin {
                    output: output.clone(),
                    height,
                    is_coinbase: false,
                },
            );
        }
    }
}
