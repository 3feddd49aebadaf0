//! Core type definitions for the mempool.

use bitcoin::{Amount, BlockHash, Transaction};
use slotmap::DefaultKey;
use std::sync::Arc;

/// Handle to an entry in the mempool arena (not an iterator).
///
/// Stays valid for the entry's entire residency; never reused while the
/// entry is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub(crate) DefaultKey);

/// Fee rate in satoshis per virtual kilobyte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeeRate(u64);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);

    /// Create fee rate from satoshis per virtual byte.
    pub fn from_sat_per_vb(sat_vb: u64) -> Self {
        Self(sat_vb.checked_mul(1000).expect("Fee rate overflow"))
    }

    /// Create fee rate from satoshis per kilovirtual byte.
    pub fn from_sat_per_kvb(sat_kvb: u64) -> Self {
        Self(sat_kvb)
    }

    /// Calculate fee rate from a (possibly modified, hence signed) fee and a
    /// virtual size. A non-positive size or fee yields the zero rate.
    pub fn from_fee_and_vsize(fee_sats: i64, vsize: i64) -> Self {
        if vsize <= 0 || fee_sats <= 0 {
            return Self::ZERO;
        }
        Self((fee_sats as u64).saturating_mul(1000) / vsize as u64)
    }

    /// Get fee for the given virtual size.
    pub fn fee(&self, vsize: i64) -> Amount {
        let fee_sat = self
            .0
            .checked_mul(vsize as u64)
            .expect("Fee calculation overflow")
            / 1000;
        Amount::from_sat(fee_sat)
    }

    /// Get the fee rate in satoshis per kilovirtual byte.
    pub fn to_sat_per_kvb(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, other: FeeRate) -> FeeRate {
        FeeRate(self.0.saturating_add(other.0))
    }
}

impl std::fmt::Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} sat/kvB", self.0)
    }
}

/// Lock points for BIP68/BIP112 validation.
#[derive(Debug, Clone, Default)]
pub struct LockPoints {
    /// Height at which the transaction becomes valid.
    pub height: i32,
    /// Time at which the transaction becomes valid.
    pub time: i64,
    /// Highest block containing an input of this transaction.
    pub max_input_block: Option<BlockHash>,
}

/// Reason for removing transactions from the mempool, reported to
/// subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Expired from the mempool.
    Expiry,
    /// Evicted due to the mempool size limit.
    SizeLimit,
    /// Removed during a chain reorganization.
    Reorg,
    /// Included in a block.
    Block,
    /// Conflicted with an accepted transaction.
    Conflict,
    /// Replaced by a higher-fee transaction.
    Replaced,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expiry => "expiry",
            Self::SizeLimit => "sizelimit",
            Self::Reorg => "reorg",
            Self::Block => "block",
            Self::Conflict => "conflict",
            Self::Replaced => "replaced",
        }
    }
}

/// Mempool entry summary handed out by `info`/`info_all`.
#[derive(Debug, Clone)]
pub struct TxMempoolInfo {
    /// The transaction itself.
    pub tx: Arc<Transaction>,
    /// Arrival time (seconds since epoch).
    pub time: i64,
    /// Base fee.
    pub fee: Amount,
    /// Virtual size in bytes.
    pub vsize: i64,
    /// Prioritisation delta applied on top of the base fee, in satoshis.
    pub fee_delta: i64,
}

/// Finality and lock-point oracle consumed by the reorg path.
///
/// The mempool itself has no notion of chain state; the caller supplies one
/// through this trait.
pub trait ChainOracle {
    /// Whether the transaction is final at the current tip under `flags`.
    fn check_final_tx(&self, tx: &Transaction, flags: i32) -> bool;

    /// Evaluate BIP68 sequence locks for `tx`. When `use_existing_lock_points`
    /// is false, `lock_points` must be recalculated and written back; a
    /// failed evaluation may leave them invalid.
    fn check_sequence_locks(
        &self,
        tx: &Transaction,
        flags: i32,
        lock_points: &mut LockPoints,
        use_existing_lock_points: bool,
    ) -> bool;

    /// Whether the lock points were computed against a block still on the
    /// active chain.
    fn test_lock_point_validity(&self, lock_points: &LockPoints) -> bool;
}

/// Subscriber slot invoked when an entry is added. Must not re-enter the
/// mempool.
pub type EntryAddedCallback = Box<dyn Fn(&Arc<Transaction>) + Send>;

/// Subscriber slot invoked when an entry is removed for `reason`. Must not
/// re-enter the mempool.
pub type EntryRemovedCallback = Box<dyn Fn(&Arc<Transaction>, RemovalReason) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rate_from_fee_and_vsize() {
        // 1000 sat fee, 250 vbytes = 4000 sat/kvB
        assert_eq!(FeeRate::from_fee_and_vsize(1000, 250).to_sat_per_kvb(), 4000);

        // 500 sat fee, 200 vbytes = 2500 sat/kvB
        assert_eq!(FeeRate::from_fee_and_vsize(500, 200).to_sat_per_kvb(), 2500);

        // Degenerate sizes and negative fees collapse to the zero rate
        assert_eq!(FeeRate::from_fee_and_vsize(1000, 0), FeeRate::ZERO);
        assert_eq!(FeeRate::from_fee_and_vsize(-10, 100), FeeRate::ZERO);
    }

    #[test]
    fn test_fee_rate_ordering() {
        let low = FeeRate::from_sat_per_kvb(1000);
        let high = FeeRate::from_sat_per_vb(2);
        assert!(low < high);
        assert_eq!(low.saturating_add(high).to_sat_per_kvb(), 3000);
    }
}
