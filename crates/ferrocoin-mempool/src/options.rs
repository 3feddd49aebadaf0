use crate::types::FeeRate;

/// Package limits applied when accepting a transaction with unconfirmed
/// ancestors.
#[derive(Clone, Copy, Debug)]
pub struct MemPoolLimits {
    /// Maximum number of in-mempool ancestors for a transaction.
    pub max_ancestors: u64,

    /// Maximum size (in virtual bytes) of a transaction plus its ancestors.
    pub max_ancestor_size: u64,

    /// Maximum number of in-mempool descendants any ancestor may have.
    pub max_descendants: u64,

    /// Maximum size (in virtual bytes) of any ancestor plus its descendants.
    pub max_descendant_size: u64,
}

impl Default for MemPoolLimits {
    fn default() -> Self {
        Self {
            max_ancestors: 25,
            max_ancestor_size: 101_000,
            max_descendants: 25,
            max_descendant_size: 101_000,
        }
    }
}

impl MemPoolLimits {
    /// Limits that never trigger; used for internal walks over resident
    /// entries.
    pub fn unbounded() -> Self {
        Self {
            max_ancestors: u64::MAX,
            max_ancestor_size: u64::MAX,
            max_descendants: u64::MAX,
            max_descendant_size: u64::MAX,
        }
    }
}

/// Configuration options for the transaction memory pool.
#[derive(Clone, Copy, Debug)]
pub struct MemPoolOptions {
    /// Maximum dynamic memory usage of the mempool in bytes (default: 300 MB).
    pub max_size_bytes: usize,

    /// Number of hours to keep transactions in the mempool.
    pub expiry_hours: u32,

    /// Fee rate increment used when replacing evicted packages; also the
    /// floor returned by `get_min_fee` while the rolling fee is active.
    pub incremental_relay_feerate: FeeRate,

    /// Half-life of the rolling minimum fee rate decay, in seconds.
    pub rolling_fee_halflife: i64,

    /// Probability in [0, 1] that any given `check` call audits the pool.
    /// Zero disables the audit entirely.
    pub check_ratio: f64,

    pub limits: MemPoolLimits,
}

impl Default for MemPoolOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: 300_000_000,
            expiry_hours: 336, // 2 weeks
            incremental_relay_feerate: FeeRate::from_sat_per_kvb(1000),
            rolling_fee_halflife: 60 * 60 * 12,
            check_ratio: 0.0,
            limits: MemPoolLimits::default(),
        }
    }
}

impl MemPoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for configuring mempool options.
    pub fn builder() -> MemPoolOptionsBuilder {
        MemPoolOptionsBuilder::default()
    }

    /// Expiry horizon in seconds.
    pub fn expiry_seconds(&self) -> i64 {
        self.expiry_hours as i64 * 3600
    }
}

/// Builder pattern for [`MemPoolOptions`].
#[derive(Default)]
pub struct MemPoolOptionsBuilder {
    options: MemPoolOptions,
}

impl MemPoolOptionsBuilder {
    /// Set the maximum dynamic memory usage in bytes.
    pub fn max_size_bytes(mut self, bytes: usize) -> Self {
        self.options.max_size_bytes = bytes;
        self
    }

    /// Set expiry time in hours.
    pub fn expiry_hours(mut self, hours: u32) -> Self {
        self.options.expiry_hours = hours;
        self
    }

    /// Set the incremental relay fee rate.
    pub fn incremental_relay_feerate(mut self, feerate: FeeRate) -> Self {
        self.options.incremental_relay_feerate = feerate;
        self
    }

    /// Set the rolling fee half-life in seconds.
    pub fn rolling_fee_halflife(mut self, seconds: i64) -> Self {
        self.options.rolling_fee_halflife = seconds;
        self
    }

    /// Set the consistency-check sampling ratio.
    pub fn check_ratio(mut self, ratio: f64) -> Self {
        self.options.check_ratio = ratio;
        self
    }

    /// Set the maximum number of ancestors.
    pub fn max_ancestors(mut self, count: u64) -> Self {
        self.options.limits.max_ancestors = count;
        self
    }

    /// Set the maximum ancestor size.
    pub fn max_ancestor_size(mut self, size: u64) -> Self {
        self.options.limits.max_ancestor_size = size;
        self
    }

    /// Set the maximum number of descendants.
    pub fn max_descendants(mut self, count: u64) -> Self {
        self.options.limits.max_descendants = count;
        self
    }

    /// Set the maximum descendant size.
    pub fn max_descendant_size(mut self, size: u64) -> Self {
        self.options.limits.max_descendant_size = size;
        self
    }

    /// Build the final [`MemPoolOptions`].
    pub fn build(self) -> MemPoolOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mempool_options_builder() {
        let options = MemPoolOptions::builder()
            .max_size_bytes(5_000_000)
            .expiry_hours(168)
            .max_ancestors(50)
            .build();

        assert_eq!(options.max_size_bytes, 5_000_000);
        assert_eq!(options.expiry_hours, 168);
        assert_eq!(options.limits.max_ancestors, 50);
    }

    #[test]
    fn test_mempool_options_defaults() {
        let options = MemPoolOptions::default();

        assert_eq!(options.max_size_bytes, 300_000_000);
        assert_eq!(options.expiry_hours, 336);
        assert_eq!(options.incremental_relay_feerate.to_sat_per_kvb(), 1000);
        assert_eq!(options.limits.max_ancestors, 25);
    }
}
