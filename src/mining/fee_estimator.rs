//! Fee Estimation
//!
//! Estimates a fee rate from two sources:
//! - Fee rates of transactions in recently connected blocks
//! - Fee rates currently waiting in the mempool
//!
//! A shorter confirmation target reads a higher percentile from both.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Number of recent blocks kept in the history
pub const MAX_HISTORY_BLOCKS: usize = 20;

/// Returned when there is no data at all (coins per byte)
pub const DEFAULT_FEE_RATE: u64 = 100;

/// Floor of every estimate (coins per byte)
pub const MIN_RELAY_FEE_RATE: u64 = 1;

// =============================================================================
// Fee Rate
// =============================================================================

/// Fee rate in coins per serialized byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Create from total fee and transaction size
    pub fn from_fee_and_size(fee: u64, size_bytes: usize) -> Self {
        if size_bytes == 0 {
            Self(0)
        } else {
            Self(fee / size_bytes as u64)
        }
    }

    /// Calculate fee for a given size
    pub fn fee_for_size(&self, size_bytes: usize) -> u64 {
        self.0.saturating_mul(size_bytes as u64)
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self(MIN_RELAY_FEE_RATE)
    }
}

// =============================================================================
// Fee Estimator
// =============================================================================

/// Sorted fee rates of the non-coinbase transactions of one block
#[derive(Debug, Clone)]
struct BlockFeeData {
    block_id: String,
    fee_rates: Vec<u64>,
}

#[derive(Debug, Default)]
pub struct FeeEstimator {
    block_history: VecDeque<BlockFeeData>,
    /// Current mempool fee rates (sorted)
    mempool_rates: Vec<u64>,
}

impl FeeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the fee rates of a connected block. `tx_fees` holds
    /// `(fee, serialized size)` of each non-coinbase transaction.
    pub fn record_block(&mut self, block_id: &str, tx_fees: &[(u64, usize)]) {
        if self.block_history.iter().any(|data| data.block_id == block_id) {
            return;
        }

        let mut fee_rates: Vec<u64> = tx_fees
            .iter()
            .filter(|(_, size)| *size > 0)
            .map(|(fee, size)| FeeRate::from_fee_and_size(*fee, *size).0)
            .collect();
        fee_rates.sort_unstable();

        log::trace!(
            "Fee estimator recorded block {} with {} transactions",
            block_id,
            fee_rates.len()
        );

        self.block_history.push_back(BlockFeeData {
            block_id: block_id.to_string(),
            fee_rates,
        });
        while self.block_history.len() > MAX_HISTORY_BLOCKS {
            self.block_history.pop_front();
        }
    }

    /// Forget a disconnected block
    pub fn unrecord_block(&mut self, block_id: &str) {
        if let Some(pos) = self
            .block_history
            .iter()
            .position(|data| data.block_id == block_id)
        {
            self.block_history.remove(pos);
            log::trace!("Fee estimator removed block {}", block_id);
        }
    }

    /// Replace the mempool snapshot
    pub fn update_mempool(&mut self, mut fee_rates: Vec<u64>) {
        fee_rates.sort_unstable();
        self.mempool_rates = fee_rates;
    }

    pub fn history_len(&self) -> usize {
        self.block_history.len()
    }

    /// Estimate a fee rate (coins per byte) to confirm within `target_blocks`
    pub fn estimate_fee_rate(&self, target_blocks: u32) -> u64 {
        let mut block_rates: Vec<u64> = self
            .block_history
            .iter()
            .flat_map(|data| data.fee_rates.iter().copied())
            .collect();

        if block_rates.is_empty() && self.mempool_rates.is_empty() {
            log::trace!("No fee data available, returning default fee rate {}", DEFAULT_FEE_RATE);
            return DEFAULT_FEE_RATE;
        }
        block_rates.sort_unstable();

        let block_estimate = if block_rates.is_empty() {
            DEFAULT_FEE_RATE
        } else {
            let p = match target_blocks {
                0..=1 => 0.85,
                2..=3 => 0.60,
                4..=6 => 0.35,
                _ => 0.10,
            };
            percentile(&block_rates, p)
        };

        let mempool_estimate = if self.mempool_rates.is_empty() {
            0
        } else {
            let p = match target_blocks {
                0..=1 => 0.90,
                2..=3 => 0.50,
                _ => 0.25,
            };
            percentile(&self.mempool_rates, p)
        };

        let estimate = block_estimate.max(mempool_estimate).max(MIN_RELAY_FEE_RATE);
        log::trace!(
            "Fee estimate for {} block target: {} (block={}, mempool={})",
            target_blocks,
            estimate,
            block_estimate,
            mempool_estimate
        );
        estimate
    }

    /// Percentile `p` (0.0..=1.0) of the mempool fee rates
    pub fn mempool_fee_rate_percentile(&self, p: f64) -> u64 {
        if self.mempool_rates.is_empty() {
            return DEFAULT_FEE_RATE;
        }
        percentile(&self.mempool_rates, p)
    }

    /// Get fee estimates for the usual targets
    pub fn get_all_estimates(&self) -> FeeEstimates {
        FeeEstimates {
            high_priority: FeeRate(self.estimate_fee_rate(1)),
            normal: FeeRate(self.estimate_fee_rate(3)),
            low_priority: FeeRate(self.estimate_fee_rate(6)),
            economy: FeeRate(self.estimate_fee_rate(25)),
        }
    }

    pub fn reset(&mut self) {
        self.block_history.clear();
        self.mempool_rates.clear();
    }
}

/// Linear interpolation between the closest ranks of a sorted slice
fn percentile(sorted_rates: &[u64], p: f64) -> u64 {
    match sorted_rates {
        [] => 0,
        [only] => *only,
        _ => {
            let index = p.clamp(0.0, 1.0) * (sorted_rates.len() - 1) as f64;
            let lower = index as usize;
            let upper = lower + 1;
            if upper >= sorted_rates.len() {
                return sorted_rates[sorted_rates.len() - 1];
            }
            let fraction = index - lower as f64;
            (sorted_rates[lower] as f64 * (1.0 - fraction) + sorted_rates[upper] as f64 * fraction)
                as u64
        }
    }
}

// =============================================================================
// Fee Estimates Result
// =============================================================================

/// Collection of fee estimates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEstimates {
    /// Fee for next block confirmation
    pub high_priority: FeeRate,
    /// Fee for ~3 block confirmation
    pub normal: FeeRate,
    /// Fee for ~6 block confirmation
    pub low_priority: FeeRate,
    /// Fee for background/economy transactions
    pub economy: FeeRate,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rate() {
        assert_eq!(FeeRate(10).fee_for_size(250), 2500);
        assert_eq!(FeeRate::from_fee_and_size(1000, 200).0, 5);
        assert_eq!(FeeRate::from_fee_and_size(1000, 0).0, 0);
    }

    #[test]
    fn test_percentile_interpolation() {
        assert_eq!(percentile(&[], 0.5), 0);
        assert_eq!(percentile(&[7], 0.9), 7);
        assert_eq!(percentile(&[10, 20], 0.5), 15);
        assert_eq!(percentile(&[10, 20, 30, 40, 50], 1.0), 50);
        assert_eq!(percentile(&[10, 20, 30, 40, 50], 0.0), 10);
    }

    #[test]
    fn test_default_without_data() {
        let estimator = FeeEstimator::new();
        assert_eq!(estimator.estimate_fee_rate(1), DEFAULT_FEE_RATE);
        assert_eq!(estimator.mempool_fee_rate_percentile(0.5), DEFAULT_FEE_RATE);
    }

    #[test]
    fn test_block_history() {
        let mut estimator = FeeEstimator::new();
        let fees: Vec<(u64, usize)> = (1..=100).map(|i| (i * 100, 100)).collect();
        estimator.record_block("b1", &fees);
        estimator.record_block("b1", &fees);
        assert_eq!(estimator.history_len(), 1);

        // Rates 1..=100; p=0.85 over 99 steps lands on 85.15
        assert_eq!(estimator.estimate_fee_rate(1), 85);
        assert_eq!(estimator.estimate_fee_rate(3), 60);
        assert_eq!(estimator.estimate_fee_rate(6), 35);
        assert_eq!(estimator.estimate_fee_rate(100), 10);

        estimator.unrecord_block("b1");
        assert_eq!(estimator.history_len(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut estimator = FeeEstimator::new();
        for i in 0..(MAX_HISTORY_BLOCKS + 5) {
            estimator.record_block(&format!("b{i}"), &[(10, 10)]);
        }
        assert_eq!(estimator.history_len(), MAX_HISTORY_BLOCKS);
    }

    #[test]
    fn test_mempool_raises_estimate() {
        let mut estimator = FeeEstimator::new();
        estimator.record_block("b", &[(100, 100)]);
        estimator.update_mempool(vec![50, 40, 30]);
        assert_eq!(estimator.estimate_fee_rate(3), 40);
        assert_eq!(estimator.mempool_fee_rate_percentile(0.5), 40);

        let estimates = estimator.get_all_estimates();
        assert!(estimates.high_priority >= estimates.economy);
    }

    #[test]
    fn test_floor() {
        let mut estimator = FeeEstimator::new();
        estimator.record_block("b", &[(0, 100)]);
        assert_eq!(estimator.estimate_fee_rate(1), MIN_RELAY_FEE_RATE);
    }
}
