//! Mining module: proof of work, block assembly and transaction pooling

pub mod backend;
pub mod fee_estimator;
pub mod mempool;
pub mod pow;

pub use backend::{CpuMiningBackend, MineResult, MiningBackend};
pub use fee_estimator::{FeeEstimates, FeeEstimator, FeeRate};
pub use mempool::{Mempool, MempoolEntry, MempoolError, MempoolStats};
pub use pow::{block_work, chain_work, ChainWork, MiningStats, PowEngine, PowError};
