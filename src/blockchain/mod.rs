// Blockchain module
//
// This module contains the ledger engine:
// - Block structure and proof of work
// - Ledger (chain, pending pool, airdrops, balances)
// - Transaction structure
// - Cryptography utilities
// - Configuration
// - Disk persistence

pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, IntegrityError, Rejection};
pub use config::{BlockRewardSchedule, LedgerConfig, Premine, RewardPolicy};
pub use crypto::{Address, DigitalSignature, Wallet};
pub use transaction::{Transaction, TransactionKind};
