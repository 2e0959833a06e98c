use chrono::{DateTime, Utc};
use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use super::transaction::Transaction;

/// Previous-hash sentinel carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Nonces handed to the thread pool per round of parallel mining
const NONCE_BATCH: u64 = 1 << 16;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Timestamp when the block was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// Transactions in validation order
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Proof of work search counter
    pub nonce: u64,

    /// Hash of the current block
    pub hash: String,
}

impl Block {
    /// Creates a new, unmined block stamped with the current time
    pub fn new(transactions: Vec<Transaction>, previous_hash: String) -> Self {
        Self::with_timestamp(Utc::now(), transactions, previous_hash)
    }

    /// Creates a new, unmined block with an explicit timestamp
    pub fn with_timestamp(
        timestamp: DateTime<Utc>,
        transactions: Vec<Transaction>,
        previous_hash: String,
    ) -> Self {
        let mut block = Block {
            timestamp,
            transactions,
            previous_hash,
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Creates the genesis block. It is never mined: its hash is accepted as-is.
    pub fn genesis(timestamp: DateTime<Utc>, transactions: Vec<Transaction>) -> Self {
        Self::with_timestamp(timestamp, transactions, GENESIS_PREVIOUS_HASH.to_string())
    }

    /// Calculates the hash of the block
    ///
    /// SHA-256 over `previous_hash ‖ timestamp ‖ transactions-as-JSON ‖ nonce`,
    /// returned as lowercase hex.
    pub fn calculate_hash(&self) -> String {
        digest(&self.hash_prefix(), self.nonce)
    }

    /// Everything that goes into the hash except the nonce
    fn hash_prefix(&self) -> String {
        // A Vec of plain derived structs always serializes to JSON.
        let transactions = serde_json::to_string(&self.transactions)
            .expect("transaction list serializes to JSON");

        format!(
            "{}{}{}",
            self.previous_hash,
            self.timestamp.timestamp_millis(),
            transactions
        )
    }

    /// Increments the nonce until the hash has `difficulty` leading zeros.
    ///
    /// Returns the number of nonces tried. Difficulty 0 returns immediately.
    pub fn mine(&mut self, difficulty: usize) -> u64 {
        let prefix = self.hash_prefix();
        let mut iterations = 0u64;

        while !meets_difficulty(&self.hash, difficulty) {
            self.nonce += 1;
            iterations += 1;
            self.hash = digest(&prefix, self.nonce);
        }

        info!(
            "Block mined! Timestamp: {} | Hash: {} ({} iterations)",
            self.timestamp.to_rfc3339(),
            self.hash,
            iterations
        );

        iterations
    }

    /// Same search as [`Block::mine`], spread over the rayon thread pool.
    ///
    /// Nonces are scanned in ascending batches and the lowest qualifying nonce
    /// of a batch wins, so the result is identical to sequential mining.
    pub fn mine_parallel(&mut self, difficulty: usize) -> u64 {
        let start_nonce = self.nonce;

        if !meets_difficulty(&self.hash, difficulty) {
            let prefix = self.hash_prefix();
            let mut batch_start = start_nonce + 1;

            let nonce = loop {
                let batch_end = batch_start.saturating_add(NONCE_BATCH);
                let found = (batch_start..batch_end)
                    .into_par_iter()
                    .find_first(|nonce| meets_difficulty(&digest(&prefix, *nonce), difficulty));

                match found {
                    Some(nonce) => break nonce,
                    None => batch_start = batch_end,
                }
            };

            self.nonce = nonce;
            self.hash = digest(&prefix, nonce);
        }

        let iterations = self.nonce - start_nonce;
        info!(
            "Block mined in parallel! Timestamp: {} | Hash: {} ({} iterations)",
            self.timestamp.to_rfc3339(),
            self.hash,
            iterations
        );

        iterations
    }
}

/// Checks that the first `difficulty` hex characters of `hash` are all `'0'`
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

fn digest(prefix: &str, nonce: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
