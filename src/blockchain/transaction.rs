use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;

use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature, Wallet};

/// Sender label used in the content hash of block reward transactions
pub const BLOCK_MINTING_SENDER: &str = "BlockMinting";

/// Sender label used in the content hash of airdrop transactions
pub const AIRDROP_SENDER: &str = "Airdrop";

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Cannot sign for {sender}: key belongs to {signer}")]
    KeyMismatch { sender: Address, signer: Address },

    #[error("Transaction not signed")]
    MissingSignature,

    #[error("System transactions are not signed")]
    SystemTransaction,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Who moves value in a transaction.
///
/// Only transfers have a sender; rewards and airdrops are issued by the ledger
/// itself and carry no signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub enum TransactionKind {
    /// A signed transfer between two wallets
    Transfer { sender: Address, recipient: Address },

    /// Block minting: genesis premine or miner reward
    Reward { recipient: Address },

    /// A share of a ledger-wide airdrop
    Airdrop { recipient: Address },
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Transaction kind with its parties
    pub kind: TransactionKind,

    /// Amount being transferred
    pub amount: f64,

    /// Transaction fee (zero for system transactions)
    pub fee: f64,

    /// Digital signature over the content hash
    #[serde(default)]
    pub signature: Option<DigitalSignature>,

    /// Timestamp when the transaction was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Creates a new unsigned transfer
    pub fn transfer(sender: Address, recipient: Address, amount: f64, fee: f64) -> Self {
        Transaction {
            kind: TransactionKind::Transfer { sender, recipient },
            amount,
            fee,
            signature: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates a block minting transaction (premine or miner reward)
    pub fn reward(recipient: Address, amount: f64) -> Self {
        Self::system(TransactionKind::Reward { recipient }, amount)
    }

    /// Creates an airdrop transaction
    pub fn airdrop(recipient: Address, amount: f64) -> Self {
        Self::system(TransactionKind::Airdrop { recipient }, amount)
    }

    fn system(kind: TransactionKind, amount: f64) -> Self {
        Transaction {
            kind,
            amount,
            fee: 0.0,
            signature: None,
            timestamp: Utc::now(),
        }
    }

    /// Replaces the creation timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The sending wallet, if this is a transfer
    pub fn sender(&self) -> Option<&Address> {
        match &self.kind {
            TransactionKind::Transfer { sender, .. } => Some(sender),
            TransactionKind::Reward { .. } | TransactionKind::Airdrop { .. } => None,
        }
    }

    /// The sender as it appears in the content hash
    pub fn sender_label(&self) -> &str {
        match &self.kind {
            TransactionKind::Transfer { sender, .. } => sender.as_str(),
            TransactionKind::Reward { .. } => BLOCK_MINTING_SENDER,
            TransactionKind::Airdrop { .. } => AIRDROP_SENDER,
        }
    }

    pub fn recipient(&self) -> &Address {
        match &self.kind {
            TransactionKind::Transfer { recipient, .. }
            | TransactionKind::Reward { recipient }
            | TransactionKind::Airdrop { recipient } => recipient,
        }
    }

    /// Checks if the transaction was issued by the ledger itself
    pub fn is_system(&self) -> bool {
        self.sender().is_none()
    }

    /// Gets the total amount debited from the sender (amount + fee)
    pub fn total_amount(&self) -> f64 {
        self.amount + self.fee
    }

    /// SHA-256 over `timestamp ‖ sender ‖ recipient ‖ amount ‖ fee`, hex encoded.
    ///
    /// This is the message that gets signed. The timestamp is rendered as
    /// milliseconds since the Unix epoch.
    pub fn content_hash(&self) -> String {
        let content = format!(
            "{}{}{}{}{}",
            self.timestamp.timestamp_millis(),
            self.sender_label(),
            self.recipient(),
            self.amount,
            self.fee
        );

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Signs the transaction with a wallet
    ///
    /// # Errors
    ///
    /// `KeyMismatch` when the wallet does not own the sender address, and
    /// `SystemTransaction` for rewards and airdrops.
    pub fn sign(&mut self, wallet: &Wallet) -> Result<(), TransactionError> {
        let sender = self.sender().ok_or(TransactionError::SystemTransaction)?;

        if wallet.address() != sender {
            return Err(TransactionError::KeyMismatch {
                sender: sender.clone(),
                signer: wallet.address().clone(),
            });
        }

        let hash = self.content_hash();
        self.signature = Some(wallet.sign(hash.as_bytes()));

        Ok(())
    }

    /// Verifies the transaction's signature against the sender address
    ///
    /// System transactions are always valid. Transfers without a signature
    /// fail with `MissingSignature`.
    pub fn verify(&self) -> Result<bool, TransactionError> {
        let sender = match self.sender() {
            Some(sender) => sender,
            None => return Ok(true),
        };

        let signature = match &self.signature {
            Some(sig) if !sig.is_empty() => sig,
            _ => return Err(TransactionError::MissingSignature),
        };

        let public_key = sender.to_public_key()?;
        let hash = self.content_hash();

        verify_signature(hash.as_bytes(), signature, &public_key).map_err(TransactionError::from)
    }
}
