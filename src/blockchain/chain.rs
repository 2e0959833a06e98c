use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use log::{debug, info, log, warn, Level};
use thiserror::Error;

use super::block::Block;
use super::config::{ConfigError, LedgerConfig, RewardPolicy};
use super::crypto::Address;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Transaction, TransactionError};

/// Genesis recipient when no premine is configured
pub const NULL_ADDRESS: &str = "0";

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid chain: {0}")]
    InvalidChain(#[from] IntegrityError),

    #[error("Stored genesis block {stored} does not match the configured genesis {configured}")]
    GenesisMismatch { stored: String, configured: String },
}

/// Why a transaction was kept out of the pool or out of a block
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("Transaction must include the sender's and the recipient's addresses")]
    MissingAddress,

    #[error("System transactions can only be issued by the ledger")]
    SystemTransaction,

    #[error("Invalid amount {amount} with fee {fee}")]
    InvalidAmount { amount: f64, fee: f64 },

    #[error("Fee {fee} is below the minimum fee of {minimum}")]
    FeeBelowMinimum { fee: f64, minimum: f64 },

    #[error("Not enough money to confirm transaction: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("No signature found")]
    MissingSignature,

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

/// First inconsistency found while walking the chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("Block {height} hash does not match its contents")]
    HashMismatch { height: usize },

    #[error("Block {height} does not link to the hash of its predecessor")]
    BrokenLink { height: usize },
}

/// The ledger: an append-only chain of blocks plus the pool of pending
/// transactions.
///
/// Balances are never stored; every query replays the chain from genesis.
/// The ledger is not internally synchronized: share it behind a mutex and
/// keep one mining or validation call in flight at a time.
#[derive(Debug)]
pub struct Blockchain {
    /// The chain of blocks, genesis first
    chain: Vec<Block>,

    /// Pending transactions to be included in the next block
    pending_transactions: Vec<Transaction>,

    /// Wallets taking part in airdrops, in registration order
    registered_addresses: Vec<Address>,

    /// Current block reward
    block_reward: f64,

    config: LedgerConfig,

    /// Storage for blockchain data
    storage: Option<BlockchainStorage>,
}

impl Blockchain {
    /// Creates a new in-memory blockchain with a genesis block
    ///
    /// # Errors
    ///
    /// Fails fast on an invalid configuration.
    pub fn new(config: LedgerConfig) -> Result<Self, BlockchainError> {
        config.validate()?;
        let genesis = Self::create_genesis_block(&config)?;

        let blockchain = Blockchain {
            chain: vec![genesis],
            pending_transactions: Vec::new(),
            registered_addresses: Vec::new(),
            block_reward: config.initial_block_reward,
            config,
            storage: None,
        };
        log!(blockchain.verbosity(), "Created genesis block {}", blockchain.latest_block().hash);

        Ok(blockchain)
    }

    /// Creates a blockchain backed by a sled database at `storage_path`.
    ///
    /// A stored chain is reloaded and integrity-checked; an empty database is
    /// seeded with a fresh genesis block.
    pub fn with_storage<P: AsRef<Path>>(
        config: LedgerConfig,
        storage_path: P,
    ) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::new(storage_path)?;
        let mut blockchain = Self::new(config)?;

        if storage.block_count() == 0 {
            info!("No existing blockchain found in storage, storing genesis block");
            storage.save_block(0, blockchain.latest_block())?;
            storage.flush()?;
        } else {
            let stored_blocks = storage.get_all_blocks()?;
            let configured = &blockchain.chain[0];
            if stored_blocks[0].hash != configured.hash {
                return Err(BlockchainError::GenesisMismatch {
                    stored: stored_blocks[0].hash.clone(),
                    configured: configured.hash.clone(),
                });
            }

            blockchain.chain = stored_blocks;
            blockchain.validate_chain()?;

            blockchain.registered_addresses = storage.get_registered_addresses()?;
            blockchain.block_reward = blockchain.config.block_reward_schedule.reward_for(
                blockchain.registered_addresses.len(),
                blockchain.config.initial_block_reward,
            );

            info!(
                "Loaded {} blocks from storage: height {}, {} registered wallets",
                storage.block_count(),
                blockchain.block_height(),
                blockchain.registered_addresses.len()
            );
        }

        blockchain.storage = Some(storage);
        Ok(blockchain)
    }

    /// Builds the genesis block: one minting transaction carrying the premine
    /// (or nothing), stamped with the configured genesis timestamp.
    ///
    /// The genesis block is not mined; its hash does not have to meet the
    /// difficulty target.
    fn create_genesis_block(config: &LedgerConfig) -> Result<Block, ConfigError> {
        let timestamp = config.genesis_timestamp()?;

        let (recipient, amount) = match config.premine_allocation() {
            Some((address, amount)) => (address.clone(), amount),
            None => (Address::from(NULL_ADDRESS), 0.0),
        };

        let premine = Transaction::reward(recipient, amount).with_timestamp(timestamp);
        Ok(Block::genesis(timestamp, vec![premine]))
    }

    /// Level for routine diagnostics
    fn verbosity(&self) -> Level {
        if self.config.verbose {
            Level::Info
        } else {
            Level::Debug
        }
    }

    /// Adds a wallet to the airdrop list and recomputes the block reward.
    ///
    /// Returns `false` if the wallet was already registered.
    pub fn register_wallet(&mut self, address: Address) -> Result<bool, BlockchainError> {
        if self.registered_addresses.contains(&address) {
            log!(self.verbosity(), "{} already registered", address);
            return Ok(false);
        }

        let mut registered = self.registered_addresses.clone();
        registered.push(address);

        if let Some(storage) = &self.storage {
            storage.save_registered_addresses(&registered)?;
            storage.flush()?;
        }

        self.registered_addresses = registered;
        self.block_reward = self
            .config
            .block_reward_schedule
            .reward_for(self.registered_addresses.len(), self.block_reward);

        log!(
            self.verbosity(),
            "{} successfully registered! Block reward is now {}",
            self.registered_addresses[self.registered_addresses.len() - 1],
            self.block_reward
        );

        Ok(true)
    }

    /// Queues one airdrop transaction per registered wallet, splitting the
    /// block reward evenly. Returns the number of transactions queued.
    pub fn airdrop(&mut self) -> usize {
        if self.registered_addresses.is_empty() {
            info!("No wallets registered! No coins will be airdropped.");
            return 0;
        }

        let coins_per_wallet = self.block_reward / self.registered_addresses.len() as f64;
        info!(
            "Every registered address will receive {} coins",
            coins_per_wallet
        );

        for address in &self.registered_addresses {
            self.pending_transactions
                .push(Transaction::airdrop(address.clone(), coins_per_wallet));
        }

        self.registered_addresses.len()
    }

    /// Checks a transaction against the current chain state.
    ///
    /// System transactions always pass. Transfers need a fee of at least the
    /// minimum, a replayed sender balance covering amount + fee, and a valid
    /// signature.
    pub fn check_transaction(&self, transaction: &Transaction) -> Result<(), Rejection> {
        match transaction.sender() {
            Some(sender) => self.check_transfer(transaction, self.get_balance(sender)),
            None => Ok(()),
        }
    }

    fn check_transfer(&self, transaction: &Transaction, available: f64) -> Result<(), Rejection> {
        let amounts_valid = transaction.amount.is_finite()
            && transaction.amount >= 0.0
            && transaction.fee.is_finite()
            && transaction.fee >= 0.0;
        if !amounts_valid {
            return Err(Rejection::InvalidAmount {
                amount: transaction.amount,
                fee: transaction.fee,
            });
        }

        if transaction.fee < self.config.minimum_fee {
            return Err(Rejection::FeeBelowMinimum {
                fee: transaction.fee,
                minimum: self.config.minimum_fee,
            });
        }

        if available < transaction.total_amount() {
            return Err(Rejection::InsufficientFunds {
                required: transaction.total_amount(),
                available,
            });
        }

        match transaction.verify() {
            Ok(true) => Ok(()),
            Ok(false) => Err(Rejection::InvalidSignature(
                "signature does not match sender".to_string(),
            )),
            Err(TransactionError::MissingSignature) => Err(Rejection::MissingSignature),
            Err(err) => Err(Rejection::InvalidSignature(err.to_string())),
        }
    }

    /// Boolean form of [`Blockchain::check_transaction`]; logs the reason on rejection
    pub fn validate_transaction(&self, transaction: &Transaction) -> bool {
        match self.check_transaction(transaction) {
            Ok(()) => true,
            Err(reason) => {
                warn!("Transaction rejected: {}", reason);
                false
            }
        }
    }

    /// Validates a user transaction and adds it to the pending pool.
    ///
    /// Identical transactions are not deduplicated.
    pub fn submit_transaction(&mut self, transaction: Transaction) -> Result<Transaction, Rejection> {
        if transaction.sender_label().is_empty() || transaction.recipient().is_empty() {
            warn!("Cannot add transaction: {}", Rejection::MissingAddress);
            return Err(Rejection::MissingAddress);
        }

        if transaction.is_system() {
            warn!("Cannot add transaction: {}", Rejection::SystemTransaction);
            return Err(Rejection::SystemTransaction);
        }

        if let Err(reason) = self.check_transaction(&transaction) {
            warn!("Cannot add invalid transaction: {}", reason);
            return Err(reason);
        }

        log!(
            self.verbosity(),
            "Transaction {} added with {} coin fee",
            self.pending_transactions.len(),
            transaction.fee
        );
        self.pending_transactions.push(transaction.clone());

        Ok(transaction)
    }

    /// Mines the pending pool into a new block and pays `miner_address`.
    ///
    /// Runs the scheduled airdrop first, drops invalid pending transactions,
    /// appends the mined block and resets the pool to the miner's reward
    /// transaction. Business-rule violations never fail this call; only
    /// storage errors do.
    pub fn mine_block(&mut self, miner_address: &Address) -> Result<Block, BlockchainError> {
        self.mine_pending(miner_address, false)
    }

    /// Mines a block on behalf of an airdrop; never triggers another airdrop
    pub fn mine_airdrop_block(&mut self, miner_address: &Address) -> Result<Block, BlockchainError> {
        self.mine_pending(miner_address, true)
    }

    fn mine_pending(
        &mut self,
        miner_address: &Address,
        mined_by_airdrop: bool,
    ) -> Result<Block, BlockchainError> {
        let height = self.chain.len();
        // Pool length before this round's airdrop, restored if the block cannot be stored
        let pool_len = self.pending_transactions.len();

        if !mined_by_airdrop && self.airdrop_due(height) {
            self.airdrop();
        }

        let mut validated_transactions = Vec::with_capacity(self.pending_transactions.len());
        let mut collected_fees = 0.0;
        // Outflows already selected for this block, per sender
        let mut spent: HashMap<Address, f64> = HashMap::new();

        for transaction in &self.pending_transactions {
            match transaction.sender() {
                None => {
                    log!(
                        self.verbosity(),
                        "Transaction validated: {} received {} coins ({})",
                        transaction.recipient(),
                        transaction.amount,
                        transaction.sender_label()
                    );
                }
                Some(sender) => {
                    let already_spent = spent.get(sender).copied().unwrap_or(0.0);
                    let available = self.get_balance(sender) - already_spent;

                    if let Err(reason) = self.check_transfer(transaction, available) {
                        warn!(
                            "Invalid transaction found: {} tried to send {} coins to {}: {}",
                            sender,
                            transaction.amount,
                            transaction.recipient(),
                            reason
                        );
                        continue;
                    }

                    *spent.entry(sender.clone()).or_insert(0.0) += transaction.total_amount();
                    log!(
                        self.verbosity(),
                        "Transaction validated: {} sent {} coins to {}",
                        sender,
                        transaction.amount,
                        transaction.recipient()
                    );
                }
            }

            collected_fees += transaction.fee;
            validated_transactions.push(transaction.clone());
        }

        let mut block = Block::new(validated_transactions, self.latest_block().hash.clone());
        if self.config.parallel_mining {
            block.mine_parallel(self.config.difficulty);
        } else {
            block.mine(self.config.difficulty);
        }

        // Store first so memory never runs ahead of disk
        if let Some(storage) = &self.storage {
            let stored = storage
                .save_block(height as u64, &block)
                .and_then(|_| storage.flush());
            if let Err(err) = stored {
                self.pending_transactions.truncate(pool_len);
                return Err(err.into());
            }
        }
        self.chain.push(block.clone());

        let miner_reward = match self.config.reward_policy {
            RewardPolicy::Fees => collected_fees,
            RewardPolicy::Fixed => self.block_reward,
            RewardPolicy::FixedPlusFees => self.block_reward + collected_fees,
        };
        info!(
            "Block {} added, miner {} will receive {} coins as reward",
            height, miner_address, miner_reward
        );
        self.pending_transactions = vec![Transaction::reward(miner_address.clone(), miner_reward)];

        Ok(block)
    }

    fn airdrop_due(&self, height: usize) -> bool {
        match self.config.airdrop_interval_blocks {
            Some(interval) => height as u64 % interval == 0,
            None => false,
        }
    }

    /// Replays the whole chain: debits amount + fee for every transfer sent
    /// by `address`, credits amount for every transaction it receives.
    pub fn get_balance(&self, address: &Address) -> f64 {
        let mut balance = 0.0;

        for block in &self.chain {
            for transaction in &block.transactions {
                if transaction.sender() == Some(address) {
                    balance -= transaction.total_amount();
                }

                if transaction.recipient() == address {
                    balance += transaction.amount;
                }
            }
        }

        balance
    }

    /// Balances of every address seen on the chain, in one replay
    pub fn balances(&self) -> BTreeMap<Address, f64> {
        let mut balances = BTreeMap::new();

        for transaction in self.chain.iter().flat_map(|block| &block.transactions) {
            if let Some(sender) = transaction.sender() {
                *balances.entry(sender.clone()).or_insert(0.0) -= transaction.total_amount();
            }
            *balances.entry(transaction.recipient().clone()).or_insert(0.0) += transaction.amount;
        }

        balances
    }

    /// Walks the chain from height 1 and reports the first block whose stored
    /// hash is stale or whose previous-hash link is broken. Genesis is never
    /// checked.
    pub fn validate_chain(&self) -> Result<(), IntegrityError> {
        let tip = self.block_height();

        for (index, pair) in self.chain.windows(2).enumerate() {
            let height = index + 1;
            let (previous_block, current_block) = (&pair[0], &pair[1]);
            debug!("Checking block {}/{}", height, tip);

            if current_block.hash != current_block.calculate_hash() {
                return Err(IntegrityError::HashMismatch { height });
            }

            if current_block.previous_hash != previous_block.hash {
                return Err(IntegrityError::BrokenLink { height });
            }
        }

        Ok(())
    }

    /// Validates the blockchain
    pub fn is_chain_valid(&self) -> bool {
        match self.validate_chain() {
            Ok(()) => {
                log!(
                    self.verbosity(),
                    "Blockchain is valid ({} blocks checked)",
                    self.block_height()
                );
                true
            }
            Err(err) => {
                warn!("Blockchain is corrupt or damaged: {}", err);
                false
            }
        }
    }

    /// Gets the last block in the chain
    pub fn latest_block(&self) -> &Block {
        self.chain
            .last()
            .expect("chain always contains the genesis block")
    }

    /// Height of the tip; genesis is height 0
    pub fn block_height(&self) -> usize {
        self.chain.len() - 1
    }

    pub fn block_at_height(&self, height: usize) -> Option<&Block> {
        self.chain.get(height)
    }

    /// Gets the entire blockchain
    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Gets all pending transactions
    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.pending_transactions
    }

    pub fn registered_addresses(&self) -> &[Address] {
        &self.registered_addresses
    }

    pub fn block_reward(&self) -> f64 {
        self.block_reward
    }

    pub fn difficulty(&self) -> usize {
        self.config.difficulty
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::config::{BlockRewardSchedule, Premine};
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::transaction::TransactionKind;

    const EPSILON: f64 = 1e-9;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < EPSILON,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    fn test_config() -> LedgerConfig {
        LedgerConfig {
            difficulty: 1,
            ..LedgerConfig::default()
        }
    }

    fn premined_config(wallet: &Wallet, amount: f64) -> LedgerConfig {
        LedgerConfig {
            premine: Some(Premine {
                address: Some(wallet.address().clone()),
                amount,
            }),
            airdrop_interval_blocks: None,
            ..test_config()
        }
    }

    fn signed_transfer(from: &Wallet, to: &Address, amount: f64, fee: f64) -> Transaction {
        let mut transaction = Transaction::transfer(from.address().clone(), to.clone(), amount, fee);
        transaction.sign(from).unwrap();
        transaction
    }

    #[test]
    fn test_new_blockchain() {
        let blockchain = Blockchain::new(test_config()).unwrap();

        assert_eq!(blockchain.block_height(), 0);
        assert_eq!(blockchain.chain().len(), 1);
        assert!(blockchain.pending_transactions().is_empty());

        let genesis = blockchain.latest_block();
        assert_eq!(genesis.previous_hash, "0");
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_system());
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let config = LedgerConfig {
            difficulty: 4,
            ..LedgerConfig::default()
        };
        let a = Blockchain::new(config.clone()).unwrap();
        let b = Blockchain::new(config).unwrap();

        assert_eq!(a.latest_block().hash, b.latest_block().hash);
        assert_eq!(a.latest_block().timestamp.timestamp(), 1_556_735_351);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = LedgerConfig {
            airdrop_interval_blocks: Some(0),
            ..LedgerConfig::default()
        };
        assert!(matches!(
            Blockchain::new(config),
            Err(BlockchainError::Config(ConfigError::ZeroAirdropInterval))
        ));
    }

    #[test]
    fn test_premine_balance() {
        let wallet = Wallet::generate();
        let blockchain = Blockchain::new(premined_config(&wallet, 1000.0)).unwrap();

        assert_close(blockchain.get_balance(wallet.address()), 1000.0);
        assert_eq!(
            blockchain.get_balance(wallet.address()),
            blockchain.get_balance(wallet.address())
        );
    }

    #[test]
    fn test_register_wallet() {
        let mut blockchain = Blockchain::new(test_config()).unwrap();
        let a = Wallet::generate();
        let b = Wallet::generate();

        assert_eq!(blockchain.block_reward(), 1.0);
        assert!(blockchain.register_wallet(a.address().clone()).unwrap());
        assert_eq!(blockchain.block_reward(), 1.0);

        assert!(!blockchain.register_wallet(a.address().clone()).unwrap());
        assert_eq!(blockchain.registered_addresses().len(), 1);

        assert!(blockchain.register_wallet(b.address().clone()).unwrap());
        assert_eq!(blockchain.block_reward(), 2.0);
        assert_eq!(
            blockchain.registered_addresses(),
            &[a.address().clone(), b.address().clone()]
        );
    }

    #[test]
    fn test_constant_block_reward() {
        let config = LedgerConfig {
            block_reward_schedule: BlockRewardSchedule::Constant(75.0),
            ..test_config()
        };
        let mut blockchain = Blockchain::new(config).unwrap();

        blockchain.register_wallet(Address::from("a")).unwrap();
        blockchain.register_wallet(Address::from("b")).unwrap();
        assert_eq!(blockchain.block_reward(), 75.0);
    }

    #[test]
    fn test_airdrop_without_wallets() {
        let mut blockchain = Blockchain::new(test_config()).unwrap();

        assert_eq!(blockchain.airdrop(), 0);
        assert!(blockchain.pending_transactions().is_empty());
    }

    #[test]
    fn test_airdrop_splits_block_reward() {
        let mut blockchain = Blockchain::new(test_config()).unwrap();
        blockchain.register_wallet(Address::from("a")).unwrap();
        blockchain.register_wallet(Address::from("b")).unwrap();

        assert_eq!(blockchain.airdrop(), 2);

        let pending = blockchain.pending_transactions();
        assert_eq!(pending.len(), 2);
        for (transaction, address) in pending.iter().zip(["a", "b"]) {
            assert_eq!(
                transaction.kind,
                TransactionKind::Airdrop {
                    recipient: Address::from(address)
                }
            );
            assert_eq!(transaction.amount, 1.0);
        }
    }

    #[test]
    fn test_end_to_end_transfer() {
        let mut blockchain = Blockchain::new(test_config()).unwrap();
        let a = Wallet::generate();
        let b = Wallet::generate();
        blockchain.register_wallet(a.address().clone()).unwrap();
        blockchain.register_wallet(b.address().clone()).unwrap();

        // Each block airdrops 2 coins split between the two wallets
        blockchain.mine_block(a.address()).unwrap();
        assert_eq!(blockchain.block_height(), 1);
        assert_close(blockchain.get_balance(a.address()), 1.0);
        assert_close(blockchain.get_balance(b.address()), 1.0);

        blockchain.mine_block(a.address()).unwrap();
        let prior_balance = blockchain.get_balance(a.address());
        assert_close(prior_balance, 2.0);

        let transfer = signed_transfer(&a, b.address(), 1.0, 0.1);
        blockchain.submit_transaction(transfer.clone()).unwrap();
        let block = blockchain.mine_block(a.address()).unwrap();

        assert!(block.transactions.contains(&transfer));
        assert!(block.hash.starts_with('0'));
        assert_close(blockchain.get_balance(a.address()), prior_balance - 1.0 - 0.1 + 1.0);
        assert_close(blockchain.get_balance(b.address()), 4.0);

        // The fee comes back to the miner with the next block
        let pending = blockchain.pending_transactions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].recipient(), a.address());
        assert_close(pending[0].amount, 0.1);

        blockchain.mine_block(a.address()).unwrap();
        assert_close(blockchain.get_balance(a.address()), 3.0);
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_insufficient_funds_never_mined() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let mut blockchain = Blockchain::new(premined_config(&a, 5.0)).unwrap();

        let overspend = signed_transfer(&b, a.address(), 1.0, 0.1);
        assert_eq!(
            blockchain.submit_transaction(overspend.clone()),
            Err(Rejection::InsufficientFunds {
                required: 1.1,
                available: 0.0
            })
        );

        let too_much = signed_transfer(&a, b.address(), 5.0, 0.1);
        assert!(matches!(
            blockchain.submit_transaction(too_much.clone()),
            Err(Rejection::InsufficientFunds { .. })
        ));

        blockchain.mine_block(a.address()).unwrap();
        for block in blockchain.chain() {
            assert!(!block.transactions.contains(&overspend));
            assert!(!block.transactions.contains(&too_much));
        }
        assert_close(blockchain.get_balance(b.address()), 0.0);
    }

    #[test]
    fn test_fee_below_minimum() {
        let a = Wallet::generate();
        let mut blockchain = Blockchain::new(premined_config(&a, 5.0)).unwrap();

        let cheap = signed_transfer(&a, &Address::from("b"), 1.0, 0.01);
        assert_eq!(
            blockchain.submit_transaction(cheap),
            Err(Rejection::FeeBelowMinimum {
                fee: 0.01,
                minimum: 0.1
            })
        );
        assert!(blockchain.pending_transactions().is_empty());
    }

    #[test]
    fn test_missing_address_and_system_submissions() {
        let a = Wallet::generate();
        let mut blockchain = Blockchain::new(premined_config(&a, 5.0)).unwrap();

        let no_recipient = signed_transfer(&a, &Address::from(""), 1.0, 0.1);
        assert_eq!(
            blockchain.submit_transaction(no_recipient),
            Err(Rejection::MissingAddress)
        );

        let reward = Transaction::reward(a.address().clone(), 100.0);
        assert_eq!(
            blockchain.submit_transaction(reward),
            Err(Rejection::SystemTransaction)
        );
        assert!(blockchain.pending_transactions().is_empty());
    }

    #[test]
    fn test_unsigned_transfer_rejected() {
        let a = Wallet::generate();
        let mut blockchain = Blockchain::new(premined_config(&a, 5.0)).unwrap();

        let unsigned = Transaction::transfer(a.address().clone(), Address::from("b"), 1.0, 0.1);
        assert!(!blockchain.validate_transaction(&unsigned));
        assert_eq!(
            blockchain.submit_transaction(unsigned),
            Err(Rejection::MissingSignature)
        );
    }

    #[test]
    fn test_forged_transaction_excluded_from_block() {
        let owner = Wallet::generate();
        let thief = Wallet::generate();
        let mut blockchain = Blockchain::new(premined_config(&owner, 100.0)).unwrap();

        let mut forged = Transaction::transfer(
            owner.address().clone(),
            thief.address().clone(),
            50.0,
            0.1,
        );
        forged.signature = Some(thief.sign(forged.content_hash().as_bytes()));
        assert!(!forged.verify().unwrap());

        // Slip it past admission straight into the pool
        blockchain.pending_transactions.push(forged.clone());
        let block = blockchain.mine_block(thief.address()).unwrap();

        assert!(!block.transactions.contains(&forged));
        assert_close(blockchain.get_balance(thief.address()), 0.0);
        assert_close(blockchain.get_balance(owner.address()), 100.0);
    }

    #[test]
    fn test_block_never_overdraws_sender() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let mut blockchain = Blockchain::new(premined_config(&a, 10.0)).unwrap();

        let first = signed_transfer(&a, b.address(), 6.0, 0.1);
        let second = signed_transfer(&a, b.address(), 6.0, 0.2);
        blockchain.submit_transaction(first.clone()).unwrap();
        blockchain.submit_transaction(second.clone()).unwrap();
        assert_eq!(blockchain.pending_transactions().len(), 2);

        let block = blockchain.mine_block(a.address()).unwrap();
        assert!(block.transactions.contains(&first));
        assert!(!block.transactions.contains(&second));
        assert_close(blockchain.get_balance(a.address()), 3.9);
        assert_close(blockchain.get_balance(b.address()), 6.0);
    }

    #[test]
    fn test_difficulty_zero_does_not_search() {
        let config = LedgerConfig {
            difficulty: 0,
            ..LedgerConfig::default()
        };
        let mut blockchain = Blockchain::new(config).unwrap();

        let block = blockchain.mine_block(&Address::from("miner")).unwrap();
        assert_eq!(block.nonce, 0);
    }

    #[test]
    fn test_parallel_mining_config() {
        let config = LedgerConfig {
            difficulty: 2,
            parallel_mining: true,
            ..LedgerConfig::default()
        };
        let mut blockchain = Blockchain::new(config).unwrap();

        let block = blockchain.mine_block(&Address::from("miner")).unwrap();
        assert!(block.hash.starts_with("00"));
        assert!(blockchain.is_chain_valid());
    }

    #[test]
    fn test_reward_policies() {
        for (policy, expected) in [
            (RewardPolicy::Fees, 0.3),
            (RewardPolicy::Fixed, 50.0),
            (RewardPolicy::FixedPlusFees, 50.3),
        ] {
            let a = Wallet::generate();
            let config = LedgerConfig {
                reward_policy: policy,
                block_reward_schedule: BlockRewardSchedule::Constant(50.0),
                initial_block_reward: 50.0,
                ..premined_config(&a, 10.0)
            };
            let mut blockchain = Blockchain::new(config).unwrap();

            blockchain
                .submit_transaction(signed_transfer(&a, &Address::from("b"), 1.0, 0.3))
                .unwrap();
            blockchain.mine_block(a.address()).unwrap();

            let pending = blockchain.pending_transactions();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].recipient(), a.address());
            assert_close(pending[0].amount, expected);
        }
    }

    #[test]
    fn test_airdrop_interval() {
        let config = LedgerConfig {
            airdrop_interval_blocks: Some(3),
            ..test_config()
        };
        let mut blockchain = Blockchain::new(config).unwrap();
        let miner = Address::from("miner");
        blockchain.register_wallet(Address::from("a")).unwrap();

        let count_airdrops = |block: &Block| {
            block
                .transactions
                .iter()
                .filter(|tx| matches!(tx.kind, TransactionKind::Airdrop { .. }))
                .count()
        };

        assert_eq!(count_airdrops(&blockchain.mine_block(&miner).unwrap()), 0);
        assert_eq!(count_airdrops(&blockchain.mine_block(&miner).unwrap()), 0);
        assert_eq!(count_airdrops(&blockchain.mine_block(&miner).unwrap()), 1);
        assert_eq!(count_airdrops(&blockchain.mine_block(&miner).unwrap()), 0);
    }

    #[test]
    fn test_airdrop_block_skips_airdrop() {
        let mut blockchain = Blockchain::new(test_config()).unwrap();
        blockchain.register_wallet(Address::from("a")).unwrap();

        let block = blockchain.mine_airdrop_block(&Address::from("miner")).unwrap();
        assert!(block.transactions.is_empty());
        assert_close(blockchain.get_balance(&Address::from("a")), 0.0);
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut blockchain = Blockchain::new(test_config()).unwrap();
        let miner = Address::from("miner");
        blockchain.register_wallet(Address::from("a")).unwrap();
        for _ in 0..3 {
            blockchain.mine_block(&miner).unwrap();
        }
        assert!(blockchain.is_chain_valid());

        // Edit a stored transaction without touching the hash
        let mut tampered = Blockchain::new(test_config()).unwrap();
        tampered.chain = blockchain.chain.clone();
        tampered.chain[1].transactions[0].amount = 1000.0;
        assert_eq!(
            tampered.validate_chain(),
            Err(IntegrityError::HashMismatch { height: 1 })
        );
        assert!(!tampered.is_chain_valid());

        // Rehash the edited block: its successor no longer links to it
        tampered.chain[1].hash = tampered.chain[1].calculate_hash();
        assert_eq!(
            tampered.validate_chain(),
            Err(IntegrityError::BrokenLink { height: 2 })
        );
        assert!(!tampered.is_chain_valid());
    }

    #[test]
    fn test_supply_is_conserved() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let config = LedgerConfig {
            premine: Some(Premine {
                address: Some(a.address().clone()),
                amount: 100.0,
            }),
            ..test_config()
        };
        let mut blockchain = Blockchain::new(config).unwrap();
        blockchain.register_wallet(a.address().clone()).unwrap();
        blockchain.register_wallet(b.address().clone()).unwrap();

        for round in 0..4 {
            blockchain
                .submit_transaction(signed_transfer(&a, b.address(), 2.0, 0.1))
                .unwrap();
            if round % 2 == 1 {
                blockchain
                    .submit_transaction(signed_transfer(&b, a.address(), 1.0, 0.2))
                    .unwrap();
            }
            blockchain.mine_block(b.address()).unwrap();
        }

        let airdropped: f64 = blockchain
            .chain()
            .iter()
            .flat_map(|block| &block.transactions)
            .filter(|tx| matches!(tx.kind, TransactionKind::Airdrop { .. }))
            .map(|tx| tx.amount)
            .sum();
        let pending_rewards: f64 = blockchain
            .pending_transactions()
            .iter()
            .map(|tx| tx.amount)
            .sum();
        let held: f64 = blockchain.balances().values().sum();

        assert_close(held + pending_rewards, 100.0 + airdropped);

        let balances = blockchain.balances();
        assert_close(balances[a.address()], blockchain.get_balance(a.address()));
        assert_close(balances[b.address()], blockchain.get_balance(b.address()));
    }

    #[test]
    fn test_failed_block_write_leaves_ledger_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Address::from("miner");
        let mut blockchain = Blockchain::with_storage(test_config(), dir.path()).unwrap();
        blockchain.register_wallet(Address::from("a")).unwrap();
        blockchain.mine_block(&miner).unwrap();

        let chain_before = blockchain.chain().to_vec();
        let pending_before = blockchain.pending_transactions().to_vec();

        let storage = blockchain.storage.as_ref().unwrap();
        storage.set_reject_writes(true);
        assert!(matches!(
            blockchain.mine_block(&miner),
            Err(BlockchainError::Storage(_))
        ));
        assert_eq!(blockchain.chain(), chain_before.as_slice());
        assert_eq!(blockchain.pending_transactions(), pending_before.as_slice());

        // The next block lands at the height that failed, leaving no gap on disk
        blockchain.storage.as_ref().unwrap().set_reject_writes(false);
        blockchain.mine_block(&miner).unwrap();
        assert_eq!(blockchain.block_height(), 2);
        drop(blockchain);

        let reloaded = Blockchain::with_storage(test_config(), dir.path()).unwrap();
        assert_eq!(reloaded.block_height(), 2);
        assert!(reloaded.is_chain_valid());
    }

    #[test]
    fn test_failed_registration_write_leaves_ledger_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut blockchain = Blockchain::with_storage(test_config(), dir.path()).unwrap();
        blockchain.register_wallet(Address::from("a")).unwrap();

        blockchain.storage.as_ref().unwrap().set_reject_writes(true);
        assert!(matches!(
            blockchain.register_wallet(Address::from("b")),
            Err(BlockchainError::Storage(_))
        ));
        assert_eq!(blockchain.registered_addresses(), &[Address::from("a")]);
        assert_eq!(blockchain.block_reward(), 1.0);
    }

    #[test]
    fn test_reload_rejects_different_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let premine_to = |recipient: &str| LedgerConfig {
            premine: Some(Premine {
                address: Some(Address::from(recipient)),
                amount: 100.0,
            }),
            ..test_config()
        };

        {
            let blockchain = Blockchain::with_storage(premine_to("alice"), dir.path()).unwrap();
            assert_close(blockchain.get_balance(&Address::from("alice")), 100.0);
        }

        assert!(matches!(
            Blockchain::with_storage(premine_to("bob"), dir.path()),
            Err(BlockchainError::GenesisMismatch { .. })
        ));

        let reloaded = Blockchain::with_storage(premine_to("alice"), dir.path()).unwrap();
        assert_close(reloaded.get_balance(&Address::from("alice")), 100.0);
    }

    #[test]
    fn test_reload_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Wallet::generate();
        let other = Wallet::generate();

        let (chain, pending_reward) = {
            let mut blockchain = Blockchain::with_storage(test_config(), dir.path()).unwrap();
            blockchain.register_wallet(miner.address().clone()).unwrap();
            blockchain.register_wallet(other.address().clone()).unwrap();
            blockchain.mine_block(miner.address()).unwrap();
            blockchain.mine_block(miner.address()).unwrap();
            (blockchain.chain().to_vec(), blockchain.pending_transactions().len())
        };
        assert_eq!(pending_reward, 1);

        let reloaded = Blockchain::with_storage(test_config(), dir.path()).unwrap();
        assert_eq!(reloaded.chain(), chain.as_slice());
        assert_eq!(reloaded.block_height(), 2);
        assert_eq!(
            reloaded.registered_addresses(),
            &[miner.address().clone(), other.address().clone()]
        );
        assert_eq!(reloaded.block_reward(), 2.0);
        assert!(reloaded.pending_transactions().is_empty());
        assert!(reloaded.is_chain_valid());
        assert_close(reloaded.get_balance(miner.address()), 2.0);
    }
}
