use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::Address;

/// SHA-256 hashes are 64 hex characters long
pub const MAX_DIFFICULTY: usize = 64;

/// Errors detected while building a ledger configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Difficulty {0} exceeds the hash length of {max} hex characters", max = MAX_DIFFICULTY)]
    DifficultyTooHigh(usize),

    #[error("Invalid amount for {field}: {value}")]
    InvalidAmount { field: &'static str, value: f64 },

    #[error("Premine address is required")]
    MissingPremineAddress,

    #[error("Airdrop interval must be at least one block")]
    ZeroAirdropInterval,

    #[error("Genesis timestamp out of range: {0}")]
    InvalidGenesisTimestamp(i64),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How the miner of a block is paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardPolicy {
    /// Sum of the fees collected in the block
    #[default]
    Fees,

    /// The current block reward, fees are not paid out
    Fixed,

    /// Block reward plus collected fees
    FixedPlusFees,
}

/// How the block reward reacts to wallet registrations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockRewardSchedule {
    /// Reward = per-address amount × number of registered wallets
    PerAddress(f64),

    /// Reward never changes
    Constant(f64),
}

impl Default for BlockRewardSchedule {
    fn default() -> Self {
        BlockRewardSchedule::PerAddress(1.0)
    }
}

impl BlockRewardSchedule {
    /// Block reward once `registered` wallets are known
    pub fn reward_for(&self, registered: usize, current: f64) -> f64 {
        match *self {
            BlockRewardSchedule::PerAddress(per_address) if registered > 0 => {
                per_address * registered as f64
            }
            BlockRewardSchedule::PerAddress(_) => current,
            BlockRewardSchedule::Constant(reward) => reward,
        }
    }
}

/// Initial allocation written into the genesis block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Premine {
    pub address: Option<Address>,
    pub amount: f64,
}

/// Ledger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Required leading zero hex characters in a mined block hash
    pub difficulty: usize,

    /// Fee floor for user transactions
    pub minimum_fee: f64,

    /// Genesis block timestamp, milliseconds since the Unix epoch
    pub genesis_timestamp_ms: i64,

    pub premine: Option<Premine>,

    /// Airdrop every N blocks, `None` disables airdrops
    pub airdrop_interval_blocks: Option<u64>,

    pub reward_policy: RewardPolicy,

    pub block_reward_schedule: BlockRewardSchedule,

    /// Block reward before any wallet registers
    pub initial_block_reward: f64,

    /// Search nonces on the rayon thread pool
    pub parallel_mining: bool,

    /// Log routine ledger events at info instead of debug
    pub verbose: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            difficulty: 2,
            minimum_fee: 0.1,
            genesis_timestamp_ms: 1_556_735_351_000,
            premine: None,
            airdrop_interval_blocks: Some(1),
            reward_policy: RewardPolicy::default(),
            block_reward_schedule: BlockRewardSchedule::default(),
            initial_block_reward: 1.0,
            parallel_mining: false,
            verbose: false,
        }
    }
}

impl LedgerConfig {
    /// Loads a JSON config file; missing fields fall back to defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: LedgerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every option, failing on the first invalid one
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::DifficultyTooHigh(self.difficulty));
        }

        check_amount("minimum_fee", self.minimum_fee)?;
        check_amount("initial_block_reward", self.initial_block_reward)?;

        match self.block_reward_schedule {
            BlockRewardSchedule::PerAddress(reward) | BlockRewardSchedule::Constant(reward) => {
                check_amount("block_reward_schedule", reward)?
            }
        }

        if let Some(premine) = &self.premine {
            check_amount("premine.amount", premine.amount)?;
            match &premine.address {
                Some(address) if !address.is_empty() => {}
                _ if premine.amount > 0.0 => return Err(ConfigError::MissingPremineAddress),
                _ => {}
            }
        }

        if self.airdrop_interval_blocks == Some(0) {
            return Err(ConfigError::ZeroAirdropInterval);
        }

        self.genesis_timestamp()?;

        Ok(())
    }

    pub fn genesis_timestamp(&self) -> Result<DateTime<Utc>, ConfigError> {
        Utc.timestamp_millis_opt(self.genesis_timestamp_ms)
            .single()
            .ok_or(ConfigError::InvalidGenesisTimestamp(self.genesis_timestamp_ms))
    }

    /// Premine recipient and amount, if one is configured
    pub fn premine_allocation(&self) -> Option<(&Address, f64)> {
        let premine = self.premine.as_ref()?;
        premine.address.as_ref().map(|address| (address, premine.amount))
    }
}

fn check_amount(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidAmount { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.genesis_timestamp().unwrap().timestamp(), 1_556_735_351);
    }

    #[test]
    fn test_rejects_invalid_options() {
        let config = LedgerConfig {
            difficulty: 65,
            ..LedgerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::DifficultyTooHigh(65))));

        let config = LedgerConfig {
            minimum_fee: -1.0,
            ..LedgerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAmount { .. })));

        let config = LedgerConfig {
            airdrop_interval_blocks: Some(0),
            ..LedgerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroAirdropInterval)));

        let config = LedgerConfig {
            genesis_timestamp_ms: i64::MAX,
            ..LedgerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGenesisTimestamp(_))
        ));
    }

    #[test]
    fn test_premine_requires_address() {
        let config = LedgerConfig {
            premine: Some(Premine {
                address: None,
                amount: 1000.0,
            }),
            ..LedgerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingPremineAddress)));

        let config = LedgerConfig {
            premine: Some(Premine {
                address: Some(Address::from("Genesis")),
                amount: 1000.0,
            }),
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(
            config.premine_allocation(),
            Some((&Address::from("Genesis"), 1000.0))
        );
    }

    #[test]
    fn test_block_reward_schedule() {
        let per_address = BlockRewardSchedule::PerAddress(1.0);
        assert_eq!(per_address.reward_for(0, 1.0), 1.0);
        assert_eq!(per_address.reward_for(3, 1.0), 3.0);

        let constant = BlockRewardSchedule::Constant(75.0);
        assert_eq!(constant.reward_for(10, 1.0), 75.0);
    }

    #[test]
    fn test_load_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"difficulty": 1, "minimum_fee": 0.5, "reward_policy": "fixed_plus_fees",
                "block_reward_schedule": {{"constant": 75.0}}, "airdrop_interval_blocks": 25}}"#
        )
        .unwrap();

        let config = LedgerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.difficulty, 1);
        assert_eq!(config.minimum_fee, 0.5);
        assert_eq!(config.reward_policy, RewardPolicy::FixedPlusFees);
        assert_eq!(config.block_reward_schedule, BlockRewardSchedule::Constant(75.0));
        assert_eq!(config.airdrop_interval_blocks, Some(25));
        assert!(!config.verbose);
    }

    #[test]
    fn test_invalid_json_file_fails_fast() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"airdrop_interval_blocks": 0}}"#).unwrap();

        assert!(matches!(
            LedgerConfig::from_json_file(file.path()),
            Err(ConfigError::ZeroAirdropInterval)
        ));
    }
}
