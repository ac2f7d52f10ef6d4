use std::{fs, ops::Deref, path::PathBuf, str::FromStr, time::Duration};

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Websocket endpoint of the main chain. Must be `ws://` or `wss://` since the notary subscribes to new headers.
    pub rpc_url: String,
    /// Address of the sharding manager contract which keeps the notary pool, committee sampling and votes.
    pub smc_address: Address,
    /// Number of shards managed by the contract. Any sampled shard id must be below this.
    #[serde(default = "shard_count_default")]
    pub shard_count: u64,
    /// Number of main chain blocks in a period.
    #[serde(default = "period_length_default")]
    pub period_length: u64,
    /// Number of blocks, counted from the first block of a period, during which votes for that period are accepted.
    #[serde(default = "voting_window_default")]
    pub voting_window: u64,
    /// Value sent along with the pool join transaction, in Wei.
    #[serde(default = "notary_deposit_default")]
    pub notary_deposit: Amount,
    /// If false, the notary never sends a deposit itself and waits until one has been made for its address.
    #[serde(default = "default_true")]
    pub auto_deposit: bool,
    /// Retry schedule for deposit queries and the pool join transaction.
    #[serde(default = "chain_backoff_default")]
    pub deposit_backoff: BackoffConfig,
    /// Retry schedule for re-establishing the header subscription.
    #[serde(default = "chain_backoff_default")]
    pub resubscribe_backoff: BackoffConfig,
    /// Retry schedule for vote submission while the voting window is open.
    #[serde(default = "vote_backoff_default")]
    pub vote_backoff: BackoffConfig,
    /// How often a candidate header which is not yet available is requested again.
    #[serde(default = "candidate_poll_interval_default")]
    pub candidate_poll_interval: Duration,
    /// Number of times the committee query for a period is attempted before that period is given up.
    #[serde(default = "sampling_attempts_default")]
    pub sampling_attempts: u32,
    /// How long a sent transaction may stay unmined before it is treated as lost and the chain as unavailable.
    #[serde(default = "receipt_timeout_default")]
    pub receipt_timeout: Duration,
    /// How long stopping the service waits for in-flight votes before aborting them.
    #[serde(default = "stop_timeout_default")]
    pub stop_timeout: Duration,
    /// The base address of the OTLP collector. If not set, metrics will not be exported.
    #[serde(default)]
    pub otlp_collector_endpoint: Option<String>,
}

impl Config {
    /// A configuration with every optional field at its default.
    pub fn new(rpc_url: impl Into<String>, smc_address: Address) -> Self {
        Config {
            rpc_url: rpc_url.into(),
            smc_address,
            shard_count: shard_count_default(),
            period_length: period_length_default(),
            voting_window: voting_window_default(),
            notary_deposit: notary_deposit_default(),
            auto_deposit: true,
            deposit_backoff: chain_backoff_default(),
            resubscribe_backoff: chain_backoff_default(),
            vote_backoff: vote_backoff_default(),
            candidate_poll_interval: candidate_poll_interval_default(),
            sampling_attempts: sampling_attempts_default(),
            receipt_timeout: receipt_timeout_default(),
            stop_timeout: stop_timeout_default(),
            otlp_collector_endpoint: None,
        }
    }

    /// Reads and merges one or more TOML files. Each top level key may only be given once across all files.
    pub fn load(config_files: &[PathBuf]) -> Result<Self> {
        let mut merged_config = toml::Table::new();
        for config_file in config_files {
            let config = fs::read_to_string(config_file)?;
            let config: toml::Table = toml::from_str(&config)?;
            for key in config.keys() {
                if merged_config.contains_key(key) {
                    return Err(anyhow!(
                        "configuration conflict: {config_file:?} contained a key {key:?} that was already included in an earlier file"
                    ));
                }
            }
            merged_config.extend(config);
        }

        let config: Config = Deserialize::deserialize(merged_config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.period_length == 0 {
            return Err(anyhow!("period_length must be at least one block"));
        }
        if self.voting_window == 0 {
            return Err(anyhow!("voting_window must be at least one block"));
        }
        if self.shard_count == 0 {
            return Err(anyhow!("shard_count must be non-zero"));
        }
        if self.sampling_attempts == 0 {
            return Err(anyhow!("sampling_attempts must be non-zero"));
        }
        if self.receipt_timeout.is_zero() {
            return Err(anyhow!("receipt_timeout must be non-zero"));
        }
        for (name, backoff) in [
            ("deposit_backoff", &self.deposit_backoff),
            ("resubscribe_backoff", &self.resubscribe_backoff),
            ("vote_backoff", &self.vote_backoff),
        ] {
            if backoff.base > backoff.cap {
                return Err(anyhow!(
                    "{name}: base delay {:?} is larger than the cap {:?}",
                    backoff.base,
                    backoff.cap
                ));
            }
        }
        Ok(())
    }
}

/// Bounds of an exponential retry schedule. The delay starts at `base` and doubles after every failure, up to `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

pub fn shard_count_default() -> u64 {
    100
}

pub fn period_length_default() -> u64 {
    5
}

pub fn voting_window_default() -> u64 {
    3
}

pub fn notary_deposit_default() -> Amount {
    // 1000 ether
    Amount::from(1_000_000_000_000_000_000_000)
}

pub fn chain_backoff_default() -> BackoffConfig {
    BackoffConfig {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(30),
    }
}

pub fn vote_backoff_default() -> BackoffConfig {
    BackoffConfig {
        base: Duration::from_millis(500),
        cap: Duration::from_secs(5),
    }
}

pub fn candidate_poll_interval_default() -> Duration {
    Duration::from_secs(1)
}

pub fn sampling_attempts_default() -> u32 {
    3
}

pub fn receipt_timeout_default() -> Duration {
    Duration::from_secs(120)
}

pub fn stop_timeout_default() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}

/// Wrapper for [u128] that (de)serializes with a string. `serde_toml` does not support `u128`s.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Amount(pub u128);

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount(value)
    }
}

impl Deref for Amount {
    type Target = u128;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut res = String::deserialize(deserializer)?;
        // Remove underscores
        res.retain(|c| c != '_');
        Ok(Amount(
            u128::from_str(&res).map_err(serde::de::Error::custom)?,
        ))
    }
}
