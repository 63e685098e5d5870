//! Node configuration
//!
//! Layered loading: an optional `Escrow.toml` file overridden by
//! `ESCROW_`-prefixed environment variables. Every field has a
//! development default; production deployments must set `production`
//! and a vault key or startup fails.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{error::EscrowError, network::RestNetworkConfig, ratelimit::RateLimitConfig, EscrowResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowNodeConfig {
    /// Production mode: requires a vault key, refuses direct locks
    pub production: bool,
    /// Directory holding the LMDB ledger
    pub ledger_path: PathBuf,
    /// 32-byte vault key, hex-encoded
    pub vault_key_hex: Option<String>,
    /// Deadline for a fresh escrow, in hours
    pub default_expiry_hours: i64,
    /// Deadline extension applied on lock, in hours
    pub lock_extension_hours: i64,
    /// Maximum escrow amount in minor units
    pub max_amount_msat: u64,
    /// Identity proof freshness window, in seconds
    pub identity_freshness_secs: i64,
    pub rate_limit: RateLimitConfig,
    pub network: RestNetworkConfig,
}

impl Default for EscrowNodeConfig {
    fn default() -> Self {
        Self {
            production: false,
            ledger_path: PathBuf::from("./escrow-ledger"),
            vault_key_hex: None,
            default_expiry_hours: 72,
            lock_extension_hours: 72,
            max_amount_msat: 10_000_000_000, // 0.1 BTC
            identity_freshness_secs: 60,
            rate_limit: RateLimitConfig::default(),
            network: RestNetworkConfig::default(),
        }
    }
}

impl EscrowNodeConfig {
    /// Load configuration from `Escrow.toml` (if present) and the
    /// environment.
    pub fn load() -> EscrowResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("Escrow").required(false))
            .add_source(config::Environment::with_prefix("ESCROW").separator("__"))
            .build()
            .map_err(|e| EscrowError::config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| EscrowError::config(e.to_string()))
    }
}
