//! Supported Chains
//!
//! The closed set of EVM chains the custody core can track. A chain selects
//! the RPC client, the confirmation threshold and the storage partition.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Supported blockchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Ethereum,
    Polygon,
    Bsc,
    Arbitrum,
    Optimism,
}

/// Unknown chain identifier
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown chain: {0}")]
pub struct UnknownChain(pub String);

impl Chain {
    /// Every supported chain, in configuration order
    pub const ALL: [Chain; 5] = [
        Chain::Ethereum,
        Chain::Polygon,
        Chain::Bsc,
        Chain::Arbitrum,
        Chain::Optimism,
    ];

    /// Lower-case identifier used in storage and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Polygon => "polygon",
            Chain::Bsc => "bsc",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
        }
    }

    /// Prefix for per-chain environment variables (e.g. `POLYGON_RPC_URL`)
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ETHEREUM",
            Chain::Polygon => "POLYGON",
            Chain::Bsc => "BSC",
            Chain::Arbitrum => "ARBITRUM",
            Chain::Optimism => "OPTIMISM",
        }
    }

    /// Canonical EVM chain id for mainnet
    pub fn default_chain_id(&self) -> u64 {
        match self {
            Chain::Ethereum => 1,
            Chain::Polygon => 137,
            Chain::Bsc => 56,
            Chain::Arbitrum => 42161,
            Chain::Optimism => 10,
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = UnknownChain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ethereum" | "eth" => Ok(Chain::Ethereum),
            "polygon" | "matic" => Ok(Chain::Polygon),
            "bsc" | "bnb" => Ok(Chain::Bsc),
            "arbitrum" => Ok(Chain::Arbitrum),
            "optimism" => Ok(Chain::Optimism),
            _ => Err(UnknownChain(s.to_string())),
        }
    }
}
