//! Network definitions and known token deployments.
//!
//! This module defines the supported networks and their chain IDs,
//! and provides statically known USDC deployments per network.

use alloy::primitives::{Address, address};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Supported Ethereum-compatible networks.
///
/// The broker operates on a single selected network at a time; the selection
/// is part of the persisted state and applies process-wide.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Base mainnet (chain ID 8453).
    #[serde(rename = "base")]
    Base,
    /// Base Sepolia testnet (chain ID 84532).
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Base => write!(f, "base"),
            Network::BaseSepolia => write!(f, "base-sepolia"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown network {0:?}, expected \"base\" or \"base-sepolia\"")]
pub struct UnknownNetworkError(pub String);

impl FromStr for Network {
    type Err = UnknownNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(Network::Base),
            "base-sepolia" => Ok(Network::BaseSepolia),
            other => Err(UnknownNetworkError(other.to_string())),
        }
    }
}

impl Network {
    /// Return the numeric chain ID associated with the network.
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Base => 8453,
            Network::BaseSepolia => 84532,
        }
    }

    /// Return the CAIP-2 identifier for the network, e.g. `eip155:8453`.
    pub fn caip2(&self) -> &'static str {
        match self {
            Network::Base => "eip155:8453",
            Network::BaseSepolia => "eip155:84532",
        }
    }

    /// Resolve a CAIP-2 identifier back to a known network.
    pub fn from_caip2(caip2: &str) -> Option<Network> {
        Network::variants()
            .iter()
            .copied()
            .find(|network| network.caip2() == caip2)
    }

    /// Default public RPC endpoint for the network.
    pub fn rpc_url(&self) -> &'static str {
        match self {
            Network::Base => "https://mainnet.base.org",
            Network::BaseSepolia => "https://sepolia.base.org",
        }
    }

    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[Network::Base, Network::BaseSepolia]
    }
}

/// A known USDC deployment on one of the supported networks.
///
/// Carries everything needed to talk to the token contract and to build the
/// EIP-712 domain for ERC-3009 authorizations: the domain `name` differs
/// between mainnet and Sepolia while `version` is "2" on both.
#[derive(Clone, Debug)]
pub struct USDCDeployment {
    pub network: Network,
    pub address: Address,
    pub decimals: u8,
    pub eip712_name: &'static str,
    pub eip712_version: &'static str,
}

/// Lazily initialized known USDC deployment on Base mainnet.
static USDC_BASE: Lazy<USDCDeployment> = Lazy::new(|| USDCDeployment {
    network: Network::Base,
    address: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
    decimals: 6,
    eip712_name: "USD Coin",
    eip712_version: "2",
});

/// Lazily initialized known USDC deployment on Base Sepolia.
static USDC_BASE_SEPOLIA: Lazy<USDCDeployment> = Lazy::new(|| USDCDeployment {
    network: Network::BaseSepolia,
    address: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
    decimals: 6,
    eip712_name: "USDC",
    eip712_version: "2",
});

impl USDCDeployment {
    /// Return the known USDC deployment for the given network.
    pub fn by_network<N: Borrow<Network>>(network: N) -> &'static USDCDeployment {
        match network.borrow() {
            Network::Base => &USDC_BASE,
            Network::BaseSepolia => &USDC_BASE_SEPOLIA,
        }
    }
}
