//! Wallet adapters: a uniform signer, balance, and address contract over
//! self-custodial, managed, and externally-signing wallets.
//!
//! Every adapter implements [`WalletAdapter`]; the broker and manager never
//! know which variant they hold. Managed providers (Privy, Coinbase CDP,
//! Crossmint) are optional integrations behind cargo features: when the
//! feature is compiled out, hydrating such a configuration fails with
//! *sdk-not-installed* and the uniform error reaches the agent unchanged.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::{self, ChainError};
use crate::network::Network;
use crate::proto::{EvmSignature, TransferRequest};

pub mod browser;
pub mod local_key;

#[cfg(feature = "coinbase-cdp")]
pub mod coinbase;
#[cfg(feature = "crossmint")]
pub mod crossmint;
#[cfg(feature = "privy")]
pub mod privy;

/// The adapter variants a wallet can be backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterKind {
    #[serde(rename = "local-key")]
    LocalKey,
    #[serde(rename = "privy")]
    Privy,
    #[serde(rename = "coinbase-cdp")]
    CoinbaseCdp,
    #[serde(rename = "crossmint")]
    Crossmint,
    #[serde(rename = "browser")]
    Browser,
}

impl Display for AdapterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterKind::LocalKey => "local-key",
            AdapterKind::Privy => "privy",
            AdapterKind::CoinbaseCdp => "coinbase-cdp",
            AdapterKind::Crossmint => "crossmint",
            AdapterKind::Browser => "browser",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown adapter kind {0:?}")]
pub struct UnknownAdapterKindError(pub String);

impl FromStr for AdapterKind {
    type Err = UnknownAdapterKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-key" => Ok(AdapterKind::LocalKey),
            "privy" => Ok(AdapterKind::Privy),
            "coinbase-cdp" => Ok(AdapterKind::CoinbaseCdp),
            "crossmint" => Ok(AdapterKind::Crossmint),
            "browser" => Ok(AdapterKind::Browser),
            other => Err(UnknownAdapterKindError(other.to_string())),
        }
    }
}

/// Persisted adapter configuration, one variant per wallet.
///
/// Round-trips through [`WalletAdapter::serialize`] so provisioning results
/// (generated keys, provider wallet ids, resolved addresses) survive
/// restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum AdapterConfig {
    LocalKey {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private_key: Option<String>,
    },
    Privy {
        app_id: String,
        app_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    CoinbaseCdp {
        api_key_id: String,
        api_key_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Crossmint {
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Browser {
        address: String,
    },
}

impl AdapterConfig {
    pub fn kind(&self) -> AdapterKind {
        match self {
            AdapterConfig::LocalKey { .. } => AdapterKind::LocalKey,
            AdapterConfig::Privy { .. } => AdapterKind::Privy,
            AdapterConfig::CoinbaseCdp { .. } => AdapterKind::CoinbaseCdp,
            AdapterConfig::Crossmint { .. } => AdapterKind::Crossmint,
            AdapterConfig::Browser { .. } => AdapterKind::Browser,
        }
    }

    /// The wallet address this configuration resolves to without touching
    /// any provider: cached for managed wallets, derived for local keys.
    pub fn cached_address(&self) -> Option<String> {
        match self {
            AdapterConfig::LocalKey { private_key } => {
                let key = private_key.as_deref()?;
                let signer: alloy::signers::local::PrivateKeySigner = key.parse().ok()?;
                Some(signer.address().to_string())
            }
            AdapterConfig::Privy { address, .. }
            | AdapterConfig::CoinbaseCdp { address, .. }
            | AdapterConfig::Crossmint { address, .. } => address.clone(),
            AdapterConfig::Browser { address } => Some(address.clone()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Wallet is not initialized yet. Provision it first")]
    NotInitialized,
    #[error("This wallet signs in the browser; use the prepare/complete payment flow")]
    MustSignClientSide,
    #[error("Support for the {0} provider is not installed")]
    SdkNotInstalled(&'static str),
    #[error("Invalid private key")]
    InvalidKey,
    #[error("Invalid address {0:?}")]
    InvalidAddress(String),
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("{provider} API error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },
    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// The uniform contract every wallet variant implements.
#[async_trait]
pub trait WalletAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Create or claim the underlying wallet. Idempotent: an already
    /// provisioned adapter returns its address again.
    async fn provision(&self) -> Result<Address, AdapterError>;

    /// The wallet address, failing with `NotInitialized` before provisioning.
    async fn address(&self) -> Result<Address, AdapterError>;

    async fn is_initialized(&self) -> bool;

    /// Produce a 65-byte EIP-712 signature over the transfer authorization.
    async fn sign_transfer(&self, transfer: &TransferRequest)
    -> Result<EvmSignature, AdapterError>;

    /// Round-trip the variant and its persistence fields.
    async fn serialize(&self) -> AdapterConfig;

    /// USDC balance on the given network, human-readable.
    async fn balance(&self, network: Network) -> Result<String, AdapterError> {
        let owner = self.address().await?;
        Ok(chain::usdc_balance(network, owner).await?)
    }
}

/// Construct the adapter for a persisted configuration.
pub fn hydrate(config: &AdapterConfig) -> Result<Arc<dyn WalletAdapter>, AdapterError> {
    match config {
        AdapterConfig::LocalKey { private_key } => Ok(Arc::new(
            local_key::LocalKeyAdapter::from_config(private_key.as_deref())?,
        )),
        AdapterConfig::Browser { address } => {
            Ok(Arc::new(browser::BrowserAdapter::new(address)?))
        }
        #[cfg(feature = "privy")]
        AdapterConfig::Privy {
            app_id,
            app_secret,
            wallet_id,
            address,
        } => Ok(Arc::new(privy::PrivyAdapter::new(
            app_id.clone(),
            app_secret.clone(),
            wallet_id.clone(),
            address.as_deref(),
        )?)),
        #[cfg(not(feature = "privy"))]
        AdapterConfig::Privy { .. } => Err(AdapterError::SdkNotInstalled("privy")),
        #[cfg(feature = "coinbase-cdp")]
        AdapterConfig::CoinbaseCdp {
            api_key_id,
            api_key_secret,
            wallet_id,
            address,
        } => Ok(Arc::new(coinbase::CoinbaseCdpAdapter::new(
            api_key_id.clone(),
            api_key_secret.clone(),
            wallet_id.clone(),
            address.as_deref(),
        )?)),
        #[cfg(not(feature = "coinbase-cdp"))]
        AdapterConfig::CoinbaseCdp { .. } => Err(AdapterError::SdkNotInstalled("coinbase-cdp")),
        #[cfg(feature = "crossmint")]
        AdapterConfig::Crossmint {
            api_key,
            wallet_id,
            address,
        } => Ok(Arc::new(crossmint::CrossmintAdapter::new(
            api_key.clone(),
            wallet_id.clone(),
            address.as_deref(),
        )?)),
        #[cfg(not(feature = "crossmint"))]
        AdapterConfig::Crossmint { .. } => Err(AdapterError::SdkNotInstalled("crossmint")),
    }
}

pub(crate) fn parse_address(input: &str) -> Result<Address, AdapterError> {
    input
        .parse()
        .map_err(|_| AdapterError::InvalidAddress(input.to_string()))
}
