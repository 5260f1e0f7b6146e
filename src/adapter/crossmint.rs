//! Managed adapter backed by the Crossmint wallet API.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{AdapterConfig, AdapterError, AdapterKind, WalletAdapter, parse_address};
use crate::proto::{EvmSignature, TransferRequest};

const API_BASE: &str = "https://www.crossmint.com/api/v1-alpha2";

pub struct CrossmintAdapter {
    http: reqwest::Client,
    api_key: String,
    wallet: RwLock<Option<(String, Address)>>,
}

#[derive(Debug, Deserialize)]
struct CrossmintWallet {
    id: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct CrossmintSignature {
    signature: String,
}

impl CrossmintAdapter {
    pub fn new(
        api_key: String,
        wallet_id: Option<String>,
        address: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let wallet = match (wallet_id, address) {
            (Some(id), Some(addr)) => Some((id, parse_address(addr)?)),
            _ => None,
        };
        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            wallet: RwLock::new(wallet),
        })
    }

    async fn require_wallet(&self) -> Result<(String, Address), AdapterError> {
        self.wallet
            .read()
            .await
            .clone()
            .ok_or(AdapterError::NotInitialized)
    }
}

#[async_trait]
impl WalletAdapter for CrossmintAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Crossmint
    }

    async fn provision(&self) -> Result<Address, AdapterError> {
        let mut guard = self.wallet.write().await;
        if let Some((_, address)) = guard.as_ref() {
            return Ok(*address);
        }
        let response = self
            .http
            .post(format!("{API_BASE}/wallets"))
            .header("X-API-KEY", &self.api_key)
            .json(&json!({"type": "evm-smart-wallet"}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::Provider {
                provider: "crossmint",
                message: response.text().await.unwrap_or_default(),
            });
        }
        let wallet: CrossmintWallet = response.json().await?;
        let address = parse_address(&wallet.address)?;
        tracing::info!(wallet_id = %wallet.id, %address, "Provisioned Crossmint wallet");
        *guard = Some((wallet.id, address));
        Ok(address)
    }

    async fn address(&self) -> Result<Address, AdapterError> {
        Ok(self.require_wallet().await?.1)
    }

    async fn is_initialized(&self) -> bool {
        self.wallet.read().await.is_some()
    }

    async fn sign_transfer(
        &self,
        transfer: &TransferRequest,
    ) -> Result<EvmSignature, AdapterError> {
        let (wallet_id, _) = self.require_wallet().await?;
        let response = self
            .http
            .post(format!("{API_BASE}/wallets/{wallet_id}/signatures"))
            .header("X-API-KEY", &self.api_key)
            .json(&json!({
                "type": "evm-typed-data",
                "params": {"typedData": transfer.typed_data()},
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::Provider {
                provider: "crossmint",
                message: response.text().await.unwrap_or_default(),
            });
        }
        let body: CrossmintSignature = response.json().await?;
        body.signature
            .parse()
            .map_err(|_| AdapterError::Signing("crossmint returned a malformed signature".into()))
    }

    async fn serialize(&self) -> AdapterConfig {
        let wallet = self.wallet.read().await;
        AdapterConfig::Crossmint {
            api_key: self.api_key.clone(),
            wallet_id: wallet.as_ref().map(|(id, _)| id.clone()),
            address: wallet.as_ref().map(|(_, address)| address.to_string()),
        }
    }
}
