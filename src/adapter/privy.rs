//! Managed adapter backed by the Privy wallet API.
//!
//! Provisioning creates a server wallet under the configured app;
//! signing posts the EIP-712 document to the wallet RPC endpoint.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{AdapterConfig, AdapterError, AdapterKind, WalletAdapter, parse_address};
use crate::proto::{EvmSignature, TransferRequest};

const API_BASE: &str = "https://api.privy.io/v1";

pub struct PrivyAdapter {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    wallet: RwLock<Option<(String, Address)>>,
}

#[derive(Debug, Deserialize)]
struct PrivyWallet {
    id: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct PrivyRpcResponse {
    data: PrivyRpcData,
}

#[derive(Debug, Deserialize)]
struct PrivyRpcData {
    signature: String,
}

impl PrivyAdapter {
    pub fn new(
        app_id: String,
        app_secret: String,
        wallet_id: Option<String>,
        address: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let wallet = match (wallet_id, address) {
            (Some(id), Some(addr)) => Some((id, parse_address(addr)?)),
            _ => None,
        };
        Ok(Self {
            http: reqwest::Client::new(),
            app_id,
            app_secret,
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
impl WalletAdapter for PrivyAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Privy
    }

    async fn provision(&self) -> Result<Address, AdapterError> {
        let mut guard = self.wallet.write().await;
        if let Some((_, address)) = guard.as_ref() {
            return Ok(*address);
        }
        let response = self
            .http
            .post(format!("{API_BASE}/wallets"))
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .header("privy-app-id", &self.app_id)
            .json(&json!({"chain_type": "ethereum"}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::Provider {
                provider: "privy",
                message: response.text().await.unwrap_or_default(),
            });
        }
        let wallet: PrivyWallet = response.json().await?;
        let address = parse_address(&wallet.address)?;
        tracing::info!(wallet_id = %wallet.id, %address, "Provisioned Privy wallet");
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
            .post(format!("{API_BASE}/wallets/{wallet_id}/rpc"))
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .header("privy-app-id", &self.app_id)
            .json(&json!({
                "method": "eth_signTypedData_v4",
                "params": {"typed_data": transfer.typed_data()},
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::Provider {
                provider: "privy",
                message: response.text().await.unwrap_or_default(),
            });
        }
        let body: PrivyRpcResponse = response.json().await?;
        body.data
            .signature
            .parse()
            .map_err(|_| AdapterError::Signing("privy returned a malformed signature".into()))
    }

    async fn serialize(&self) -> AdapterConfig {
        let wallet = self.wallet.read().await;
        AdapterConfig::Privy {
            app_id: self.app_id.clone(),
            app_secret: self.app_secret.clone(),
            wallet_id: wallet.as_ref().map(|(id, _)| id.clone()),
            address: wallet.as_ref().map(|(_, address)| address.to_string()),
        }
    }
}
