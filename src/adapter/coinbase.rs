//! Managed adapter backed by the Coinbase Developer Platform wallet API.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use super::{AdapterConfig, AdapterError, AdapterKind, WalletAdapter, parse_address};
use crate::proto::{EvmSignature, TransferRequest};

const API_BASE: &str = "https://api.cdp.coinbase.com/platform/v2/evm";

pub struct CoinbaseCdpAdapter {
    http: reqwest::Client,
    api_key_id: String,
    api_key_secret: String,
    account: RwLock<Option<(String, Address)>>,
}

#[derive(Debug, Deserialize)]
struct CdpAccount {
    name: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct CdpSignature {
    signature: String,
}

impl CoinbaseCdpAdapter {
    pub fn new(
        api_key_id: String,
        api_key_secret: String,
        wallet_id: Option<String>,
        address: Option<&str>,
    ) -> Result<Self, AdapterError> {
        let account = match (wallet_id, address) {
            (Some(id), Some(addr)) => Some((id, parse_address(addr)?)),
            _ => None,
        };
        Ok(Self {
            http: reqwest::Client::new(),
            api_key_id,
            api_key_secret,
            account: RwLock::new(account),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.api_key_secret)
            .header("X-CDP-API-KEY-ID", &self.api_key_id)
    }

    async fn require_account(&self) -> Result<(String, Address), AdapterError> {
        self.account
            .read()
            .await
            .clone()
            .ok_or(AdapterError::NotInitialized)
    }
}

#[async_trait]
impl WalletAdapter for CoinbaseCdpAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::CoinbaseCdp
    }

    async fn provision(&self) -> Result<Address, AdapterError> {
        let mut guard = self.account.write().await;
        if let Some((_, address)) = guard.as_ref() {
            return Ok(*address);
        }
        let response = self
            .authorized(self.http.post(format!("{API_BASE}/accounts")))
            .json(&json!({}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::Provider {
                provider: "coinbase-cdp",
                message: response.text().await.unwrap_or_default(),
            });
        }
        let account: CdpAccount = response.json().await?;
        let address = parse_address(&account.address)?;
        tracing::info!(account = %account.name, %address, "Provisioned Coinbase CDP account");
        *guard = Some((account.name, address));
        Ok(address)
    }

    async fn address(&self) -> Result<Address, AdapterError> {
        Ok(self.require_account().await?.1)
    }

    async fn is_initialized(&self) -> bool {
        self.account.read().await.is_some()
    }

    async fn sign_transfer(
        &self,
        transfer: &TransferRequest,
    ) -> Result<EvmSignature, AdapterError> {
        let (_, address) = self.require_account().await?;
        let response = self
            .authorized(
                self.http
                    .post(format!("{API_BASE}/accounts/{address}/sign/typed-data")),
            )
            .json(&transfer.typed_data())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::Provider {
                provider: "coinbase-cdp",
                message: response.text().await.unwrap_or_default(),
            });
        }
        let body: CdpSignature = response.json().await?;
        body.signature.parse().map_err(|_| {
            AdapterError::Signing("coinbase-cdp returned a malformed signature".into())
        })
    }

    async fn serialize(&self) -> AdapterConfig {
        let account = self.account.read().await;
        AdapterConfig::CoinbaseCdp {
            api_key_id: self.api_key_id.clone(),
            api_key_secret: self.api_key_secret.clone(),
            wallet_id: account.as_ref().map(|(id, _)| id.clone()),
            address: account.as_ref().map(|(_, address)| address.to_string()),
        }
    }
}
