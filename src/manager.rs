//! Wallet manager: a thin façade over the state store and the adapters.
//!
//! Owns the adapter cache so rehydrating a wallet from persistence is a
//! one-time cost per process. All mutations persist before returning.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::adapter::{self, AdapterConfig, AdapterError, AdapterKind, WalletAdapter};
use crate::network::Network;
use crate::rules::SpendingRules;
use crate::store::{
    AgentIdentity, StateStore, StoreError, WalletEntry, WalletId, fresh_wallet_id, now_iso8601,
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("Missing or invalid adapter credentials: {0}")]
    InvalidCredentials(String),
    #[error("Agent identity requires a non-empty name")]
    MissingIdentityName,
}

/// Public view of a wallet: everything but the credentials and the ledger.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub id: WalletId,
    pub label: String,
    pub address: Option<String>,
    pub frozen: bool,
    pub adapter: AdapterKind,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_identity: Option<AgentIdentity>,
}

impl WalletSummary {
    pub fn from_entry(entry: &WalletEntry) -> Self {
        WalletSummary {
            id: entry.id.clone(),
            label: entry.label.clone(),
            address: entry.adapter.cached_address(),
            frozen: entry.frozen,
            adapter: entry.adapter.kind(),
            created_at: entry.created_at.clone(),
            agent_identity: entry.agent_identity.clone(),
        }
    }
}

pub struct WalletManager {
    store: Arc<StateStore>,
    adapters: Mutex<HashMap<WalletId, Arc<dyn WalletAdapter>>>,
}

impl WalletManager {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Create a wallet: construct the adapter from the supplied credentials,
    /// provision it, persist the resulting entry with default rules, and
    /// make it the active wallet.
    pub async fn create(
        &self,
        kind: AdapterKind,
        credentials: serde_json::Value,
        label: Option<String>,
    ) -> Result<WalletSummary, ManagerError> {
        let mut fields = match credentials {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(ManagerError::InvalidCredentials(format!(
                    "expected an object, got {other}"
                )));
            }
        };
        fields.insert("type".to_string(), json!(kind));
        let config: AdapterConfig = serde_json::from_value(serde_json::Value::Object(fields))
            .map_err(|e| ManagerError::InvalidCredentials(e.to_string()))?;

        let adapter = adapter::hydrate(&config)?;
        let address = adapter.provision().await?;
        // Serialize after provisioning so generated keys and provider
        // wallet ids land in the persisted entry.
        let config = adapter.serialize().await;

        let (id, summary) = self
            .store
            .mutate(|doc| {
                let id = fresh_wallet_id();
                let label =
                    label.unwrap_or_else(|| format!("Wallet {}", doc.wallets.len() + 1));
                let entry = WalletEntry {
                    id: id.clone(),
                    label,
                    created_at: now_iso8601(),
                    frozen: false,
                    adapter: config,
                    rules: SpendingRules::default(),
                    transactions: Vec::new(),
                    agent_identity: None,
                };
                let mut summary = WalletSummary::from_entry(&entry);
                summary.address = Some(address.to_string());
                doc.wallets.push(entry);
                doc.active_wallet_id = Some(id.clone());
                Ok::<_, ManagerError>((id, summary))
            })
            .await?;

        self.adapters.lock().await.insert(id, adapter);
        tracing::info!(wallet = %summary.id, adapter = %kind, "Created wallet");
        Ok(summary)
    }

    /// All wallets plus the active selection.
    pub async fn list(&self) -> (Vec<WalletSummary>, Option<WalletId>) {
        let doc = self.store.snapshot().await;
        let summaries = doc.wallets.iter().map(WalletSummary::from_entry).collect();
        (summaries, doc.active_wallet_id)
    }

    /// Summary of the active wallet, if any.
    pub async fn active_summary(&self) -> Option<WalletSummary> {
        let entry = self.store.active().await?;
        Some(WalletSummary::from_entry(&entry))
    }

    pub async fn switch(&self, id: &str) -> Result<WalletSummary, ManagerError> {
        self.store
            .mutate(|doc| {
                let entry = doc
                    .wallets
                    .iter()
                    .find(|w| w.id == id)
                    .ok_or_else(|| StoreError::UnknownWallet(id.to_string()))?;
                let summary = WalletSummary::from_entry(entry);
                doc.active_wallet_id = Some(entry.id.clone());
                Ok::<_, ManagerError>(summary)
            })
            .await
    }

    /// Remove a wallet. When the active wallet is removed, the first
    /// remaining wallet (if any) becomes active.
    pub async fn remove(&self, id: &str) -> Result<(), ManagerError> {
        self.store
            .mutate(|doc| {
                let index = doc
                    .wallets
                    .iter()
                    .position(|w| w.id == id)
                    .ok_or_else(|| StoreError::UnknownWallet(id.to_string()))?;
                doc.wallets.remove(index);
                if doc.active_wallet_id.as_deref() == Some(id) {
                    doc.active_wallet_id = doc.wallets.first().map(|w| w.id.clone());
                }
                Ok::<_, ManagerError>(())
            })
            .await?;
        self.adapters.lock().await.remove(id);
        Ok(())
    }

    /// Rename the active wallet.
    pub async fn rename(&self, label: String) -> Result<WalletSummary, ManagerError> {
        self.store
            .mutate(|doc| {
                let wallet = doc
                    .active_mut()
                    .ok_or(StoreError::NoActiveWallet)?;
                wallet.label = label;
                Ok::<_, ManagerError>(WalletSummary::from_entry(wallet))
            })
            .await
    }

    /// Freeze or unfreeze the active wallet; returns the new flag.
    pub async fn set_frozen(&self, frozen: bool) -> Result<bool, ManagerError> {
        self.store
            .mutate(|doc| {
                let wallet = doc
                    .active_mut()
                    .ok_or(StoreError::NoActiveWallet)?;
                wallet.frozen = frozen;
                Ok::<_, ManagerError>(wallet.frozen)
            })
            .await
    }

    pub async fn agent_identity(&self) -> Result<Option<AgentIdentity>, ManagerError> {
        Ok(self.store.require_active().await?.agent_identity)
    }

    pub async fn set_agent_identity(
        &self,
        identity: AgentIdentity,
    ) -> Result<AgentIdentity, ManagerError> {
        if identity.name.trim().is_empty() {
            return Err(ManagerError::MissingIdentityName);
        }
        self.store
            .mutate(|doc| {
                let wallet = doc
                    .active_mut()
                    .ok_or(StoreError::NoActiveWallet)?;
                wallet.agent_identity = Some(identity.clone());
                Ok::<_, ManagerError>(identity)
            })
            .await
    }

    /// The adapter for the active wallet, hydrating and caching on first use.
    pub async fn adapter_for_active(&self) -> Result<Arc<dyn WalletAdapter>, ManagerError> {
        let wallet = self.store.require_active().await?;
        let mut cache = self.adapters.lock().await;
        if let Some(adapter) = cache.get(&wallet.id) {
            return Ok(adapter.clone());
        }
        let adapter = adapter::hydrate(&wallet.adapter)?;
        cache.insert(wallet.id, adapter.clone());
        Ok(adapter)
    }

    /// USDC balance of the active wallet, on the current network unless
    /// overridden.
    pub async fn balance(
        &self,
        network_override: Option<Network>,
    ) -> Result<(String, Network), ManagerError> {
        let network = match network_override {
            Some(network) => network,
            None => self.store.network().await,
        };
        let adapter = self.adapter_for_active().await?;
        let balance = adapter.balance(network).await?;
        Ok((balance, network))
    }
}
