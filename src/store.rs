//! Persistent multi-wallet state.
//!
//! The whole broker state lives in one pretty-printed JSON document at
//! `<data dir>/state.json`: the wallet list, the active selection, and the
//! process-wide network. Every mutation rewrites the file before returning,
//! through a temp-file-and-rename so a crash never leaves a torn document.
//!
//! A legacy single-wallet document (no `wallets` array, top-level
//! `adapterConfig` and `wallet`) is migrated on first load into a
//! one-element wallet list and persisted immediately.

use alloy::primitives::hex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::adapter::AdapterConfig;
use crate::network::Network;
use crate::rules::SpendingRules;

/// Name of the directory holding broker state, relative to the working directory.
pub const DATA_DIR: &str = ".clawlet";
/// Name of the state file inside the data directory.
pub const STATE_FILE: &str = "state.json";

pub type WalletId = String;

/// On-chain agent identity attached to a wallet, announced to paid services
/// via `X-AGENT-*` headers on the payment retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// CAIP-10 account of the identity registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_uri: Option<String>,
}

/// Lifecycle state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Settled,
    Failed,
}

/// One payment attempt, as recorded in a wallet's ledger.
///
/// Created pending before any signature is produced; transitions to settled
/// or failed exactly once. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub id: String,
    /// ISO-8601 UTC.
    pub timestamp: String,
    pub payee: String,
    /// Host portion of the paid URL at negotiation time.
    pub service: String,
    /// Human-readable decimal USDC amount.
    pub amount: String,
    /// Token contract address.
    pub asset: String,
    /// CAIP-2 network identifier.
    pub network: String,
    pub tx_hash: Option<String>,
    pub status: TxStatus,
    #[serde(default)]
    pub reason: String,
}

/// One wallet: identity, adapter configuration, rules, and ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletEntry {
    pub id: WalletId,
    pub label: String,
    /// ISO-8601 UTC creation time.
    pub created_at: String,
    #[serde(default)]
    pub frozen: bool,
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub rules: SpendingRules,
    #[serde(default)]
    pub transactions: Vec<TransactionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_identity: Option<AgentIdentity>,
}

/// The persisted document, schema V2.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    pub wallets: Vec<WalletEntry>,
    pub active_wallet_id: Option<WalletId>,
    pub network: Network,
}

impl StateDocument {
    fn empty() -> Self {
        StateDocument {
            wallets: Vec::new(),
            active_wallet_id: None,
            network: Network::Base,
        }
    }

    /// The wallet referenced by `activeWalletId`, if any.
    pub fn active(&self) -> Option<&WalletEntry> {
        let id = self.active_wallet_id.as_deref()?;
        self.wallets.iter().find(|w| w.id == id)
    }

    /// Mutable access to the active wallet.
    pub fn active_mut(&mut self) -> Option<&mut WalletEntry> {
        let id = self.active_wallet_id.clone()?;
        self.wallets.iter_mut().find(|w| w.id == id)
    }
}

/// Schema V1: a single implicit wallet at the top level of the document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDocument {
    adapter_config: AdapterConfig,
    #[serde(default)]
    rules: Option<SpendingRules>,
    #[serde(default)]
    transactions: Vec<TransactionRecord>,
    #[serde(default)]
    agent_identity: Option<AgentIdentity>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read or write state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("State file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No active wallet. Create or switch to a wallet first")]
    NoActiveWallet,
    #[error("Unknown wallet id {0:?}")]
    UnknownWallet(String),
}

/// Owns the in-memory document and its on-disk mirror.
///
/// A single process-wide async mutex serializes mutations; the mutex is held
/// across the in-memory change and the atomic file write, so readers always
/// observe either the previous or the new document. Outbound I/O (HTTP,
/// RPC, signing) never happens under this lock.
pub struct StateStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl StateStore {
    /// Open the state store rooted at the given data directory, creating the
    /// directory and an empty document if nothing exists yet, and migrating
    /// a legacy single-wallet document if one is found.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE);

        let doc = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            if value.get("wallets").is_some() {
                serde_json::from_value(value)?
            } else {
                let legacy: LegacyDocument = serde_json::from_value(value)?;
                let migrated = migrate_legacy(legacy);
                write_atomic(&path, &migrated)?;
                tracing::info!("Migrated single-wallet state to multi-wallet schema");
                migrated
            }
        } else {
            let empty = StateDocument::empty();
            write_atomic(&path, &empty)?;
            empty
        };

        Ok(StateStore {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// A point-in-time copy of the document.
    pub async fn snapshot(&self) -> StateDocument {
        self.doc.lock().await.clone()
    }

    /// Apply a mutation and persist it atomically before returning.
    ///
    /// The closure must only mutate on its success path; on error nothing is
    /// written and the in-memory document is left as the closure left it.
    pub async fn mutate<T, E>(
        &self,
        f: impl FnOnce(&mut StateDocument) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut doc = self.doc.lock().await;
        let out = f(&mut doc)?;
        write_atomic(&self.path, &doc).map_err(E::from)?;
        Ok(out)
    }

    /// The active wallet, if one is selected.
    pub async fn active(&self) -> Option<WalletEntry> {
        self.doc.lock().await.active().cloned()
    }

    /// The active wallet, or [`StoreError::NoActiveWallet`].
    pub async fn require_active(&self) -> Result<WalletEntry, StoreError> {
        self.active().await.ok_or(StoreError::NoActiveWallet)
    }

    /// The currently selected network.
    pub async fn network(&self) -> Network {
        self.doc.lock().await.network
    }

    /// The currently selected network as a CAIP-2 identifier.
    pub async fn network_caip2(&self) -> &'static str {
        self.network().await.caip2()
    }

    /// Switch the process-wide network selection.
    pub async fn set_network(&self, network: Network) -> Result<(), StoreError> {
        self.mutate(|doc| {
            doc.network = network;
            Ok::<_, StoreError>(())
        })
        .await
    }
}

fn migrate_legacy(legacy: LegacyDocument) -> StateDocument {
    let id = fresh_wallet_id();
    let wallet = WalletEntry {
        id: id.clone(),
        label: "Wallet 1".to_string(),
        created_at: now_iso8601(),
        frozen: false,
        adapter: legacy.adapter_config,
        rules: legacy.rules.unwrap_or_default(),
        transactions: legacy.transactions,
        agent_identity: legacy.agent_identity,
    };
    StateDocument {
        wallets: vec![wallet],
        active_wallet_id: Some(id),
        network: Network::Base,
    }
}

fn write_atomic(path: &Path, doc: &StateDocument) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Current time as ISO-8601 UTC, the ledger's timestamp format.
pub fn now_iso8601() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Fresh opaque wallet id: 8 random bytes, 16 hex chars.
pub fn fresh_wallet_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Fresh transaction or session id: 16 random bytes, 32 hex chars.
pub fn fresh_record_id() -> String {
    hex::encode(rand::rng().random::<[u8; 16]>())
}
