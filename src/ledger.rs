//! Per-wallet transaction ledger.
//!
//! Every payment attempt leaves a record on the active wallet: appended as
//! pending before any signature exists, then settled or failed exactly once
//! when the retry outcome is known. Records are never deleted; the daily
//! spend used by the cap rule is recomputed from them on every call.

use alloy::primitives::U256;
use std::sync::Arc;

use crate::store::{
    StateStore, StoreError, TransactionRecord, TxStatus, fresh_record_id, now_iso8601,
};
use crate::util::money;

/// Listing is capped regardless of the requested limit.
pub const LIST_CAP: usize = 200;

/// USDC carries six decimals; ledger amounts are stored human-readable.
const USDC_DECIMALS: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Transaction {0:?} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fields of a new ledger entry; id and timestamp are allocated on append.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub payee: String,
    pub service: String,
    /// Human-readable decimal USDC amount.
    pub amount: String,
    pub asset: String,
    /// CAIP-2 network identifier.
    pub network: String,
    pub tx_hash: Option<String>,
    pub status: TxStatus,
    pub reason: String,
}

/// Partial update applied to an existing record.
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub status: Option<TxStatus>,
    pub tx_hash: Option<String>,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<StateStore>,
}

impl Ledger {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Allocate an id and timestamp, append to the active wallet, persist,
    /// and return the stored record.
    pub async fn add(&self, tx: NewTransaction) -> Result<TransactionRecord, LedgerError> {
        self.store
            .mutate(|doc| {
                let wallet = doc
                    .active_mut()
                    .ok_or(LedgerError::Store(StoreError::NoActiveWallet))?;
                let record = TransactionRecord {
                    id: fresh_record_id(),
                    timestamp: now_iso8601(),
                    payee: tx.payee,
                    service: tx.service,
                    amount: tx.amount,
                    asset: tx.asset,
                    network: tx.network,
                    tx_hash: tx.tx_hash,
                    status: tx.status,
                    reason: tx.reason,
                };
                wallet.transactions.push(record.clone());
                Ok(record)
            })
            .await
    }

    /// Apply the provided fields to the record with the given id on the
    /// active wallet, persist, and return the updated record.
    pub async fn update(
        &self,
        id: &str,
        patch: TransactionPatch,
    ) -> Result<TransactionRecord, LedgerError> {
        self.store
            .mutate(|doc| {
                let wallet = doc
                    .active_mut()
                    .ok_or(LedgerError::Store(StoreError::NoActiveWallet))?;
                let record = wallet
                    .transactions
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
                if let Some(status) = patch.status {
                    record.status = status;
                }
                if let Some(tx_hash) = patch.tx_hash {
                    record.tx_hash = Some(tx_hash);
                }
                if let Some(reason) = patch.reason {
                    record.reason = reason;
                }
                Ok(record.clone())
            })
            .await
    }

    /// Newest-first slice of the active wallet's ledger, capped at
    /// [`LIST_CAP`] entries.
    pub async fn list(&self, limit: usize) -> Result<Vec<TransactionRecord>, LedgerError> {
        let wallet = self.store.require_active().await?;
        let limit = limit.min(LIST_CAP);
        Ok(wallet
            .transactions
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    /// Total settled spend today (UTC), in atomic USDC units.
    ///
    /// Recomputed from the ledger on every call; the date comparison is on
    /// the `YYYY-MM-DD` prefix of the stored ISO-8601 timestamps.
    pub async fn today_spent(&self) -> Result<U256, LedgerError> {
        let wallet = self.store.require_active().await?;
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut total = U256::ZERO;
        for tx in &wallet.transactions {
            if tx.status == TxStatus::Settled && tx.timestamp.starts_with(&today) {
                if let Ok(atomic) = money::parse_decimal(&tx.amount, USDC_DECIMALS) {
                    total += atomic;
                }
            }
        }
        Ok(total)
    }
}
