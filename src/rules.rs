//! Spending rules and their enforcement.
//!
//! Each wallet carries four rules: a per-transaction limit, a rolling daily
//! cap, and allow/block lists of service patterns. Enforcement runs before
//! any signature is produced and fails fast on the first violation, in a
//! fixed order: per-transaction, daily cap, blocklist, allowlist. Blocked
//! patterns take precedence over allowed ones.

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::ledger::{Ledger, LedgerError};
use crate::store::{StateStore, StoreError};
use crate::util::money::{self, MoneyError, format_atomic};

const USDC_DECIMALS: u32 = 6;

/// Per-wallet spending rules. Limits are human-readable decimal USDC
/// strings; `None` means unlimited. An empty allowlist admits every
/// service; patterns are matched as case-insensitive substrings of the
/// service host and are normalized lowercase on write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpendingRules {
    pub max_per_transaction: Option<String>,
    pub daily_cap: Option<String>,
    pub allowed_services: Vec<String>,
    pub blocked_services: Vec<String>,
}

/// Partial update: each field replaces the stored one only when present in
/// the patch. `null` clears a limit; a missing field leaves it untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RulesPatch {
    #[serde(deserialize_with = "double_option")]
    pub max_per_transaction: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub daily_cap: Option<Option<String>>,
    pub allowed_services: Option<Vec<String>>,
    pub blocked_services: Option<Vec<String>>,
}

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Payment of {amount} USDC exceeds the per-transaction limit of {limit} USDC")]
    OverPerTransaction { amount: String, limit: String },
    #[error(
        "Payment of {amount} USDC would exceed the daily cap of {cap} USDC ({spent} USDC already spent today)"
    )]
    OverDailyCap {
        amount: String,
        cap: String,
        spent: String,
    },
    #[error("Service {service:?} is blocked by pattern {pattern:?}")]
    Blocked { service: String, pattern: String },
    #[error("Service {service:?} is not on the allowed services list")]
    NotAllowed { service: String },
    #[error("Invalid rule amount: {0}")]
    InvalidRule(#[from] MoneyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone)]
pub struct RulesEngine {
    store: Arc<StateStore>,
    ledger: Ledger,
}

impl RulesEngine {
    pub fn new(store: Arc<StateStore>) -> Self {
        let ledger = Ledger::new(store.clone());
        Self { store, ledger }
    }

    /// The active wallet's rules.
    pub async fn get(&self) -> Result<SpendingRules, RuleError> {
        Ok(self.store.require_active().await?.rules)
    }

    /// Apply a partial patch to the active wallet's rules and persist.
    /// Service patterns are normalized lowercase.
    pub async fn set(&self, patch: RulesPatch) -> Result<SpendingRules, RuleError> {
        self.store
            .mutate(|doc| {
                let wallet = doc
                    .active_mut()
                    .ok_or(RuleError::Store(StoreError::NoActiveWallet))?;
                let rules = &mut wallet.rules;
                if let Some(limit) = patch.max_per_transaction {
                    rules.max_per_transaction = limit;
                }
                if let Some(cap) = patch.daily_cap {
                    rules.daily_cap = cap;
                }
                if let Some(allowed) = patch.allowed_services {
                    rules.allowed_services = normalize(allowed);
                }
                if let Some(blocked) = patch.blocked_services {
                    rules.blocked_services = normalize(blocked);
                }
                Ok(rules.clone())
            })
            .await
    }

    /// Validate a pending payment of `amount` atomic USDC units to
    /// `service` against the active wallet's rules.
    pub async fn enforce(&self, amount: U256, service: &str) -> Result<(), RuleError> {
        let rules = self.store.require_active().await?.rules;
        let service_lower = service.to_lowercase();

        if let Some(limit) = &rules.max_per_transaction {
            let limit_atomic = money::parse_decimal(limit, USDC_DECIMALS)?;
            if amount > limit_atomic {
                return Err(RuleError::OverPerTransaction {
                    amount: format_atomic(amount, USDC_DECIMALS),
                    limit: limit.clone(),
                });
            }
        }

        if let Some(cap) = &rules.daily_cap {
            let cap_atomic = money::parse_decimal(cap, USDC_DECIMALS)?;
            let spent = self.ledger.today_spent().await?;
            if spent + amount > cap_atomic {
                return Err(RuleError::OverDailyCap {
                    amount: format_atomic(amount, USDC_DECIMALS),
                    cap: cap.clone(),
                    spent: format_atomic(spent, USDC_DECIMALS),
                });
            }
        }

        for pattern in &rules.blocked_services {
            if service_lower.contains(pattern.as_str()) {
                return Err(RuleError::Blocked {
                    service: service.to_string(),
                    pattern: pattern.clone(),
                });
            }
        }

        if !rules.allowed_services.is_empty()
            && !rules
                .allowed_services
                .iter()
                .any(|pattern| service_lower.contains(pattern.as_str()))
        {
            return Err(RuleError::NotAllowed {
                service: service.to_string(),
            });
        }

        Ok(())
    }
}

fn normalize(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}
