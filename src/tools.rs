//! The tool surface: one fixed catalog of operations consumed by both the
//! JSON-HTTP binding and the stdio tool-protocol binding.
//!
//! Every operation goes through [`Tools::dispatch`], so the two bindings
//! cannot drift apart. Demo mode (from the environment) turns every
//! non-read operation into a *write-disabled* error; reads are unaffected.

use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;

use crate::adapter::AdapterKind;
use crate::broker::{BrokerError, FetchOptions, PaymentBroker, PaymentOutcome};
use crate::ledger::{Ledger, LedgerError};
use crate::manager::{ManagerError, WalletManager};
use crate::network::Network;
use crate::rules::{RuleError, RulesEngine, RulesPatch};
use crate::store::{AgentIdentity, StateStore, StoreError};
use crate::util::money::format_atomic;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),
    #[error("Demo mode is enabled; write operations are disabled")]
    WriteDisabled,
    #[error("Unknown tool {0:?}")]
    UnknownTool(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ToolError {
    /// HTTP status the JSON binding answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            ToolError::WriteDisabled => 403,
            ToolError::UnknownTool(_) => 404,
            ToolError::Store(StoreError::Io(_)) | ToolError::Store(StoreError::Json(_)) => 500,
            ToolError::Broker(BrokerError::Encode(_)) => 500,
            _ => 400,
        }
    }
}

/// One entry of the operation catalog, as listed to agent runtimes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
}

/// The catalog: names are the wire contract for both bindings.
pub fn catalog() -> &'static [ToolSpec] {
    const CATALOG: &[ToolSpec] = &[
        ToolSpec { name: "config", description: "Broker configuration flags (demo mode)" },
        ToolSpec { name: "listWallets", description: "List wallets and the active selection" },
        ToolSpec { name: "createWallet", description: "Create a wallet (adapter, credentials, label) and make it active" },
        ToolSpec { name: "switchWallet", description: "Switch the active wallet by id" },
        ToolSpec { name: "renameWallet", description: "Rename the active wallet" },
        ToolSpec { name: "removeWallet", description: "Remove a wallet by id" },
        ToolSpec { name: "getWallet", description: "Summary of the active wallet" },
        ToolSpec { name: "getNetwork", description: "The selected network (base or base-sepolia)" },
        ToolSpec { name: "setNetwork", description: "Select base or base-sepolia" },
        ToolSpec { name: "getBalance", description: "USDC balance of the active wallet" },
        ToolSpec { name: "getRules", description: "Spending rules of the active wallet" },
        ToolSpec { name: "setRules", description: "Patch spending rules (limits, allow/block lists)" },
        ToolSpec { name: "listTransactions", description: "Newest-first transactions of the active wallet" },
        ToolSpec { name: "todaySpent", description: "USDC settled today (UTC) by the active wallet" },
        ToolSpec { name: "getAgentIdentity", description: "Agent identity attached to the active wallet" },
        ToolSpec { name: "setAgentIdentity", description: "Attach an agent identity (name required)" },
        ToolSpec { name: "pay", description: "Fetch a URL, paying the x402 challenge if one appears" },
        ToolSpec { name: "payPrepare", description: "Start a two-phase payment; returns the typed data to sign" },
        ToolSpec { name: "payComplete", description: "Finish a two-phase payment with the signature" },
        ToolSpec { name: "freeze", description: "Freeze the active wallet (blocks payments)" },
        ToolSpec { name: "unfreeze", description: "Unfreeze the active wallet" },
    ];
    CATALOG
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWalletParams {
    adapter: String,
    #[serde(default)]
    credentials: Value,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletIdParams {
    wallet_id: String,
}

#[derive(Debug, Deserialize)]
struct LabelParams {
    label: String,
}

#[derive(Debug, Deserialize)]
struct NetworkParams {
    network: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct BalanceParams {
    network: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ListTransactionsParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayParams {
    url: String,
    #[serde(flatten)]
    options: FetchOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayCompleteParams {
    session_id: String,
    signature: String,
}

pub struct Tools {
    store: Arc<StateStore>,
    manager: Arc<WalletManager>,
    broker: Arc<PaymentBroker>,
    ledger: Ledger,
    rules: RulesEngine,
    demo_mode: bool,
}

impl Tools {
    pub fn new(
        store: Arc<StateStore>,
        manager: Arc<WalletManager>,
        broker: Arc<PaymentBroker>,
        demo_mode: bool,
    ) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            rules: RulesEngine::new(store.clone()),
            store,
            manager,
            broker,
            demo_mode,
        }
    }

    /// Invoke an operation by catalog name. This is the single entry point
    /// both bindings go through.
    pub async fn dispatch(&self, name: &str, params: Value) -> Result<Value, ToolError> {
        match name {
            "config" => self.config().await,
            "listWallets" => self.list_wallets().await,
            "createWallet" => self.create_wallet(parse(params)?).await,
            "switchWallet" => self.switch_wallet(parse(params)?).await,
            "renameWallet" => self.rename_wallet(parse(params)?).await,
            "removeWallet" => self.remove_wallet(parse(params)?).await,
            "getWallet" => self.get_wallet().await,
            "getNetwork" => self.get_network().await,
            "setNetwork" => self.set_network(parse(params)?).await,
            "getBalance" => self.get_balance(parse_or_default(params)?).await,
            "getRules" => self.get_rules().await,
            "setRules" => self.set_rules(parse(params)?).await,
            "listTransactions" => self.list_transactions(parse_or_default(params)?).await,
            "todaySpent" => self.today_spent().await,
            "getAgentIdentity" => self.get_agent_identity().await,
            "setAgentIdentity" => self.set_agent_identity(parse(params)?).await,
            "pay" => self.pay(parse(params)?).await,
            "payPrepare" => self.pay_prepare(parse(params)?).await,
            "payComplete" => self.pay_complete(parse(params)?).await,
            "freeze" => self.set_frozen(true).await,
            "unfreeze" => self.set_frozen(false).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn ensure_writable(&self) -> Result<(), ToolError> {
        if self.demo_mode {
            Err(ToolError::WriteDisabled)
        } else {
            Ok(())
        }
    }

    async fn config(&self) -> Result<Value, ToolError> {
        Ok(json!({"demoMode": self.demo_mode}))
    }

    async fn list_wallets(&self) -> Result<Value, ToolError> {
        let (wallets, active_wallet_id) = self.manager.list().await;
        Ok(json!({"wallets": wallets, "activeWalletId": active_wallet_id}))
    }

    async fn create_wallet(&self, params: CreateWalletParams) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let kind = AdapterKind::from_str(&params.adapter)
            .map_err(|e| ToolError::Validation(e.to_string()))?;
        let summary = self
            .manager
            .create(kind, params.credentials, params.label)
            .await?;
        Ok(serde_json::to_value(summary).expect("wallet summary serializes"))
    }

    async fn switch_wallet(&self, params: WalletIdParams) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let summary = self.manager.switch(&params.wallet_id).await?;
        Ok(json!({"activeWalletId": summary.id, "label": summary.label}))
    }

    async fn rename_wallet(&self, params: LabelParams) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        if params.label.trim().is_empty() {
            return Err(ToolError::Validation("label must not be empty".into()));
        }
        let summary = self.manager.rename(params.label).await?;
        Ok(json!({"label": summary.label}))
    }

    async fn remove_wallet(&self, params: WalletIdParams) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        self.manager.remove(&params.wallet_id).await?;
        Ok(json!({"deleted": true}))
    }

    async fn get_wallet(&self) -> Result<Value, ToolError> {
        match self.manager.active_summary().await {
            Some(summary) => {
                let adapter = summary.adapter;
                Ok(json!({"wallet": summary, "adapter": adapter}))
            }
            None => Ok(json!({"wallet": null, "adapter": null})),
        }
    }

    async fn get_network(&self) -> Result<Value, ToolError> {
        Ok(json!({"network": self.store.network().await}))
    }

    async fn set_network(&self, params: NetworkParams) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let network = Network::from_str(&params.network)
            .map_err(|e| ToolError::Validation(e.to_string()))?;
        self.store.set_network(network).await?;
        Ok(json!({"network": network}))
    }

    async fn get_balance(&self, params: BalanceParams) -> Result<Value, ToolError> {
        let network_override = params
            .network
            .as_deref()
            .map(Network::from_str)
            .transpose()
            .map_err(|e| ToolError::Validation(e.to_string()))?;
        let (balance, network) = self.manager.balance(network_override).await?;
        Ok(json!({"balance": balance, "network": network}))
    }

    async fn get_rules(&self) -> Result<Value, ToolError> {
        let rules = self.rules.get().await?;
        Ok(serde_json::to_value(rules).expect("rules serialize"))
    }

    async fn set_rules(&self, patch: RulesPatch) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let rules = self.rules.set(patch).await?;
        Ok(serde_json::to_value(rules).expect("rules serialize"))
    }

    async fn list_transactions(&self, params: ListTransactionsParams) -> Result<Value, ToolError> {
        let limit = params.limit.unwrap_or(crate::ledger::LIST_CAP);
        let transactions = self.ledger.list(limit).await?;
        Ok(serde_json::to_value(transactions).expect("transactions serialize"))
    }

    async fn today_spent(&self) -> Result<Value, ToolError> {
        let spent = self.ledger.today_spent().await?;
        Ok(json!({"spent": format_atomic(spent, 6)}))
    }

    async fn get_agent_identity(&self) -> Result<Value, ToolError> {
        let identity = self.manager.agent_identity().await?;
        Ok(serde_json::to_value(identity).expect("identity serializes"))
    }

    async fn set_agent_identity(&self, identity: AgentIdentity) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let identity = self.manager.set_agent_identity(identity).await?;
        Ok(serde_json::to_value(identity).expect("identity serializes"))
    }

    async fn pay(&self, params: PayParams) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let result = self.broker.fetch(&params.url, params.options).await;
        Ok(payment_envelope(result))
    }

    async fn pay_prepare(&self, params: PayParams) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let descriptor = self.broker.prepare(&params.url, params.options).await?;
        Ok(serde_json::to_value(descriptor).expect("descriptor serializes"))
    }

    async fn pay_complete(&self, params: PayCompleteParams) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let result = self
            .broker
            .complete(&params.session_id, &params.signature)
            .await;
        Ok(payment_envelope(result))
    }

    async fn set_frozen(&self, frozen: bool) -> Result<Value, ToolError> {
        self.ensure_writable()?;
        let frozen = self.manager.set_frozen(frozen).await?;
        Ok(json!({"frozen": frozen}))
    }
}

/// The normalized envelope the payment operations answer with: negotiation
/// and signing failures surface inside it with `status: 0` rather than as
/// transport-level errors.
fn payment_envelope(result: Result<PaymentOutcome, BrokerError>) -> Value {
    match result {
        Ok(outcome) => json!({
            "status": outcome.status,
            "headers": outcome.headers,
            "body": outcome.body_text,
            "payment": outcome.payment,
            "error": null,
        }),
        Err(error) => json!({
            "status": 0,
            "body": null,
            "payment": null,
            "error": error.to_string(),
        }),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::Validation(e.to_string()))
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(
    params: Value,
) -> Result<T, ToolError> {
    if params.is_null() {
        Ok(T::default())
    } else {
        parse(params)
    }
}
