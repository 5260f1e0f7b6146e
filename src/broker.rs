//! The payment broker: x402 negotiation, signing, retry, and receipts.
//!
//! A payment runs in a fixed order: the upstream request is issued once; a
//! 402 answer is parsed into a payment-required document; the first
//! compatible offer is selected and checked against the wallet's network and
//! spending rules; a pending ledger entry is written; only then is an
//! ERC-3009 authorization signed and the request retried with the payment
//! headers. The ledger entry transitions to settled or failed exactly once.
//!
//! Wallets that sign outside this process use the two-phase flow: `prepare`
//! stops before signing and parks the authorization in a payment session;
//! `complete` consumes the session (one-shot) with the caller's signature
//! and runs the same retry path.

use alloy::primitives::{Address, B256, U256};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::adapter::AdapterError;
use crate::ledger::{Ledger, LedgerError, NewTransaction, TransactionPatch};
use crate::manager::{ManagerError, WalletManager};
use crate::network::{Network, USDCDeployment};
use crate::proto::{
    self, EvmSignature, ExactEvmPayload, PaymentPayload, PaymentReceipt,
    PaymentRequiredDocument, PaymentRequirements, TransferRequest, headers,
};
use crate::rules::{RuleError, RulesEngine};
use crate::session::{PaymentSession, SessionTable};
use crate::store::{StateStore, StoreError, TxStatus, fresh_record_id};
use crate::timestamp::UnixTimestamp;
use crate::util::money::format_atomic;

/// How often expired payment sessions are swept.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Ledger reason recorded when a session expires before completion.
pub const SESSION_EXPIRED_REASON: &str = "Payment session expired";

const USDC_DECIMALS: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Active wallet is frozen; unfreeze it to make payments")]
    WalletFrozen,
    #[error("Invalid URL {0:?}")]
    InvalidUrl(String),
    #[error("Invalid HTTP method {0:?}")]
    InvalidMethod(String),
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("Malformed 402 payment-required document: {0}")]
    MalformedDocument(String),
    #[error("No compatible payment option: need an \"exact\" USDC offer on a recognized EVM network")]
    NoCompatibleOption,
    #[error("Network mismatch: wallet is on {selected}, the service accepts {offered}")]
    NetworkMismatch { selected: String, offered: String },
    #[error("Invalid amount {0:?} in payment offer")]
    InvalidAmount(String),
    #[error("Invalid payTo address {0:?} in payment offer")]
    InvalidPayTo(String),
    #[error("Expected a 402 Payment Required response, got status {0}")]
    Not402(u16),
    #[error("Payment session not found or expired")]
    SessionNotFound,
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Failed to encode payment payload: {0}")]
    Encode(String),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Caller-supplied options for a payment request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
    pub reason: Option<String>,
}

/// What the broker hands back: the upstream response, plus payment details
/// when a payment was actually made (`None` on passthrough).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body_text: String,
    pub payment: Option<PaymentInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    pub tx_hash: Option<String>,
    /// Human-readable USDC amount.
    pub amount: String,
    pub pay_to: String,
}

/// What `prepare` returns to the caller: the session handle plus the full
/// `eth_signTypedData_v4` document for the browser wallet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub domain: serde_json::Value,
    pub types: serde_json::Value,
    pub primary_type: String,
    pub message: serde_json::Value,
    pub human_amount: String,
    pub pay_to: String,
    /// CAIP-2 identifier of the network the payment settles on.
    pub network: String,
}

/// Pieces of the original request, kept so the retry replays it verbatim.
#[derive(Debug, Clone)]
struct RequestParts {
    url: Url,
    method: reqwest::Method,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl RequestParts {
    fn new(url: &str, options: &FetchOptions) -> Result<Self, BrokerError> {
        let url: Url = url
            .parse()
            .map_err(|_| BrokerError::InvalidUrl(url.to_string()))?;
        let method_str = options.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = reqwest::Method::from_bytes(method_str.as_bytes())
            .map_err(|_| BrokerError::InvalidMethod(method_str.clone()))?;
        let headers = options
            .headers
            .as_ref()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(Self {
            url,
            method,
            headers,
            body: options.body.clone(),
        })
    }

    fn from_session(session: &PaymentSession) -> Result<Self, BrokerError> {
        let method = reqwest::Method::from_bytes(session.method.as_bytes())
            .map_err(|_| BrokerError::InvalidMethod(session.method.clone()))?;
        Ok(Self {
            url: session.url.clone(),
            method,
            headers: session.headers.clone(),
            body: session.body.clone(),
        })
    }
}

/// Outcome of the 402 handshake, before any signing.
enum Negotiated {
    /// Upstream did not ask for payment; forward its response unchanged.
    Passthrough {
        status: u16,
        headers: HashMap<String, String>,
        body_text: String,
    },
    /// Upstream asked for payment and an offer passed all checks.
    Payment(PaymentContext),
}

struct PaymentContext {
    network: Network,
    accepted: PaymentRequirements,
    document: PaymentRequiredDocument,
    service: String,
    amount: U256,
    pay_to: Address,
}

pub struct PaymentBroker {
    store: Arc<StateStore>,
    manager: Arc<WalletManager>,
    ledger: Ledger,
    rules: RulesEngine,
    sessions: SessionTable,
    http: reqwest::Client,
}

impl PaymentBroker {
    pub fn new(store: Arc<StateStore>, manager: Arc<WalletManager>) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            rules: RulesEngine::new(store.clone()),
            store,
            manager,
            sessions: SessionTable::default(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetch a URL, paying for it if the server demands payment and the
    /// active wallet can sign in-process.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<PaymentOutcome, BrokerError> {
        let (parts, negotiated) = self.negotiate(url, &options).await?;
        let ctx = match negotiated {
            Negotiated::Passthrough {
                status,
                headers,
                body_text,
            } => {
                return Ok(PaymentOutcome {
                    status,
                    headers,
                    body_text,
                    payment: None,
                });
            }
            Negotiated::Payment(ctx) => ctx,
        };

        let adapter = self.manager.adapter_for_active().await?;
        let from = adapter.address().await?;
        let transfer = build_transfer(&ctx, from);

        // Pending entry lands before any signature exists, so a crash
        // mid-signing leaves an auditable record.
        let record = self.append_pending(&ctx, &options).await?;

        let signature = match adapter.sign_transfer(&transfer).await {
            Ok(signature) => signature,
            Err(error) => {
                self.fail_record(&record.id, format!("Signing failed: {error}"))
                    .await;
                return Err(error.into());
            }
        };

        self.execute_payment(
            &parts,
            &ctx.document,
            &ctx.accepted,
            &transfer,
            signature,
            &record.id,
        )
        .await
    }

    /// First half of the externally-signed flow: negotiate and construct
    /// the authorization, then park it in a session instead of signing.
    ///
    /// A non-402 upstream response is an error here: the caller asked to
    /// prepare a payment for a resource that is not payment-gated.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn prepare(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<SessionDescriptor, BrokerError> {
        let (parts, negotiated) = self.negotiate(url, &options).await?;
        let ctx = match negotiated {
            Negotiated::Passthrough { status, .. } => return Err(BrokerError::Not402(status)),
            Negotiated::Payment(ctx) => ctx,
        };

        let adapter = self.manager.adapter_for_active().await?;
        let from = adapter.address().await?;
        let transfer = build_transfer(&ctx, from);
        let record = self.append_pending(&ctx, &options).await?;

        let session_id = fresh_record_id();
        let typed = transfer.typed_data();
        let descriptor = SessionDescriptor {
            session_id: session_id.clone(),
            domain: typed["domain"].clone(),
            types: typed["types"].clone(),
            primary_type: "TransferWithAuthorization".to_string(),
            message: typed["message"].clone(),
            human_amount: format_atomic(ctx.amount, USDC_DECIMALS),
            pay_to: ctx.pay_to.to_string(),
            network: ctx.network.caip2().to_string(),
        };

        self.sessions.insert(PaymentSession {
            id: session_id,
            url: parts.url,
            method: parts.method.to_string(),
            headers: parts.headers,
            body: parts.body,
            reason: options.reason,
            accepted: ctx.accepted,
            document: ctx.document,
            expires_at: transfer.valid_before,
            transfer,
            tx_record_id: record.id,
        });

        Ok(descriptor)
    }

    /// Second half of the externally-signed flow: consume the session
    /// (one-shot) and run the retry with the caller's signature.
    #[instrument(skip(self, signature))]
    pub async fn complete(
        &self,
        session_id: &str,
        signature: &str,
    ) -> Result<PaymentOutcome, BrokerError> {
        let wallet = self.store.require_active().await?;
        if wallet.frozen {
            return Err(BrokerError::WalletFrozen);
        }

        let session = self
            .sessions
            .take(session_id)
            .ok_or(BrokerError::SessionNotFound)?;
        if UnixTimestamp::now() > session.expires_at {
            self.fail_record(&session.tx_record_id, SESSION_EXPIRED_REASON.to_string())
                .await;
            return Err(BrokerError::SessionNotFound);
        }

        let signature: EvmSignature = signature
            .parse()
            .map_err(|e: proto::EvmSignatureParseError| {
                BrokerError::InvalidSignature(e.to_string())
            })?;

        let parts = RequestParts::from_session(&session)?;
        self.execute_payment(
            &parts,
            &session.document,
            &session.accepted,
            &session.transfer,
            signature,
            &session.tx_record_id,
        )
        .await
    }

    /// Spawn the periodic sweeper that fails and drops expired sessions.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                broker.sweep_expired_sessions().await;
            }
        })
    }

    /// Drop every expired session and mark its ledger entry failed.
    /// Safe against concurrent `complete` calls: removal is atomic, so a
    /// racing completion either won the session earlier or observes
    /// *session-not-found*.
    pub async fn sweep_expired_sessions(&self) {
        for session in self.sessions.take_expired(UnixTimestamp::now()) {
            tracing::warn!(session = %session.id, "Dropping expired payment session");
            self.fail_record(&session.tx_record_id, SESSION_EXPIRED_REASON.to_string())
                .await;
        }
    }

    /// Issue the upstream request once and, on 402, select and validate an
    /// offer. Refuses to work on a frozen wallet before anything leaves the
    /// process.
    async fn negotiate(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<(RequestParts, Negotiated), BrokerError> {
        let wallet = self.store.require_active().await?;
        if wallet.frozen {
            return Err(BrokerError::WalletFrozen);
        }

        let parts = RequestParts::new(url, options)?;
        let response = self.send(&parts, &[]).await?;
        let status = response.status().as_u16();

        if status != 402 {
            let headers = collect_headers(response.headers());
            let body_text = response.text().await?;
            return Ok((
                parts,
                Negotiated::Passthrough {
                    status,
                    headers,
                    body_text,
                },
            ));
        }

        let header_document = response
            .headers()
            .get(headers::PAYMENT_REQUIRED)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body_text = response.text().await?;
        let document: PaymentRequiredDocument = match header_document {
            Some(encoded) => proto::decode_b64_json(&encoded)
                .map_err(|e| BrokerError::MalformedDocument(e.to_string()))?,
            None => serde_json::from_str(&body_text)
                .map_err(|e| BrokerError::MalformedDocument(e.to_string()))?,
        };

        let (network, accepted) = document
            .parsed_accepts()
            .find_map(|offer| {
                if offer.scheme != "exact" {
                    return None;
                }
                let network = Network::from_caip2(&offer.network)?;
                let asset: Address = offer.asset.parse().ok()?;
                if asset != USDCDeployment::by_network(network).address {
                    return None;
                }
                Some((network, offer))
            })
            .ok_or(BrokerError::NoCompatibleOption)?;

        let selected = self.store.network().await;
        if network != selected {
            return Err(BrokerError::NetworkMismatch {
                selected: selected.caip2().to_string(),
                offered: accepted.network.clone(),
            });
        }

        let service = parts.url.host_str().unwrap_or_default().to_string();
        let amount = U256::from_str(&accepted.amount)
            .map_err(|_| BrokerError::InvalidAmount(accepted.amount.clone()))?;
        let pay_to: Address = accepted
            .pay_to
            .parse()
            .map_err(|_| BrokerError::InvalidPayTo(accepted.pay_to.clone()))?;

        self.rules.enforce(amount, &service).await?;

        Ok((
            parts,
            Negotiated::Payment(PaymentContext {
                network,
                accepted,
                document,
                service,
                amount,
                pay_to,
            }),
        ))
    }

    /// Steps shared by the single-shot and two-phase flows: build the
    /// payment headers, retry the request, extract the receipt, and settle
    /// or fail the ledger entry.
    async fn execute_payment(
        &self,
        parts: &RequestParts,
        document: &PaymentRequiredDocument,
        accepted: &PaymentRequirements,
        transfer: &TransferRequest,
        signature: EvmSignature,
        record_id: &str,
    ) -> Result<PaymentOutcome, BrokerError> {
        let payload = PaymentPayload {
            x402_version: document.x402_version,
            resource: document.resource.clone(),
            accepted: accepted.clone(),
            payload: ExactEvmPayload {
                signature,
                authorization: transfer.authorization(),
            },
        };
        let encoded =
            proto::encode_b64_json(&payload).map_err(|e| BrokerError::Encode(e.to_string()))?;

        let mut extra: Vec<(&str, String)> = vec![
            (headers::PAYMENT_SIGNATURE, encoded.clone()),
            (headers::X_PAYMENT, encoded),
        ];
        let wallet = self.store.require_active().await?;
        if let Some(identity) = &wallet.agent_identity {
            if let (Some(agent_id), Some(registry)) =
                (&identity.agent_id, &identity.agent_registry)
            {
                extra.push((headers::X_AGENT_ID, agent_id.clone()));
                extra.push((headers::X_AGENT_REGISTRY, registry.clone()));
                if !identity.name.is_empty() {
                    extra.push((headers::X_AGENT_NAME, identity.name.clone()));
                }
            }
        }

        let response = match self.send(parts, &extra).await {
            Ok(response) => response,
            Err(error) => {
                self.fail_record(record_id, format!("Payment retry failed: {error}"))
                    .await;
                return Err(error.into());
            }
        };

        let status = response.status().as_u16();
        let tx_hash = extract_receipt_hash(response.headers());
        let response_headers = collect_headers(response.headers());
        let body_text = match response.text().await {
            Ok(text) => text,
            Err(error) => {
                self.fail_record(record_id, format!("Failed to read response body: {error}"))
                    .await;
                return Err(error.into());
            }
        };

        if (200..300).contains(&status) {
            self.ledger
                .update(
                    record_id,
                    TransactionPatch {
                        status: Some(TxStatus::Settled),
                        tx_hash: tx_hash.clone(),
                        reason: None,
                    },
                )
                .await?;
            tracing::info!(status, tx_hash = ?tx_hash, "Payment settled");
        } else {
            self.fail_record(record_id, format!("Payment retry returned status {status}"))
                .await;
            tracing::warn!(status, "Payment retry rejected");
        }

        Ok(PaymentOutcome {
            status,
            headers: response_headers,
            body_text,
            payment: Some(PaymentInfo {
                tx_hash,
                amount: format_atomic(transfer.value, USDC_DECIMALS),
                pay_to: transfer.to.to_string(),
            }),
        })
    }

    async fn append_pending(
        &self,
        ctx: &PaymentContext,
        options: &FetchOptions,
    ) -> Result<crate::store::TransactionRecord, BrokerError> {
        Ok(self
            .ledger
            .add(NewTransaction {
                payee: ctx.pay_to.to_string(),
                service: ctx.service.clone(),
                amount: format_atomic(ctx.amount, USDC_DECIMALS),
                asset: USDCDeployment::by_network(ctx.network).address.to_string(),
                network: ctx.network.caip2().to_string(),
                tx_hash: None,
                status: TxStatus::Pending,
                reason: options.reason.clone().unwrap_or_default(),
            })
            .await?)
    }

    async fn fail_record(&self, record_id: &str, reason: String) {
        if let Err(error) = self
            .ledger
            .update(
                record_id,
                TransactionPatch {
                    status: Some(TxStatus::Failed),
                    tx_hash: None,
                    reason: Some(reason),
                },
            )
            .await
        {
            tracing::error!(record_id, %error, "Failed to mark ledger entry failed");
        }
    }

    async fn send(
        &self,
        parts: &RequestParts,
        extra_headers: &[(&str, String)],
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.http.request(parts.method.clone(), parts.url.clone());
        for (name, value) in &parts.headers {
            request = request.header(name, value);
        }
        for (name, value) in extra_headers {
            request = request.header(*name, value);
        }
        if let Some(body) = &parts.body {
            request = request.body(body.clone());
        }
        request.send().await
    }
}

fn build_transfer(ctx: &PaymentContext, from: Address) -> TransferRequest {
    let now = UnixTimestamp::now();
    TransferRequest {
        network: ctx.network,
        from,
        to: ctx.pay_to,
        value: ctx.amount,
        valid_after: now,
        valid_before: now + ctx.accepted.max_timeout_seconds,
        nonce: B256::from(rand::rng().random::<[u8; 32]>()),
    }
}

fn collect_headers(map: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    map.iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Pull the on-chain transaction hash from the settlement receipt header,
/// under either spelling. Parse failures degrade to `None` rather than
/// failing the payment.
fn extract_receipt_hash(map: &reqwest::header::HeaderMap) -> Option<String> {
    let value = map
        .get(headers::PAYMENT_RESPONSE)
        .or_else(|| map.get(headers::X_PAYMENT_RESPONSE))?;
    let encoded = value.to_str().ok()?;
    let receipt: PaymentReceipt = proto::decode_b64_json(encoded).ok()?;
    receipt.hash().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterKind;
    use crate::rules::RulesPatch;
    use alloy::signers::Signer;
    use alloy::signers::local::PrivateKeySigner;
    use axum::Json;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAY_TO: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";
    const SEPOLIA_USDC: &str = "0x036CbD53842c5426634e7929541eC2318f3dCF7e";

    struct Upstream {
        document: serde_json::Value,
        receipt: Option<String>,
        hits: AtomicUsize,
        paid_requests: Mutex<Vec<HashMap<String, String>>>,
    }

    impl Upstream {
        fn sepolia(amount: &str, timeout: u64) -> Self {
            Self::with_network("eip155:84532", SEPOLIA_USDC, amount, timeout)
        }

        fn with_network(network: &str, asset: &str, amount: &str, timeout: u64) -> Self {
            Self {
                document: json!({
                    "x402Version": 1,
                    "accepts": [{
                        "scheme": "exact",
                        "network": network,
                        "asset": asset,
                        "amount": amount,
                        "payTo": PAY_TO,
                        "maxTimeoutSeconds": timeout,
                    }],
                }),
                receipt: Some(
                    proto::encode_b64_json(&json!({"transaction": "0xab12"})).unwrap(),
                ),
                hits: AtomicUsize::new(0),
                paid_requests: Mutex::new(Vec::new()),
            }
        }
    }

    async fn upstream_handler(
        State(upstream): State<Arc<Upstream>>,
        request_headers: HeaderMap,
    ) -> axum::response::Response {
        upstream.hits.fetch_add(1, Ordering::SeqCst);
        if request_headers.contains_key("x-payment") {
            let seen: HashMap<String, String> = request_headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            upstream.paid_requests.lock().unwrap().push(seen);
            let mut response_headers = HeaderMap::new();
            if let Some(receipt) = &upstream.receipt {
                response_headers.insert("payment-response", receipt.parse().unwrap());
            }
            return (StatusCode::OK, response_headers, "paid content").into_response();
        }
        (
            StatusCode::PAYMENT_REQUIRED,
            Json(upstream.document.clone()),
        )
            .into_response()
    }

    async fn spawn_upstream(upstream: Arc<Upstream>) -> String {
        let app = axum::Router::new()
            .fallback(upstream_handler)
            .with_state(upstream);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/premium/data")
    }

    struct Rig {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        manager: Arc<WalletManager>,
        broker: Arc<PaymentBroker>,
    }

    async fn rig_with_wallet(kind: AdapterKind, credentials: serde_json::Value) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let manager = Arc::new(WalletManager::new(store.clone()));
        manager.create(kind, credentials, None).await.unwrap();
        store.set_network(Network::BaseSepolia).await.unwrap();
        let broker = Arc::new(PaymentBroker::new(store.clone(), manager.clone()));
        Rig {
            _dir: dir,
            store,
            manager,
            broker,
        }
    }

    async fn local_key_rig() -> Rig {
        rig_with_wallet(AdapterKind::LocalKey, serde_json::Value::Null).await
    }

    async fn ledger_of(rig: &Rig) -> Vec<crate::store::TransactionRecord> {
        rig.store.require_active().await.unwrap().transactions
    }

    #[tokio::test]
    async fn happy_path_settles_and_returns_content() {
        let rig = local_key_rig().await;
        rig.broker
            .rules
            .set(
                serde_json::from_value::<RulesPatch>(json!({
                    "maxPerTransaction": "5.00",
                    "dailyCap": "50.00",
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream.clone()).await;

        let outcome = rig.broker.fetch(&url, FetchOptions::default()).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body_text, "paid content");
        let payment = outcome.payment.unwrap();
        assert_eq!(payment.amount, "0.1");
        assert_eq!(payment.tx_hash.as_deref(), Some("0xab12"));
        assert_eq!(payment.pay_to, PAY_TO);

        let transactions = ledger_of(&rig).await;
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].status, TxStatus::Settled);
        assert_eq!(transactions[0].amount, "0.1");
        assert_eq!(transactions[0].network, "eip155:84532");
        assert_eq!(transactions[0].tx_hash.as_deref(), Some("0xab12"));

        // The retry carried both payment header spellings and the payload
        // round-trips with stringified integers.
        let paid = upstream.paid_requests.lock().unwrap();
        assert_eq!(paid.len(), 1);
        let encoded = &paid[0]["payment-signature"];
        assert_eq!(encoded, &paid[0]["x-payment"]);
        let payload: PaymentPayload = proto::decode_b64_json(encoded).unwrap();
        assert_eq!(payload.accepted.amount, "100000");
        assert_eq!(
            payload.payload.authorization.value,
            U256::from(100_000u64)
        );
    }

    #[tokio::test]
    async fn passthrough_leaves_no_ledger_entry() {
        let rig = local_key_rig().await;
        let app = axum::Router::new().fallback(|| async { "free content" });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let outcome = rig
            .broker
            .fetch(&format!("http://{addr}/"), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body_text, "free content");
        assert!(outcome.payment.is_none());
        assert!(ledger_of(&rig).await.is_empty());
    }

    #[tokio::test]
    async fn over_daily_cap_leaves_no_new_entry() {
        let rig = local_key_rig().await;
        rig.broker
            .rules
            .set(
                serde_json::from_value::<RulesPatch>(json!({"dailyCap": "0.10"})).unwrap(),
            )
            .await
            .unwrap();
        // 0.09 USDC already settled today.
        rig.broker
            .ledger
            .add(NewTransaction {
                payee: PAY_TO.into(),
                service: "api.example.com".into(),
                amount: "0.09".into(),
                asset: SEPOLIA_USDC.into(),
                network: "eip155:84532".into(),
                tx_hash: Some("0x01".into()),
                status: TxStatus::Settled,
                reason: String::new(),
            })
            .await
            .unwrap();

        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream.clone()).await;

        let error = rig
            .broker
            .fetch(&url, FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            BrokerError::Rule(RuleError::OverDailyCap { .. })
        ));
        assert_eq!(ledger_of(&rig).await.len(), 1);
        assert!(upstream.paid_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_service_fails_before_any_retry() {
        let rig = local_key_rig().await;
        rig.broker
            .rules
            .set(
                serde_json::from_value::<RulesPatch>(
                    json!({"blockedServices": ["127.0.0.1"]}),
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream.clone()).await;

        let error = rig
            .broker
            .fetch(&url, FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, BrokerError::Rule(RuleError::Blocked { .. })));
        assert!(ledger_of(&rig).await.is_empty());
        assert!(upstream.paid_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn network_mismatch_names_both_sides() {
        let rig = local_key_rig().await;
        rig.store.set_network(Network::Base).await.unwrap();

        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream).await;

        let error = rig
            .broker
            .fetch(&url, FetchOptions::default())
            .await
            .unwrap_err();
        match error {
            BrokerError::NetworkMismatch { selected, offered } => {
                assert_eq!(selected, "eip155:8453");
                assert_eq!(offered, "eip155:84532");
            }
            other => panic!("expected network mismatch, got {other:?}"),
        }
        assert!(ledger_of(&rig).await.is_empty());
    }

    #[tokio::test]
    async fn incompatible_offers_are_rejected() {
        let rig = local_key_rig().await;
        // Right network, wrong asset.
        let upstream = Arc::new(Upstream::with_network(
            "eip155:84532",
            "0x0000000000000000000000000000000000001234",
            "100000",
            600,
        ));
        let url = spawn_upstream(upstream).await;
        assert!(matches!(
            rig.broker.fetch(&url, FetchOptions::default()).await,
            Err(BrokerError::NoCompatibleOption)
        ));
    }

    #[tokio::test]
    async fn frozen_wallet_refuses_before_any_upstream_call() {
        let rig = local_key_rig().await;
        rig.manager.set_frozen(true).await.unwrap();

        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream.clone()).await;

        assert!(matches!(
            rig.broker.fetch(&url, FetchOptions::default()).await,
            Err(BrokerError::WalletFrozen)
        ));
        assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
        assert!(ledger_of(&rig).await.is_empty());
    }

    #[tokio::test]
    async fn ledger_grows_by_one_per_successful_payment() {
        let rig = local_key_rig().await;
        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream).await;

        for expected in 1..=3usize {
            rig.broker.fetch(&url, FetchOptions::default()).await.unwrap();
            let transactions = ledger_of(&rig).await;
            assert_eq!(transactions.len(), expected);
            assert!(transactions.iter().all(|t| t.status == TxStatus::Settled));
        }
    }

    /// Browser-wallet rig: the key stays in the test, only the address is
    /// configured, and the test plays the part of the signing browser.
    async fn browser_rig() -> (Rig, PrivateKeySigner) {
        let signer = PrivateKeySigner::random();
        let rig = rig_with_wallet(
            AdapterKind::Browser,
            json!({"address": signer.address().to_string()}),
        )
        .await;
        (rig, signer)
    }

    async fn sign_descriptor(
        descriptor: &SessionDescriptor,
        signer: &PrivateKeySigner,
    ) -> String {
        let message = &descriptor.message;
        let transfer = TransferRequest {
            network: Network::from_caip2(&descriptor.network).unwrap(),
            from: message["from"].as_str().unwrap().parse().unwrap(),
            to: message["to"].as_str().unwrap().parse().unwrap(),
            value: U256::from_str(message["value"].as_str().unwrap()).unwrap(),
            valid_after: UnixTimestamp::from_secs(
                message["validAfter"].as_str().unwrap().parse().unwrap(),
            ),
            valid_before: UnixTimestamp::from_secs(
                message["validBefore"].as_str().unwrap().parse().unwrap(),
            ),
            nonce: message["nonce"].as_str().unwrap().parse().unwrap(),
        };
        let signature = signer.sign_hash(&transfer.signing_hash()).await.unwrap();
        EvmSignature(signature.as_bytes()).to_string()
    }

    #[tokio::test]
    async fn two_phase_flow_settles_and_is_one_shot() {
        let (rig, signer) = browser_rig().await;
        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream).await;

        let descriptor = rig
            .broker
            .prepare(&url, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(descriptor.primary_type, "TransferWithAuthorization");
        assert_eq!(descriptor.human_amount, "0.1");
        assert_eq!(descriptor.network, "eip155:84532");
        assert_eq!(descriptor.domain["name"], "USDC");

        // Pending entry exists while the session waits for a signature.
        let transactions = ledger_of(&rig).await;
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].status, TxStatus::Pending);

        let signature = sign_descriptor(&descriptor, &signer).await;
        let outcome = rig
            .broker
            .complete(&descriptor.session_id, &signature)
            .await
            .unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.payment.unwrap().tx_hash.as_deref(), Some("0xab12"));
        assert_eq!(ledger_of(&rig).await[0].status, TxStatus::Settled);

        // Double submit must fail.
        assert!(matches!(
            rig.broker.complete(&descriptor.session_id, &signature).await,
            Err(BrokerError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn concurrent_completes_produce_one_winner() {
        let (rig, signer) = browser_rig().await;
        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream).await;

        let descriptor = rig
            .broker
            .prepare(&url, FetchOptions::default())
            .await
            .unwrap();
        let signature = sign_descriptor(&descriptor, &signer).await;

        let (first, second) = tokio::join!(
            rig.broker.complete(&descriptor.session_id, &signature),
            rig.broker.complete(&descriptor.session_id, &signature),
        );
        let successes = [&first, &second]
            .iter()
            .filter(|result| result.is_ok())
            .count();
        assert_eq!(successes, 1);
        assert!(matches!(
            [first, second].into_iter().find(|r| r.is_err()).unwrap(),
            Err(BrokerError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn expired_session_is_swept_and_uncompletable() {
        let (rig, signer) = browser_rig().await;
        // maxTimeoutSeconds of zero expires the session immediately.
        let upstream = Arc::new(Upstream::sepolia("100000", 0));
        let url = spawn_upstream(upstream).await;

        let descriptor = rig
            .broker
            .prepare(&url, FetchOptions::default())
            .await
            .unwrap();
        let signature = sign_descriptor(&descriptor, &signer).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        rig.broker.sweep_expired_sessions().await;

        let transactions = ledger_of(&rig).await;
        assert_eq!(transactions[0].status, TxStatus::Failed);
        assert_eq!(transactions[0].reason, SESSION_EXPIRED_REASON);

        assert!(matches!(
            rig.broker.complete(&descriptor.session_id, &signature).await,
            Err(BrokerError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn prepare_on_unguarded_resource_is_an_error() {
        let (rig, _signer) = browser_rig().await;
        let app = axum::Router::new().fallback(|| async { "free content" });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        assert!(matches!(
            rig.broker
                .prepare(&format!("http://{addr}/"), FetchOptions::default())
                .await,
            Err(BrokerError::Not402(200))
        ));
        assert!(ledger_of(&rig).await.is_empty());
    }

    #[tokio::test]
    async fn missing_receipt_settles_with_null_hash() {
        let rig = local_key_rig().await;
        let mut upstream = Upstream::sepolia("100000", 600);
        upstream.receipt = None;
        let url = spawn_upstream(Arc::new(upstream)).await;

        let outcome = rig.broker.fetch(&url, FetchOptions::default()).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.payment.unwrap().tx_hash, None);
        let transactions = ledger_of(&rig).await;
        assert_eq!(transactions[0].status, TxStatus::Settled);
        assert_eq!(transactions[0].tx_hash, None);
    }

    #[tokio::test]
    async fn agent_identity_headers_ride_the_retry() {
        let rig = local_key_rig().await;
        rig.manager
            .set_agent_identity(crate::store::AgentIdentity {
                name: "research-bot".into(),
                description: None,
                agent_id: Some("42".into()),
                agent_registry: Some("eip155:8453:0x1234".into()),
                metadata_uri: None,
            })
            .await
            .unwrap();

        let upstream = Arc::new(Upstream::sepolia("100000", 600));
        let url = spawn_upstream(upstream.clone()).await;
        rig.broker.fetch(&url, FetchOptions::default()).await.unwrap();

        let paid = upstream.paid_requests.lock().unwrap();
        assert_eq!(paid[0]["x-agent-id"], "42");
        assert_eq!(paid[0]["x-agent-registry"], "eip155:8453:0x1234");
        assert_eq!(paid[0]["x-agent-name"], "research-bot");
    }
}
