//! Clawlet: a local-first spend-control broker for the x402 protocol.
//!
//! An agent (or a human via a dashboard) asks the broker to fetch a URL.
//! The broker performs the `402 Payment Required` handshake, enforces the
//! active wallet's spending rules, produces an ERC-3009
//! `TransferWithAuthorization` signature through a pluggable wallet adapter,
//! retries the request with the signed authorization, records the outcome
//! in a per-wallet ledger, and returns the upstream response.
//!
//! # Modules
//!
//! - [`network`] — Supported chains (Base, Base Sepolia), CAIP-2 mapping, and USDC deployments.
//! - [`proto`] — x402 wire types: payment-required documents, signed payloads, receipts, EIP-712.
//! - [`store`] — The persisted multi-wallet document, with atomic writes and legacy migration.
//! - [`ledger`] — Per-wallet transaction records and the daily spend computation.
//! - [`rules`] — Spending rules (per-transaction limit, daily cap, allow/block lists).
//! - [`adapter`] — Wallet adapters: local key, managed providers, browser.
//! - [`manager`] — Wallet lifecycle: create, switch, remove, freeze, identity.
//! - [`broker`] — The payment engine: negotiate, sign, retry, receipts, payment sessions.
//! - [`tools`] — The operation catalog shared by both RPC bindings.
//! - [`handlers`] — JSON-over-HTTP binding (axum).
//! - [`stdio`] — Line-delimited JSON-RPC binding for agent runtimes.
//! - [`chain`] — ERC-20 balance queries over JSON-RPC.

pub mod adapter;
pub mod broker;
pub mod chain;
pub mod config;
pub mod handlers;
pub mod ledger;
pub mod manager;
pub mod network;
pub mod proto;
pub mod rules;
pub mod session;
pub mod stdio;
pub mod store;
pub mod telemetry;
pub mod timestamp;
pub mod tools;
pub mod util;
