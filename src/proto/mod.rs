//! Wire types for the x402 protocol, client side.
//!
//! A payment-gated server answers `402 Payment Required` with a
//! machine-readable document listing acceptable payments; the client retries
//! with a signed ERC-3009 `TransferWithAuthorization` in a payment header.
//! This module defines both sides of that exchange: the payment-required
//! document, the signed payload envelope, the receipt, and the EIP-712
//! structures used to produce the signature.

use alloy::primitives::{Address, B256, U256, hex};
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolStruct, eip712_domain};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use std::fmt;
use std::fmt::{Debug, Display};
use std::str::FromStr;

use crate::network::{Network, USDCDeployment};
use crate::timestamp::UnixTimestamp;
use crate::util::Base64Bytes;

/// Header names used on the x402 wire. Servers in the wild disagree on
/// spelling and casing, so the retry carries both payment headers and the
/// receipt is looked up under both names (HTTP header lookup is
/// case-insensitive).
pub mod headers {
    /// 402 response header carrying the base64-encoded payment-required document.
    pub const PAYMENT_REQUIRED: &str = "payment-required";
    /// Retry request header carrying the signed payment payload.
    pub const PAYMENT_SIGNATURE: &str = "PAYMENT-SIGNATURE";
    /// Alternate spelling of the retry payment header.
    pub const X_PAYMENT: &str = "X-PAYMENT";
    /// Response header carrying the settlement receipt.
    pub const PAYMENT_RESPONSE: &str = "payment-response";
    /// Alternate spelling of the receipt header.
    pub const X_PAYMENT_RESPONSE: &str = "x-payment-response";
    /// Optional agent identity headers attached to the retry.
    pub const X_AGENT_ID: &str = "X-AGENT-ID";
    pub const X_AGENT_REGISTRY: &str = "X-AGENT-REGISTRY";
    pub const X_AGENT_NAME: &str = "X-AGENT-NAME";
}

sol! {
    /// ERC-3009 transfer authorization, the EIP-712 struct signed by the payer.
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

/// Errors produced while encoding or decoding x402 wire payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("utf-8 decode error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a base64 string into a JSON value of the expected shape.
pub fn decode_b64_json<T: DeserializeOwned>(input: &str) -> Result<T, ProtoError> {
    let bytes = Base64Bytes::from(input).decode()?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Encode a value as JSON and base64 the result.
pub fn encode_b64_json<T: Serialize>(value: &T) -> Result<String, ProtoError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64Bytes::encode(json).to_string())
}

mod u256_string {
    use super::*;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        U256::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Represents a 65-byte EVM signature used in EIP-712 typed data.
/// Serialized as 0x-prefixed hex string with 130 characters.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl From<[u8; 65]> for EvmSignature {
    fn from(bytes: [u8; 65]) -> Self {
        EvmSignature(bytes)
    }
}

impl Debug for EvmSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvmSignature(0x{})", hex::encode(self.0))
    }
}

impl Display for EvmSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid EVM signature: must be 0x-prefixed hex of 65 bytes")]
pub struct EvmSignatureParseError;

impl FromStr for EvmSignature {
    type Err = EvmSignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s.trim_start_matches("0x")).map_err(|_| EvmSignatureParseError)?;
        let array: [u8; 65] = bytes.try_into().map_err(|_| EvmSignatureParseError)?;
        Ok(EvmSignature(array))
    }
}

impl Serialize for EvmSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EvmSignature::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// One acceptable payment as declared by the 402 response.
///
/// Fields are kept as loosely-typed strings: the `accepts` array may carry
/// offers for schemes and chains this broker does not recognize, and those
/// must not poison the ones it does. Selection parses and narrows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    /// CAIP-2 network identifier, e.g. `eip155:84532`.
    pub network: String,
    /// Token contract address.
    pub asset: String,
    /// Amount in atomic token units, decimal string.
    pub amount: String,
    /// Receiving address.
    pub pay_to: String,
    /// Seconds the authorization stays valid from now.
    pub max_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The machine-readable document behind a `402 Payment Required` response.
///
/// Arrives either base64-encoded in the `payment-required` header or as the
/// plain JSON response body. Offers are kept as raw JSON values and parsed
/// individually during selection (see [`PaymentRequirements`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredDocument {
    pub x402_version: u8,
    pub accepts: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
}

impl PaymentRequiredDocument {
    /// Parse each entry of `accepts` into typed requirements, skipping
    /// entries that do not fit the known shape.
    pub fn parsed_accepts(&self) -> impl Iterator<Item = PaymentRequirements> + '_ {
        self.accepts
            .iter()
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// EIP-712 structured data for ERC-3009-based authorization.
/// Defines who can transfer how much USDC and when.
///
/// All integer fields serialize as decimal strings and the nonce as
/// 0x-prefixed hex, matching what facilitators reconstruct for verification.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayloadAuthorization {
    pub from: Address,
    pub to: Address,
    #[serde(with = "u256_string")]
    pub value: U256,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: B256,
}

/// Full payload required to authorize an ERC-3009 transfer:
/// includes the signature and the EIP-712 struct.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayload {
    pub signature: EvmSignature,
    pub authorization: ExactEvmPayloadAuthorization,
}

/// The envelope the retry request carries, base64-encoded, in both the
/// `PAYMENT-SIGNATURE` and `X-PAYMENT` headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
    pub accepted: PaymentRequirements,
    pub payload: ExactEvmPayload,
}

/// Settlement receipt servers attach to the paid response under
/// `payment-response` / `x-payment-response`. Either hash field may carry
/// the on-chain transaction hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

impl PaymentReceipt {
    /// The on-chain transaction hash, whichever field the server used.
    pub fn hash(&self) -> Option<&str> {
        self.transaction.as_deref().or(self.tx_hash.as_deref())
    }
}

/// A fully-determined transfer authorization, before signing.
///
/// Bundles the network (which fixes the EIP-712 domain through the USDC
/// deployment) with the ERC-3009 message fields. Both the in-process signing
/// path and the externally-signed browser flow start from this.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub network: Network,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: B256,
}

impl TransferRequest {
    /// The EIP-712 domain of the USDC contract on this network.
    pub fn domain(&self) -> Eip712Domain {
        let usdc = USDCDeployment::by_network(self.network);
        eip712_domain! {
            name: usdc.eip712_name,
            version: usdc.eip712_version,
            chain_id: self.network.chain_id(),
            verifying_contract: usdc.address,
        }
    }

    fn sol_struct(&self) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.from,
            to: self.to,
            value: self.value,
            validAfter: self.valid_after.into(),
            validBefore: self.valid_before.into(),
            nonce: self.nonce,
        }
    }

    /// The EIP-712 signing hash for this transfer under the USDC domain.
    pub fn signing_hash(&self) -> B256 {
        self.sol_struct().eip712_signing_hash(&self.domain())
    }

    /// The authorization as it appears inside the payment payload.
    pub fn authorization(&self) -> ExactEvmPayloadAuthorization {
        ExactEvmPayloadAuthorization {
            from: self.from,
            to: self.to,
            value: self.value,
            valid_after: self.valid_after,
            valid_before: self.valid_before,
            nonce: self.nonce,
        }
    }

    /// The `eth_signTypedData_v4`-shaped document for external signers:
    /// `{domain, types, primaryType, message}` with all message integers
    /// stringified.
    pub fn typed_data(&self) -> serde_json::Value {
        let usdc = USDCDeployment::by_network(self.network);
        json!({
            "domain": {
                "name": usdc.eip712_name,
                "version": usdc.eip712_version,
                "chainId": self.network.chain_id(),
                "verifyingContract": usdc.address,
            },
            "types": {
                "EIP712Domain": [
                    {"name": "name", "type": "string"},
                    {"name": "version", "type": "string"},
                    {"name": "chainId", "type": "uint256"},
                    {"name": "verifyingContract", "type": "address"},
                ],
                "TransferWithAuthorization": [
                    {"name": "from", "type": "address"},
                    {"name": "to", "type": "address"},
                    {"name": "value", "type": "uint256"},
                    {"name": "validAfter", "type": "uint256"},
                    {"name": "validBefore", "type": "uint256"},
                    {"name": "nonce", "type": "bytes32"},
                ],
            },
            "primaryType": "TransferWithAuthorization",
            "message": {
                "from": self.from,
                "to": self.to,
                "value": self.value.to_string(),
                "validAfter": self.valid_after.to_string(),
                "validBefore": self.valid_before.to_string(),
                "nonce": self.nonce,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn sepolia_offer() -> serde_json::Value {
        json!({
            "scheme": "exact",
            "network": "eip155:84532",
            "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
            "amount": "100000",
            "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
            "maxTimeoutSeconds": 600
        })
    }

    #[test]
    fn decodes_document_from_base64_header() {
        let doc = json!({"x402Version": 1, "accepts": [sepolia_offer()]});
        let encoded = encode_b64_json(&doc).unwrap();
        let parsed: PaymentRequiredDocument = decode_b64_json(&encoded).unwrap();
        assert_eq!(parsed.x402_version, 1);
        let accepts: Vec<_> = parsed.parsed_accepts().collect();
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].scheme, "exact");
        assert_eq!(accepts[0].network, "eip155:84532");
        assert_eq!(accepts[0].max_timeout_seconds, 600);
    }

    #[test]
    fn unknown_offers_do_not_poison_selection() {
        let doc = PaymentRequiredDocument {
            x402_version: 1,
            accepts: vec![json!({"scheme": "exact"}), sepolia_offer()],
            resource: None,
        };
        let accepts: Vec<_> = doc.parsed_accepts().collect();
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].amount, "100000");
    }

    #[test]
    fn authorization_serializes_stringified_integers() {
        let authorization = ExactEvmPayloadAuthorization {
            from: address!("0x0000000000000000000000000000000000000001"),
            to: address!("0x0000000000000000000000000000000000000002"),
            value: U256::from(100_000u64),
            valid_after: UnixTimestamp::from_secs(1_700_000_000),
            valid_before: UnixTimestamp::from_secs(1_700_000_600),
            nonce: B256::repeat_byte(0xab),
        };
        let json = serde_json::to_value(authorization).unwrap();
        assert_eq!(json["value"], "100000");
        assert_eq!(json["validAfter"], "1700000000");
        assert_eq!(json["validBefore"], "1700000600");
        let nonce = json["nonce"].as_str().unwrap();
        assert!(nonce.starts_with("0x") && nonce.len() == 66);
    }

    #[test]
    fn signature_roundtrips_hex() {
        let signature = EvmSignature([7u8; 65]);
        let serialized = serde_json::to_string(&signature).unwrap();
        assert!(serialized.starts_with("\"0x"));
        let parsed: EvmSignature = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed, signature);
        assert!("0xdeadbeef".parse::<EvmSignature>().is_err());
    }

    #[test]
    fn receipt_reads_either_hash_field() {
        let receipt: PaymentReceipt =
            serde_json::from_value(json!({"transaction": "0xab"})).unwrap();
        assert_eq!(receipt.hash(), Some("0xab"));
        let receipt: PaymentReceipt = serde_json::from_value(json!({"txHash": "0xcd"})).unwrap();
        assert_eq!(receipt.hash(), Some("0xcd"));
        let receipt: PaymentReceipt = serde_json::from_value(json!({})).unwrap();
        assert_eq!(receipt.hash(), None);
    }

    #[test]
    fn typed_data_matches_signing_hash_domain() {
        let transfer = TransferRequest {
            network: Network::BaseSepolia,
            from: address!("0x0000000000000000000000000000000000000001"),
            to: address!("0x0000000000000000000000000000000000000002"),
            value: U256::from(100_000u64),
            valid_after: UnixTimestamp::from_secs(1_700_000_000),
            valid_before: UnixTimestamp::from_secs(1_700_000_600),
            nonce: B256::repeat_byte(0x01),
        };
        let typed = transfer.typed_data();
        assert_eq!(typed["primaryType"], "TransferWithAuthorization");
        assert_eq!(typed["domain"]["name"], "USDC");
        assert_eq!(typed["domain"]["chainId"], 84532);
        assert_eq!(typed["message"]["value"], "100000");
        // Hash is deterministic for fixed inputs.
        assert_eq!(transfer.signing_hash(), transfer.signing_hash());
    }
}
