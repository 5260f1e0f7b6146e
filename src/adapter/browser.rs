//! Externally-signing adapter: the key lives in a connected browser wallet.
//!
//! Only the address is known to this process. Any server-side signing
//! attempt is refused; payments go through the broker's prepare/complete
//! flow where the browser supplies the signature.

use alloy::primitives::Address;
use async_trait::async_trait;

use super::{AdapterConfig, AdapterError, AdapterKind, WalletAdapter, parse_address};
use crate::proto::{EvmSignature, TransferRequest};

pub struct BrowserAdapter {
    address: Address,
}

impl BrowserAdapter {
    pub fn new(address: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            address: parse_address(address)?,
        })
    }
}

#[async_trait]
impl WalletAdapter for BrowserAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Browser
    }

    async fn provision(&self) -> Result<Address, AdapterError> {
        Ok(self.address)
    }

    async fn address(&self) -> Result<Address, AdapterError> {
        Ok(self.address)
    }

    async fn is_initialized(&self) -> bool {
        true
    }

    async fn sign_transfer(
        &self,
        _transfer: &TransferRequest,
    ) -> Result<EvmSignature, AdapterError> {
        Err(AdapterError::MustSignClientSide)
    }

    async fn serialize(&self) -> AdapterConfig {
        AdapterConfig::Browser {
            address: self.address.to_string(),
        }
    }
}
