//! Self-custodial adapter backed by a locally held private key.

use alloy::primitives::{Address, hex};
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AdapterConfig, AdapterError, AdapterKind, WalletAdapter};
use crate::proto::{EvmSignature, TransferRequest};

/// Signs ERC-3009 authorizations with an in-process secp256k1 key.
/// Provisioning generates a fresh 32-byte key when none was configured.
pub struct LocalKeyAdapter {
    signer: RwLock<Option<PrivateKeySigner>>,
}

impl LocalKeyAdapter {
    pub fn from_config(private_key: Option<&str>) -> Result<Self, AdapterError> {
        let signer = match private_key {
            Some(key) => Some(
                key.parse::<PrivateKeySigner>()
                    .map_err(|_| AdapterError::InvalidKey)?,
            ),
            None => None,
        };
        Ok(Self {
            signer: RwLock::new(signer),
        })
    }
}

#[async_trait]
impl WalletAdapter for LocalKeyAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::LocalKey
    }

    async fn provision(&self) -> Result<Address, AdapterError> {
        let mut guard = self.signer.write().await;
        if let Some(signer) = guard.as_ref() {
            return Ok(signer.address());
        }
        let signer = PrivateKeySigner::random();
        let address = signer.address();
        tracing::info!(%address, "Generated fresh local key");
        *guard = Some(signer);
        Ok(address)
    }

    async fn address(&self) -> Result<Address, AdapterError> {
        self.signer
            .read()
            .await
            .as_ref()
            .map(|signer| signer.address())
            .ok_or(AdapterError::NotInitialized)
    }

    async fn is_initialized(&self) -> bool {
        self.signer.read().await.is_some()
    }

    async fn sign_transfer(
        &self,
        transfer: &TransferRequest,
    ) -> Result<EvmSignature, AdapterError> {
        let guard = self.signer.read().await;
        let signer = guard.as_ref().ok_or(AdapterError::NotInitialized)?;
        let signature = signer
            .sign_hash(&transfer.signing_hash())
            .await
            .map_err(|e| AdapterError::Signing(e.to_string()))?;
        Ok(EvmSignature(signature.as_bytes()))
    }

    async fn serialize(&self) -> AdapterConfig {
        let private_key = self
            .signer
            .read()
            .await
            .as_ref()
            .map(|signer| hex::encode_prefixed(signer.to_bytes()));
        AdapterConfig::LocalKey { private_key }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::timestamp::UnixTimestamp;
    use alloy::primitives::{B256, U256, address};

    fn transfer(from: Address) -> TransferRequest {
        TransferRequest {
            network: Network::BaseSepolia,
            from,
            to: address!("0x209693Bc6afc0C5328bA36FaF03C514EF312287C"),
            value: U256::from(100_000u64),
            valid_after: UnixTimestamp::from_secs(1_700_000_000),
            valid_before: UnixTimestamp::from_secs(1_700_000_600),
            nonce: B256::repeat_byte(0x11),
        }
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let adapter = LocalKeyAdapter::from_config(None).unwrap();
        assert!(!adapter.is_initialized().await);
        assert!(matches!(
            adapter.address().await,
            Err(AdapterError::NotInitialized)
        ));

        let first = adapter.provision().await.unwrap();
        let second = adapter.provision().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(adapter.address().await.unwrap(), first);
    }

    #[tokio::test]
    async fn serialized_config_rehydrates_to_same_address() {
        let adapter = LocalKeyAdapter::from_config(None).unwrap();
        let address = adapter.provision().await.unwrap();

        let config = adapter.serialize().await;
        let AdapterConfig::LocalKey { private_key } = &config else {
            panic!("wrong variant");
        };
        assert!(private_key.as_deref().unwrap().starts_with("0x"));

        let rehydrated = super::super::hydrate(&config).unwrap();
        assert_eq!(rehydrated.address().await.unwrap(), address);
    }

    #[tokio::test]
    async fn signing_is_deterministic_per_transfer() {
        let adapter = LocalKeyAdapter::from_config(None).unwrap();
        let from = adapter.provision().await.unwrap();
        let request = transfer(from);
        let one = adapter.sign_transfer(&request).await.unwrap();
        let two = adapter.sign_transfer(&request).await.unwrap();
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn rejects_malformed_key() {
        assert!(matches!(
            LocalKeyAdapter::from_config(Some("not-a-key")),
            Err(AdapterError::InvalidKey)
        ));
    }
}
