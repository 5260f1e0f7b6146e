//! Chain I/O: USDC balance queries over JSON-RPC.

use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use alloy::sol;
use url::Url;

use crate::network::{Network, USDCDeployment};
use crate::util::money::format_atomic;

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid RPC endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("RPC call failed: {0}")]
    Rpc(String),
}

/// Query the USDC balance of `owner` on the given network and format it as
/// a human-readable decimal string using the token's on-chain decimals.
pub async fn usdc_balance(network: Network, owner: Address) -> Result<String, ChainError> {
    let usdc = USDCDeployment::by_network(network);
    let endpoint: Url = network.rpc_url().parse()?;
    let provider = ProviderBuilder::new().connect_http(endpoint);
    let contract = IERC20::new(usdc.address, provider);

    let raw = contract
        .balanceOf(owner)
        .call()
        .await
        .map_err(|e| ChainError::Rpc(e.to_string()))?;
    let decimals = contract
        .decimals()
        .call()
        .await
        .map_err(|e| ChainError::Rpc(e.to_string()))?;

    Ok(format_atomic(raw, decimals as u32))
}
