// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Chain I/O facade for the batch service manager.
//!
//! Every operation here is typed, takes a primary and a fallback endpoint,
//! and is retried: the retryable unit is "try the primary, then the fallback
//! on any error". Readers use HTTP providers, the subscriber uses WS
//! providers, and the writer holds the aggregator wallet.

use alloy::network::EthereumWallet;
use alloy::primitives::{keccak256, Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};

pub mod bindings;
mod reader;
mod subscriber;
mod writer;

pub use bindings::BatchServiceManager;
pub use bindings::BatchServiceManager::{G1Point, G2Point, NonSignerStakesAndSignature};
pub use reader::BatchServiceReader;
pub use subscriber::{BatchServiceSubscriber, NewBatchStreamConfig};
pub use writer::{bump_gas_price, BatchServiceWriter, GasBumpPolicy};

/// On-chain projection of a batch.
#[derive(Clone, Debug)]
pub struct BatchState {
    pub task_created_block: u32,
    pub responded: bool,
    pub respond_to_task_fee_limit: U256,
}

/// A decoded `NewBatch` event; both ABI versions collapse into this form.
/// V2 events carry no fee limit.
#[derive(Clone, Debug)]
pub struct NewBatchLog {
    pub batch_merkle_root: [u8; 32],
    pub sender_address: Address,
    pub task_created_block: u32,
    pub batch_data_pointer: String,
    pub respond_to_task_fee_limit: Option<U256>,
}

impl From<BatchServiceManager::NewBatchV2> for NewBatchLog {
    fn from(event: BatchServiceManager::NewBatchV2) -> Self {
        Self {
            batch_merkle_root: event.batchMerkleRoot.0,
            sender_address: event.senderAddress,
            task_created_block: event.taskCreatedBlock,
            batch_data_pointer: event.batchDataPointer,
            respond_to_task_fee_limit: None,
        }
    }
}

impl From<BatchServiceManager::NewBatchV3> for NewBatchLog {
    fn from(event: BatchServiceManager::NewBatchV3) -> Self {
        Self {
            batch_merkle_root: event.batchMerkleRoot.0,
            sender_address: event.senderAddress,
            task_created_block: event.taskCreatedBlock,
            batch_data_pointer: event.batchDataPointer,
            respond_to_task_fee_limit: Some(event.respondToTaskFeeLimit),
        }
    }
}

impl NewBatchLog {
    pub fn identifier_hash(&self) -> [u8; 32] {
        batch_identifier_hash(&self.batch_merkle_root, &self.sender_address)
    }
}

/// Two batches are the same iff they hash to the same identifier:
/// `keccak256(merkle_root ‖ sender_address)`.
pub fn batch_identifier_hash(merkle_root: &[u8; 32], sender_address: &Address) -> [u8; 32] {
    let mut preimage = [0u8; 52];
    preimage[..32].copy_from_slice(merkle_root);
    preimage[32..].copy_from_slice(sender_address.as_slice());
    keccak256(preimage).0
}

/// HTTP provider for view calls.
pub fn http_provider(url: &str) -> anyhow::Result<DynProvider> {
    Ok(ProviderBuilder::new().connect_http(url.parse()?).erased())
}

/// HTTP provider that signs and broadcasts with the aggregator wallet.
pub fn http_provider_with_wallet(
    url: &str,
    wallet: EthereumWallet,
) -> anyhow::Result<DynProvider> {
    Ok(ProviderBuilder::new()
        .wallet(wallet)
        .connect_http(url.parse()?)
        .erased())
}

/// WS provider for subscriptions.
pub async fn ws_provider(url: &str) -> anyhow::Result<DynProvider> {
    let provider = ProviderBuilder::new()
        .connect_ws(WsConnect::new(url))
        .await?;
    Ok(provider.erased())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn identifier_hash_commits_to_root_and_sender() {
        let root = hex!("0101010101010101010101010101010101010101010101010101010101010101");
        let sender = Address::from(hex!("0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a"));

        let hash = batch_identifier_hash(&root, &sender);

        let mut preimage = Vec::new();
        preimage.extend_from_slice(&root);
        preimage.extend_from_slice(sender.as_slice());
        assert_eq!(hash, keccak256(&preimage).0);

        // Any field change changes the identifier.
        let other_sender = Address::from(hex!("0b0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a"));
        assert_ne!(hash, batch_identifier_hash(&root, &other_sender));
    }
}
