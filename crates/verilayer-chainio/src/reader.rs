// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Read-only service-manager operations over HTTP providers.

use crate::bindings::BatchServiceManager::{self, BatchServiceManagerInstance};
use crate::{batch_identifier_hash, BatchState, NewBatchLog};
use alloy::eips::BlockId;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider};
use std::fmt::Display;
use std::future::Future;
use verilayer_retry::{retry_with_data, RetryError, RetryParams};

/// Runs the primary endpoint's future, falling back to the secondary on any
/// error. The combined call is the unit the retry engine re-runs.
pub(crate) async fn primary_then_fallback<T, E1, E2, Fut1, Fut2, F>(
    operation: &'static str,
    primary: Fut1,
    fallback: F,
) -> Result<T, RetryError>
where
    Fut1: Future<Output = Result<T, E1>>,
    Fut2: Future<Output = Result<T, E2>>,
    F: FnOnce() -> Fut2,
    E1: Display,
    E2: Display,
{
    match primary.await {
        Ok(value) => Ok(value),
        Err(primary_error) => {
            tracing::warn!(
                operation,
                error = %primary_error,
                "Primary endpoint failed, trying fallback"
            );
            fallback().await.map_err(|fallback_error| {
                RetryError::transient(anyhow::anyhow!(
                    "{operation} failed on both endpoints: primary: {primary_error}; \
                     fallback: {fallback_error}"
                ))
            })
        }
    }
}

pub struct BatchServiceReader {
    service_manager: BatchServiceManagerInstance<DynProvider>,
    service_manager_fallback: BatchServiceManagerInstance<DynProvider>,
    provider: DynProvider,
    provider_fallback: DynProvider,
}

impl BatchServiceReader {
    pub fn new(
        service_manager_address: Address,
        provider: DynProvider,
        provider_fallback: DynProvider,
    ) -> Self {
        Self {
            service_manager: BatchServiceManager::new(service_manager_address, provider.clone()),
            service_manager_fallback: BatchServiceManager::new(
                service_manager_address,
                provider_fallback.clone(),
            ),
            provider,
            provider_fallback,
        }
    }

    pub async fn batches_state(
        &self,
        batch_identifier_hash: [u8; 32],
    ) -> Result<BatchState, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "batchesState",
                    batches_state_call(&self.service_manager, batch_identifier_hash),
                    move || batches_state_call(&self.service_manager_fallback, batch_identifier_hash),
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    pub async fn batcher_balance(&self, sender_address: Address) -> Result<U256, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "batchersBalances",
                    batcher_balance_call(&self.service_manager, sender_address),
                    move || batcher_balance_call(&self.service_manager_fallback, sender_address),
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    pub async fn balance_at(
        &self,
        address: Address,
        block_number: Option<u64>,
    ) -> Result<U256, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "balanceAt",
                    balance_at_call(&self.provider, address, block_number),
                    move || balance_at_call(&self.provider_fallback, address, block_number),
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    pub async fn block_number(&self) -> Result<u64, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "blockNumber",
                    block_number_call(&self.provider),
                    move || block_number_call(&self.provider_fallback),
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    /// Scans the last `block_range` blocks for a `NewBatch` event with the
    /// given merkle root that has not been responded to yet. This is the
    /// recovery path for operator signatures that arrive before the event
    /// ingester has seen the batch.
    pub async fn get_pending_batch_from_merkle_root(
        &self,
        batch_merkle_root: [u8; 32],
        block_range: u64,
    ) -> Result<Option<NewBatchLog>, RetryError> {
        let latest_block = self.block_number().await?;
        let from_block = latest_block.saturating_sub(block_range);

        let events = self.filter_new_batches(from_block, None).await?;
        for event in events.into_iter().rev() {
            if event.batch_merkle_root != batch_merkle_root {
                continue;
            }
            let state = self.batches_state(event.identifier_hash()).await?;
            if !state.responded {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Garbage-collection probe: the identifier hash of the newest batch
    /// that is at least `tasks_age` blocks old, searched within a
    /// `tasks_interval`-block window. `None` when the window holds no batch.
    pub async fn get_old_batch_hash(
        &self,
        tasks_age: u64,
        tasks_interval: u64,
    ) -> Result<Option<[u8; 32]>, RetryError> {
        let latest_block = self.block_number().await?;
        if latest_block < tasks_age {
            return Ok(None);
        }
        let to_block = latest_block - tasks_age;
        let from_block = to_block.saturating_sub(tasks_interval);

        let events = self.filter_new_batches(from_block, Some(to_block)).await?;
        Ok(events
            .last()
            .map(|event| batch_identifier_hash(&event.batch_merkle_root, &event.sender_address)))
    }

    /// Queries both event versions and returns them merged, oldest first.
    async fn filter_new_batches(
        &self,
        from_block: u64,
        to_block: Option<u64>,
    ) -> Result<Vec<NewBatchLog>, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "filterNewBatch",
                    filter_new_batches_call(&self.service_manager, from_block, to_block),
                    move || filter_new_batches_call(&self.service_manager_fallback, from_block, to_block),
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }
}

pub(crate) async fn block_number_call(
    provider: &DynProvider,
) -> Result<u64, alloy::transports::TransportError> {
    provider.get_block_number().await
}

pub(crate) async fn balance_call(
    provider: &DynProvider,
    address: Address,
) -> Result<U256, alloy::transports::TransportError> {
    provider.get_balance(address).await
}

pub(crate) async fn gas_price_call(
    provider: &DynProvider,
) -> Result<u128, alloy::transports::TransportError> {
    provider.get_gas_price().await
}

pub(crate) async fn subscribe_blocks_call(
    provider: &DynProvider,
) -> Result<alloy::pubsub::Subscription<alloy::rpc::types::Header>, alloy::transports::TransportError>
{
    provider.subscribe_blocks().await
}

pub(crate) async fn batches_state_call(
    service_manager: &BatchServiceManagerInstance<DynProvider>,
    batch_identifier_hash: [u8; 32],
) -> Result<BatchState, alloy::contract::Error> {
    let state = service_manager
        .batchesState(batch_identifier_hash.into())
        .call()
        .await?;
    Ok(BatchState {
        task_created_block: state.taskCreatedBlock,
        responded: state.responded,
        respond_to_task_fee_limit: state.respondToTaskFeeLimit,
    })
}

pub(crate) async fn batcher_balance_call(
    service_manager: &BatchServiceManagerInstance<DynProvider>,
    sender_address: Address,
) -> Result<U256, alloy::contract::Error> {
    service_manager
        .batchersBalances(sender_address)
        .call()
        .await
}

async fn balance_at_call(
    provider: &DynProvider,
    address: Address,
    block_number: Option<u64>,
) -> Result<U256, alloy::transports::TransportError> {
    match block_number {
        Some(number) => {
            provider
                .get_balance(address)
                .block_id(BlockId::number(number))
                .await
        }
        None => provider.get_balance(address).await,
    }
}

pub(crate) async fn filter_new_batches_call(
    service_manager: &BatchServiceManagerInstance<DynProvider>,
    from_block: u64,
    to_block: Option<u64>,
) -> Result<Vec<NewBatchLog>, alloy::contract::Error> {
    let v2_filter = {
        let mut filter = service_manager.NewBatchV2_filter().from_block(from_block);
        if let Some(to_block) = to_block {
            filter = filter.to_block(to_block);
        }
        filter
    };
    let v3_filter = {
        let mut filter = service_manager.NewBatchV3_filter().from_block(from_block);
        if let Some(to_block) = to_block {
            filter = filter.to_block(to_block);
        }
        filter
    };

    let mut events: Vec<(u64, NewBatchLog)> = Vec::new();
    for (event, log) in v2_filter.query().await? {
        events.push((log.block_number.unwrap_or_default(), event.into()));
    }
    for (event, log) in v3_filter.query().await? {
        events.push((log.block_number.unwrap_or_default(), event.into()));
    }
    events.sort_by_key(|(block_number, _)| *block_number);
    Ok(events.into_iter().map(|(_, event)| event).collect())
}
