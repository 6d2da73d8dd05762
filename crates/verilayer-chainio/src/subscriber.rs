// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! `NewBatch` event ingestion over WS providers.
//!
//! Two concurrent sources feed one internal channel: live subscriptions on
//! the primary and fallback endpoints (both ABI versions), and a periodic
//! historical scan that catches events the subscriptions missed. A dedup
//! stage forwards each identifier at most once per TTL window.

use crate::bindings::BatchServiceManager::{self, BatchServiceManagerInstance};
use crate::reader::{
    batches_state_call, block_number_call, filter_new_batches_call, primary_then_fallback,
    subscribe_blocks_call,
};
use crate::{BatchState, NewBatchLog};
use alloy::primitives::Address;
use alloy::providers::DynProvider;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use verilayer_retry::{retry_with_data, RetryError, RetryParams};

/// Tunables of the ingestion pipeline.
#[derive(Clone, Debug)]
pub struct NewBatchStreamConfig {
    /// Cadence of the historical-scan fallback.
    pub poll_interval: Duration,
    /// How long an identifier stays in the dedup set.
    pub dedup_ttl: Duration,
    /// How far back the historical scan looks.
    pub historical_scan_depth: u64,
}

impl Default for NewBatchStreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            dedup_ttl: Duration::from_secs(5 * 60),
            historical_scan_depth: 1000,
        }
    }
}

#[derive(Clone)]
pub struct BatchServiceSubscriber {
    service_manager: BatchServiceManagerInstance<DynProvider>,
    service_manager_fallback: BatchServiceManagerInstance<DynProvider>,
    provider: DynProvider,
    provider_fallback: DynProvider,
}

impl BatchServiceSubscriber {
    pub fn new(
        service_manager_address: Address,
        ws_provider: DynProvider,
        ws_provider_fallback: DynProvider,
    ) -> Self {
        Self {
            service_manager: BatchServiceManager::new(
                service_manager_address,
                ws_provider.clone(),
            ),
            service_manager_fallback: BatchServiceManager::new(
                service_manager_address,
                ws_provider_fallback.clone(),
            ),
            provider: ws_provider,
            provider_fallback: ws_provider_fallback,
        }
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

    pub async fn filter_new_batches(
        &self,
        from_block: u64,
    ) -> Result<Vec<NewBatchLog>, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "filterNewBatch",
                    filter_new_batches_call(&self.service_manager, from_block, None),
                    move || filter_new_batches_call(&self.service_manager_fallback, from_block, None),
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    /// Anti-reorg guard before submitting a response: if the chain head is
    /// still at the batch's creation block, await one new head.
    pub async fn wait_for_one_block(&self, start_block: u64) -> Result<(), RetryError> {
        let current_block = self.block_number().await?;
        if current_block > start_block {
            return Ok(());
        }
        let subscription = retry_with_data(
            move || {
                primary_then_fallback(
                    "subscribeNewHead",
                    subscribe_blocks_call(&self.provider),
                    move || subscribe_blocks_call(&self.provider_fallback),
                )
            },
            &RetryParams::eth_call(),
        )
        .await?;
        subscription.into_stream().next().await;
        Ok(())
    }

    /// Starts the ingestion pipeline.
    ///
    /// Returns the deduplicated `new_batch` channel plus a fatal-error
    /// channel that only fires when the primary and the fallback
    /// subscription have both permanently failed to (re)subscribe.
    pub fn subscribe_to_new_batches(
        &self,
        config: NewBatchStreamConfig,
    ) -> (mpsc::Receiver<NewBatchLog>, oneshot::Receiver<anyhow::Error>) {
        // The forward channel is unbuffered so a slow consumer backpressures
        // the WS reader instead of growing a queue.
        let (new_batch_tx, new_batch_rx) = mpsc::channel(1);
        let (internal_tx, internal_rx) = mpsc::channel(1);
        let (fatal_tx, fatal_rx) = oneshot::channel();

        let primary = tokio::spawn(watch_new_batches(
            self.service_manager.clone(),
            internal_tx.clone(),
            "primary",
        ));
        let fallback = tokio::spawn(watch_new_batches(
            self.service_manager_fallback.clone(),
            internal_tx.clone(),
            "fallback",
        ));
        tokio::spawn(async move {
            // Either task only finishes on a permanent subscription failure;
            // a single surviving endpoint keeps the ingester healthy.
            let (primary_error, fallback_error) = tokio::join!(primary, fallback);
            let _ = fatal_tx.send(anyhow::anyhow!(
                "new-batch subscriptions failed on both endpoints: primary: {:?}; fallback: {:?}",
                primary_error,
                fallback_error,
            ));
        });

        let poller = self.clone();
        let poll_tx = internal_tx;
        let poll_config = config.clone();
        verilayer_supervisor::supervise("batch_poller", move || {
            let poller = poller.clone();
            let poll_tx = poll_tx.clone();
            let poll_config = poll_config.clone();
            async move {
                loop {
                    tokio::time::sleep(poll_config.poll_interval).await;
                    match poller
                        .latest_not_responded_batch(poll_config.historical_scan_depth)
                        .await
                    {
                        Ok(Some(batch)) => {
                            if poll_tx.send(batch).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(error) => {
                            tracing::debug!(error = %error, "Historical batch scan failed");
                        }
                    }
                }
            }
        });

        tokio::spawn(deduplicate_new_batches(
            internal_rx,
            new_batch_tx,
            config.dedup_ttl,
        ));

        (new_batch_rx, fatal_rx)
    }

    /// The newest event in the scan window whose batch has not been
    /// responded to yet.
    async fn latest_not_responded_batch(
        &self,
        historical_scan_depth: u64,
    ) -> Result<Option<NewBatchLog>, RetryError> {
        let latest_block = self.block_number().await?;
        let from_block = latest_block.saturating_sub(historical_scan_depth);
        let events = self.filter_new_batches(from_block).await?;
        for event in events.into_iter().rev() {
            let state = self.batches_state(event.identifier_hash()).await?;
            if !state.responded {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

/// Keeps both event-version subscriptions of one endpoint alive, forwarding
/// decoded events. Returns only when resubscription has permanently failed.
async fn watch_new_batches(
    service_manager: BatchServiceManagerInstance<DynProvider>,
    internal_tx: mpsc::Sender<NewBatchLog>,
    endpoint: &'static str,
) -> anyhow::Error {
    loop {
        let service_manager = &service_manager;
        let subscriptions = retry_with_data(
            move || async move {
                let v2 = service_manager
                    .NewBatchV2_filter()
                    .subscribe()
                    .await
                    .map_err(RetryError::transient)?;
                let v3 = service_manager
                    .NewBatchV3_filter()
                    .subscribe()
                    .await
                    .map_err(RetryError::transient)?;
                Ok((v2, v3))
            },
            &RetryParams::eth_call(),
        )
        .await;

        let (v2, v3) = match subscriptions {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                tracing::error!(
                    endpoint,
                    error = %error,
                    "Failed to subscribe to new-batch events"
                );
                return error.into_inner();
            }
        };
        tracing::info!(endpoint, "Subscribed to new-batch events");

        let mut v2_stream = v2.into_stream();
        let mut v3_stream = v3.into_stream();
        loop {
            let forwarded = tokio::select! {
                item = v2_stream.next() => decode_subscription_item(item, endpoint),
                item = v3_stream.next() => decode_subscription_item(item, endpoint),
            };
            match forwarded {
                SubscriptionItem::Event(log) => {
                    if internal_tx.send(log).await.is_err() {
                        // Consumer is gone; nothing left to do.
                        return anyhow::anyhow!("new-batch consumer dropped");
                    }
                }
                SubscriptionItem::Skip => {}
                SubscriptionItem::Ended => break,
            }
        }
        tracing::warn!(endpoint, "New-batch subscription ended, resubscribing");
    }
}

enum SubscriptionItem {
    Event(NewBatchLog),
    Skip,
    Ended,
}

fn decode_subscription_item<E: Into<NewBatchLog>>(
    item: Option<alloy::sol_types::Result<(E, alloy::rpc::types::Log)>>,
    endpoint: &'static str,
) -> SubscriptionItem {
    match item {
        Some(Ok((event, _log))) => SubscriptionItem::Event(event.into()),
        Some(Err(error)) => {
            tracing::warn!(endpoint, error = %error, "Undecodable new-batch event, skipping");
            SubscriptionItem::Skip
        }
        None => SubscriptionItem::Ended,
    }
}

/// Forwards each identifier at most once per TTL window. The window exists
/// because the subscription and poll paths can both observe the same event;
/// anything older is handled idempotently by the batch registry.
async fn deduplicate_new_batches(
    mut internal_rx: mpsc::Receiver<NewBatchLog>,
    new_batch_tx: mpsc::Sender<NewBatchLog>,
    dedup_ttl: Duration,
) {
    let seen: Arc<Mutex<HashSet<[u8; 32]>>> = Arc::new(Mutex::new(HashSet::new()));
    while let Some(batch) = internal_rx.recv().await {
        let identifier_hash = batch.identifier_hash();
        if !seen.lock().insert(identifier_hash) {
            continue;
        }
        tracing::info!(
            batch_merkle_root = %alloy::hex::encode(batch.batch_merkle_root),
            sender_address = %batch.sender_address,
            batch_identifier_hash = %alloy::hex::encode(identifier_hash),
            "Received new batch"
        );
        if new_batch_tx.send(batch).await.is_err() {
            return;
        }
        let seen = seen.clone();
        tokio::spawn(async move {
            tokio::time::sleep(dedup_ttl).await;
            seen.lock().remove(&identifier_hash);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    fn batch(root_byte: u8) -> NewBatchLog {
        NewBatchLog {
            batch_merkle_root: [root_byte; 32],
            sender_address: Address::repeat_byte(0x0a),
            task_created_block: 100,
            batch_data_pointer: String::new(),
            respond_to_task_fee_limit: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_batches_are_forwarded_once_within_ttl() {
        let (internal_tx, internal_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        tokio::spawn(deduplicate_new_batches(
            internal_rx,
            out_tx,
            Duration::from_secs(300),
        ));

        internal_tx.send(batch(1)).await.unwrap();
        internal_tx.send(batch(1)).await.unwrap();
        internal_tx.send(batch(2)).await.unwrap();

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.batch_merkle_root, [1u8; 32]);
        let second = out_rx.recv().await.unwrap();
        assert_eq!(second.batch_merkle_root, [2u8; 32]);

        // Within the TTL the duplicate was dropped silently.
        claims::assert_err!(out_rx.try_recv());
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_entry_expires_after_ttl() {
        let (internal_tx, internal_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        tokio::spawn(deduplicate_new_batches(
            internal_rx,
            out_tx,
            Duration::from_secs(300),
        ));

        internal_tx.send(batch(1)).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap().batch_merkle_root, [1u8; 32]);

        tokio::time::sleep(Duration::from_secs(301)).await;
        internal_tx.send(batch(1)).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap().batch_merkle_root, [1u8; 32]);
    }
}
