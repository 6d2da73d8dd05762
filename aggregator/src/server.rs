// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Operator-facing RPC server.
//!
//! One real method: `process_operator_signed_task_response`. The reply is a
//! single byte, `0` when the signature was incorporated and `1` when it was
//! lost; operators retry on `1`. `server_running` exists for liveness
//! probes.

use crate::registry::BatchRegistry;
use crate::types::{SignedTaskResponse, REPLY_SIGNATURE_ACCEPTED, REPLY_SIGNATURE_LOST};
use crate::Aggregator;
use jsonrpc_core::{IoHandler, Params, Value};
use jsonrpc_http_server::ServerBuilder;
use std::sync::Arc;
use std::time::Duration;
use verilayer_bls_aggregation::BlsAggregationService;
use verilayer_retry::{retry, retry_with_data, RetryError, RetryParams};

/// How long the handler waits for signature processing before replying;
/// the background work continues past the reply.
const SIGNATURE_PROCESSING_BUDGET: Duration = Duration::from_secs(5);

/// Serves operator requests until the server dies. Runs under the
/// supervisor, so an exit here is logged and restarted.
pub async fn serve_operators(aggregator: Arc<Aggregator>) -> anyhow::Result<()> {
    let mut io = IoHandler::new();

    let handler = aggregator.clone();
    io.add_method("process_operator_signed_task_response", move |params: Params| {
        let handler = handler.clone();
        async move {
            let signed: SignedTaskResponse = params.parse()?;
            let reply = handler.process_operator_signed_task_response(signed).await;
            Ok(Value::from(reply))
        }
    });
    io.add_method("server_running", |_params: Params| async {
        Ok(Value::from(1i64))
    });

    let address = aggregator
        .config
        .aggregator
        .server_ip_port_address
        .parse()
        .map_err(|error| anyhow::anyhow!("parsing server_ip_port_address: {error}"))?;
    tracing::info!(address = %address, "Starting operator RPC server");
    let server = ServerBuilder::new(io).start_http(&address)?;

    // The server runs its own event loop threads; park until it stops.
    tokio::task::spawn_blocking(move || server.wait()).await?;
    Ok(())
}

impl Aggregator {
    /// Takes a response from an operator and feeds it to the aggregation
    /// service. When the batch is not in the registry yet (the operator beat
    /// the event ingester), the handler polls the registry and then falls
    /// back to a direct historical scan before giving up.
    pub(crate) async fn process_operator_signed_task_response(
        self: Arc<Self>,
        signed: SignedTaskResponse,
    ) -> u8 {
        tracing::info!(
            batch_merkle_root = %hex::encode(signed.batch_merkle_root),
            sender_address = %hex::encode(signed.sender_address),
            batch_identifier_hash = %hex::encode(signed.batch_identifier_hash),
            operator_id = %hex::encode(signed.operator_id),
            "New task response"
        );

        let task_index = match self.resolve_task_index(&signed).await {
            Some(task_index) => task_index,
            None => return REPLY_SIGNATURE_LOST,
        };

        self.metrics.inc_operator_task_responses();
        self.telemetry
            .log_operator_response(signed.batch_merkle_root, signed.operator_id)
            .await;

        process_signature_with_budget(
            self.aggregation_service.clone(),
            task_index,
            signed.batch_identifier_hash,
            signed.bls_signature,
            signed.operator_id,
        )
        .await
    }

    /// Index lookup with the short retry schedule (the event usually arrives
    /// within a few seconds), then the on-chain recovery path.
    async fn resolve_task_index(&self, signed: &SignedTaskResponse) -> Option<u32> {
        if let Some(task_index) = lookup_task_index(
            &self.registry,
            signed.batch_identifier_hash,
            &RetryParams::eth_call(),
        )
        .await
        {
            return Some(task_index);
        }

        tracing::warn!(
            batch_merkle_root = %hex::encode(signed.batch_merkle_root),
            "Task not found in the registry, trying to fetch the batch from the chain"
        );
        let batch = match self
            .reader
            .get_pending_batch_from_merkle_root(
                signed.batch_merkle_root,
                self.config.aggregator.pending_batch_fetch_block_range,
            )
            .await
        {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                tracing::warn!(
                    batch_merkle_root = %hex::encode(signed.batch_merkle_root),
                    "Pending batch not found on chain, the signature is lost"
                );
                return None;
            }
            Err(error) => {
                tracing::warn!(
                    batch_merkle_root = %hex::encode(signed.batch_merkle_root),
                    error = %error,
                    "Could not scan the chain for the pending batch"
                );
                return None;
            }
        };

        tracing::info!("Batch found on chain, adding it to the registry");
        if let Err(error) = self.add_new_task(batch).await {
            // Initialization failures are fatal for the node, not just for
            // this signature.
            tracing::error!(error = %error, "Failed to register the recovered batch");
            let _ = self.fatal_tx.send(error).await;
            return None;
        }
        match self.registry.get_by_identifier(signed.batch_identifier_hash) {
            Some(data) => Some(data.index),
            None => {
                // The recovered event hashed to a different identifier than
                // the operator claims; nothing to attribute the signature to.
                tracing::error!(
                    batch_identifier_hash = %hex::encode(signed.batch_identifier_hash),
                    "Recovered batch does not match the signed identifier"
                );
                None
            }
        }
    }
}

/// Polls the registry for the task index on the given schedule.
pub(crate) async fn lookup_task_index(
    registry: &BatchRegistry,
    batch_identifier_hash: [u8; 32],
    params: &RetryParams,
) -> Option<u32> {
    retry_with_data(
        move || async move {
            registry
                .get_by_identifier(batch_identifier_hash)
                .map(|data| data.index)
                .ok_or_else(|| {
                    RetryError::transient(anyhow::anyhow!("task not found in the registry"))
                })
        },
        params,
    )
    .await
    .ok()
}

/// Forwards the signature to the aggregation service in a background task
/// and waits at most [`SIGNATURE_PROCESSING_BUDGET`] for the outcome. On
/// timeout the reply is "lost" but processing continues, so a slow
/// aggregation call cannot stall the operator's RPC.
pub(crate) async fn process_signature_with_budget(
    aggregation_service: Arc<dyn BlsAggregationService>,
    task_index: u32,
    batch_identifier_hash: [u8; 32],
    bls_signature: eigensdk::crypto_bls::Signature,
    operator_id: [u8; 32],
) -> u8 {
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        tracing::info!(task_index, "Starting BLS signature process");
        let result = retry(
            move || {
                let signature = bls_signature.clone();
                let service = aggregation_service.clone();
                async move {
                    service
                        .process_new_signature(
                            task_index,
                            batch_identifier_hash,
                            signature,
                            operator_id,
                        )
                        .await
                        .map_err(|error| {
                            if error.is_permanent() {
                                RetryError::permanent(error)
                            } else {
                                RetryError::transient(error)
                            }
                        })
                }
            },
            &RetryParams::network(),
        )
        .await;
        match &result {
            Ok(()) => tracing::info!(task_index, "BLS process succeeded"),
            Err(error) => tracing::warn!(task_index, error = %error, "BLS aggregation service error"),
        }
        let _ = done_tx.send(result.is_ok());
    });

    match tokio::time::timeout(SIGNATURE_PROCESSING_BUDGET, done_rx).await {
        Ok(Ok(true)) => REPLY_SIGNATURE_ACCEPTED,
        Ok(_) => REPLY_SIGNATURE_LOST,
        Err(_) => {
            tracing::info!(
                task_index,
                "BLS process timed out, the operator signature may be lost"
            );
            REPLY_SIGNATURE_LOST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_signature;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use verilayer_bls_aggregation::AggregationServiceError;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        FailPermanently,
        FailTransiently,
        Hang,
    }

    struct MockAggregationService {
        behavior: Behavior,
        signature_calls: Mutex<Vec<(u32, [u8; 32], [u8; 32])>>,
    }

    impl MockAggregationService {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                signature_calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BlsAggregationService for MockAggregationService {
        async fn initialize_new_task(
            &self,
            _task_index: u32,
            _task_created_block: u32,
            _quorum_numbers: Vec<u8>,
            _quorum_threshold_percentages: Vec<u8>,
            _time_to_expiry: Duration,
        ) -> Result<(), AggregationServiceError> {
            Ok(())
        }

        async fn process_new_signature(
            &self,
            task_index: u32,
            task_digest: [u8; 32],
            _signature: eigensdk::crypto_bls::Signature,
            operator_id: [u8; 32],
        ) -> Result<(), AggregationServiceError> {
            self.signature_calls
                .lock()
                .push((task_index, task_digest, operator_id));
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::FailPermanently => Err(AggregationServiceError::SignatureVerification(
                    "signature verification failed".to_string(),
                )),
                Behavior::FailTransiently => Err(AggregationServiceError::Service(
                    anyhow::anyhow!("connection reset by peer"),
                )),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_signature_replies_zero_and_forwards_once() {
        let service = MockAggregationService::new(Behavior::Succeed);
        let reply = process_signature_with_budget(
            service.clone(),
            7,
            [3u8; 32],
            test_signature(),
            [4u8; 32],
        )
        .await;
        assert_eq!(reply, REPLY_SIGNATURE_ACCEPTED);
        let calls = service.signature_calls.lock();
        assert_eq!(calls.as_slice(), &[(7, [3u8; 32], [4u8; 32])]);
    }

    #[tokio::test(start_paused = true)]
    async fn verification_failure_replies_one_without_retrying() {
        let service = MockAggregationService::new(Behavior::FailPermanently);
        let reply = process_signature_with_budget(
            service.clone(),
            7,
            [3u8; 32],
            test_signature(),
            [4u8; 32],
        )
        .await;
        assert_eq!(reply, REPLY_SIGNATURE_LOST);
        assert_eq!(service.signature_calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_aggregation_times_out_but_keeps_processing() {
        let service = MockAggregationService::new(Behavior::Hang);
        let reply = process_signature_with_budget(
            service.clone(),
            7,
            [3u8; 32],
            test_signature(),
            [4u8; 32],
        )
        .await;
        assert_eq!(reply, REPLY_SIGNATURE_LOST);
        // The background task already forwarded the signature before the
        // reply deadline hit.
        assert_eq!(service.signature_calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_the_budget_in_the_background() {
        let service = MockAggregationService::new(Behavior::FailTransiently);
        let reply = process_signature_with_budget(
            service.clone(),
            7,
            [3u8; 32],
            test_signature(),
            [4u8; 32],
        )
        .await;
        assert_eq!(reply, REPLY_SIGNATURE_LOST);

        // Let the background retries run dry: ten attempts on the constant
        // ten-second schedule.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(service.signature_calls.lock().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_finds_a_task_inserted_while_polling() {
        let registry = Arc::new(BatchRegistry::new());
        let hash = [9u8; 32];

        let writer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            writer.insert([1u8; 32], [2u8; 20], hash, 50).unwrap();
        });

        let found = lookup_task_index(&registry, hash, &RetryParams::eth_call()).await;
        assert_eq!(found, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_gives_up_after_the_schedule() {
        let registry = BatchRegistry::new();
        let started = tokio::time::Instant::now();
        let found = lookup_task_index(&registry, [9u8; 32], &RetryParams::eth_call()).await;
        assert_eq!(found, None);
        // Three attempts: sleeps of 1 s and 2 s between them.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(8));
    }
}
