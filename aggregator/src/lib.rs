// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! The aggregator node.
//!
//! Wires the event ingester, the batch registry, the operator RPC server,
//! the BLS aggregation service and the response submitter together, and
//! runs the select loop that drives them.

use crate::config::Config;
use crate::registry::{BatchRegistry, Inserted};
use crate::telemetry::Telemetry;
use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use anyhow::Context;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use verilayer_bls_aggregation::{
    AggregatedResponse, BlsAggregationService, BlsAggregationServiceResponse,
};
use verilayer_chainio::{
    BatchServiceReader, BatchServiceSubscriber, BatchServiceWriter, G1Point, G2Point,
    GasBumpPolicy, NewBatchLog, NewBatchStreamConfig, NonSignerStakesAndSignature,
};
use verilayer_metrics::{start_metrics_server, Metrics};

pub mod config;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod types;

/// Every batch belongs to quorum 0 with a 67 % stake threshold. The
/// aggregation service takes them as per-task parameters, so loosening this
/// later is a local change.
const QUORUM_NUMBER: u8 = 0;
const QUORUM_THRESHOLD_PERCENTAGE: u8 = 67;

pub struct Aggregator {
    pub(crate) config: Config,
    pub(crate) registry: BatchRegistry,
    pub(crate) reader: BatchServiceReader,
    subscriber: BatchServiceSubscriber,
    writer: BatchServiceWriter,
    pub(crate) aggregation_service: Arc<dyn BlsAggregationService>,
    wallet_mutex: tokio::sync::Mutex<()>,
    pub(crate) telemetry: Telemetry,
    pub(crate) metrics: Metrics,
    metrics_registry: prometheus::Registry,
    pub(crate) fatal_tx: mpsc::Sender<anyhow::Error>,
    fatal_rx: Mutex<Option<mpsc::Receiver<anyhow::Error>>>,
    task_initialized_at: Mutex<HashMap<u32, Instant>>,
}

impl Aggregator {
    /// Builds the node. The wallet backs the writer's providers; the
    /// aggregation service is expected to be started already, with its
    /// response channel handed to [`Aggregator::start`].
    pub async fn new(
        config: Config,
        aggregation_service: Arc<dyn BlsAggregationService>,
        wallet: EthereumWallet,
        aggregator_address: Address,
    ) -> anyhow::Result<Arc<Self>> {
        let metrics_registry = prometheus::Registry::new();
        let metrics = Metrics::new(&metrics_registry)?;
        let telemetry = Telemetry::new(&config.aggregator.telemetry_ip_port_address);

        let service_manager_address = config.aggregator.avs_service_manager_address;
        let reader = BatchServiceReader::new(
            service_manager_address,
            verilayer_chainio::http_provider(&config.base.eth_rpc_url)?,
            verilayer_chainio::http_provider(&config.base.eth_rpc_url_fallback)?,
        );
        let writer = BatchServiceWriter::new(
            service_manager_address,
            verilayer_chainio::http_provider_with_wallet(&config.base.eth_rpc_url, wallet.clone())?,
            verilayer_chainio::http_provider_with_wallet(
                &config.base.eth_rpc_url_fallback,
                wallet,
            )?,
            aggregator_address,
            metrics.clone(),
        );
        let subscriber = BatchServiceSubscriber::new(
            service_manager_address,
            verilayer_chainio::ws_provider(&config.base.eth_ws_url)
                .await
                .context("connecting primary WS endpoint")?,
            verilayer_chainio::ws_provider(&config.base.eth_ws_url_fallback)
                .await
                .context("connecting fallback WS endpoint")?,
        );

        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        Ok(Arc::new(Self {
            config,
            registry: BatchRegistry::new(),
            reader,
            subscriber,
            writer,
            aggregation_service,
            wallet_mutex: tokio::sync::Mutex::new(()),
            telemetry,
            metrics,
            metrics_registry,
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            task_initialized_at: Mutex::new(HashMap::new()),
        }))
    }

    /// Runs the aggregator until `cancel` fires (clean shutdown) or a fatal
    /// error occurs.
    pub async fn start(
        self: Arc<Self>,
        mut response_rx: mpsc::UnboundedReceiver<AggregatedResponse>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!("Starting aggregator");

        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .take()
            .context("aggregator already started")?;

        let rpc_server = self.clone();
        verilayer_supervisor::supervise("operator_rpc_server", move || {
            let rpc_server = rpc_server.clone();
            async move {
                if let Err(error) = crate::server::serve_operators(rpc_server).await {
                    tracing::error!(error = %error, "Operator RPC server failed");
                }
            }
        });

        // A disabled metrics server must never resolve its error channel, so
        // the sender is kept alive for the life of the loop.
        let (mut metrics_error_rx, _metrics_error_tx) = if self.config.aggregator.enable_metrics {
            let address = self
                .config
                .aggregator
                .metrics_ip_port_address
                .parse()
                .context("parsing metrics_ip_port_address")?;
            (
                start_metrics_server(address, self.metrics_registry.clone()),
                None,
            )
        } else {
            let (tx, rx) = oneshot::channel();
            (rx, Some(tx))
        };

        let scheduler = verilayer_sched::JobRunner::new();
        scheduler.start();
        let collector = self.clone();
        tracing::info!(
            period_secs = self.config.aggregator.garbage_collector_period.as_secs(),
            "Removing finalized batches from the registry periodically"
        );
        scheduler.every(self.config.aggregator.garbage_collector_period, move || {
            let collector = collector.clone();
            async move { collector.collect_finalized_batches().await }.boxed()
        });

        let (mut new_batch_rx, mut ingester_fatal_rx) = self
            .subscriber
            .subscribe_to_new_batches(NewBatchStreamConfig::default());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Shutdown requested, stopping aggregator");
                    return Ok(());
                }
                error = &mut metrics_error_rx => {
                    anyhow::bail!("metrics server failed: {:?}", error);
                }
                error = &mut ingester_fatal_rx => {
                    anyhow::bail!("new-batch ingestion failed: {:?}", error);
                }
                Some(error) = fatal_rx.recv() => {
                    return Err(error);
                }
                response = response_rx.recv() => {
                    let Some(response) = response else {
                        anyhow::bail!("aggregation service response channel closed");
                    };
                    tracing::info!(
                        task_index = response.task_index,
                        "Received response from BLS aggregation service"
                    );
                    let handler = self.clone();
                    verilayer_supervisor::one_shot(
                        handler.handle_aggregated_response(response),
                        None,
                    );
                }
                batch = new_batch_rx.recv() => {
                    let Some(batch) = batch else {
                        anyhow::bail!("new-batch channel closed");
                    };
                    self.add_new_task(batch).await?;
                }
            }
        }
    }

    /// Registers a freshly observed batch and initializes its aggregation
    /// task. A batch the registry already knows is skipped idempotently; a
    /// failure to initialize the task is fatal, because the batch could
    /// never reach quorum locally.
    pub(crate) async fn add_new_task(&self, batch: NewBatchLog) -> anyhow::Result<()> {
        self.telemetry.init_new_trace(batch.batch_merkle_root).await;
        let identifier_hash = batch.identifier_hash();
        tracing::info!(
            batch_merkle_root = %hex::encode(batch.batch_merkle_root),
            sender_address = %batch.sender_address,
            batch_identifier_hash = %hex::encode(identifier_hash),
            "Adding new task"
        );

        let inserted = match self.registry.insert(
            batch.batch_merkle_root,
            batch.sender_address.into_array(),
            identifier_hash,
            u64::from(batch.task_created_block),
        ) {
            Ok(inserted) => inserted,
            Err(error) => {
                tracing::error!(error = %error, "Failed to add batch to registry");
                return Ok(());
            }
        };
        let data = match inserted {
            Inserted::New(data) => data,
            Inserted::Existing(_) => {
                // Duplicate beyond the ingester's dedup window; the task is
                // already initialized.
                return Ok(());
            }
        };

        self.task_initialized_at
            .lock()
            .insert(data.index, Instant::now());
        self.aggregation_service
            .initialize_new_task(
                data.index,
                batch.task_created_block,
                vec![QUORUM_NUMBER],
                vec![QUORUM_THRESHOLD_PERCENTAGE],
                self.config.aggregator.bls_service_task_timeout,
            )
            .await
            .with_context(|| format!("initializing aggregation task {}", data.index))?;
        self.metrics.inc_aggregator_received_tasks();
        Ok(())
    }

    /// Consumes one quorum-reached (or timed-out) response and drives the
    /// on-chain submission.
    async fn handle_aggregated_response(self: Arc<Self>, response: AggregatedResponse) {
        let Some(batch) = self.registry.get_by_index(response.task_index) else {
            tracing::error!(task_index = response.task_index, "Missing task for response");
            return;
        };
        if let Some(initialized_at) = self
            .task_initialized_at
            .lock()
            .remove(&response.task_index)
        {
            self.metrics
                .observe_task_quorum_reached_latency(initialized_at.elapsed());
        }
        let batch_merkle_root = batch.batch_merkle_root;

        let aggregation = match response.result {
            Ok(aggregation) => aggregation,
            Err(error) => {
                tracing::error!(
                    task_index = response.task_index,
                    batch_identifier_hash = %hex::encode(batch.identifier_hash),
                    error = %error,
                    "Aggregation service response carries an error"
                );
                self.telemetry
                    .log_task_error(batch_merkle_root, &error.to_string())
                    .await;
                self.telemetry.finish_trace(batch_merkle_root);
                return;
            }
        };

        self.telemetry.log_quorum_reached(batch_merkle_root).await;
        tracing::info!(
            task_index = response.task_index,
            batch_identifier_hash = %hex::encode(batch.identifier_hash),
            "Threshold reached"
        );

        let non_signer_stakes_and_signature =
            match build_non_signer_stakes_and_signature(&aggregation) {
                Ok(value) => value,
                Err(error) => {
                    tracing::error!(error = %error, "Could not convert aggregated signature");
                    self.telemetry
                        .log_task_error(batch_merkle_root, &error.to_string())
                        .await;
                    self.telemetry.finish_trace(batch_merkle_root);
                    return;
                }
            };

        // Submitting in the batch's creation block is rejected by some RPCs.
        if let Err(error) = self.subscriber.wait_for_one_block(batch.created_block).await {
            tracing::error!(error = %error, "Error waiting for one block, sending anyway");
        }

        tracing::info!(
            task_index = response.task_index,
            batch_identifier_hash = %hex::encode(batch.identifier_hash),
            batch_merkle_root = %hex::encode(batch_merkle_root),
            "Sending aggregated response onchain"
        );
        let policy = GasBumpPolicy {
            base_bump_percentage: self.config.aggregator.gas_base_bump_percentage,
            incremental_bump_percentage: self.config.aggregator.gas_bump_incremental_percentage,
            bump_percentage_limit: self.config.aggregator.gas_bump_percentage_limit,
            time_to_wait_before_bump: self.config.aggregator.time_to_wait_before_bump,
        };
        let bump_telemetry = self.telemetry.clone();
        let on_gas_price_bumped = move |gas_price: u128| {
            let telemetry = bump_telemetry.clone();
            tokio::spawn(async move {
                telemetry
                    .task_set_gas_price(batch_merkle_root, gas_price)
                    .await;
            });
        };

        let result = self
            .writer
            .send_aggregated_response(
                batch.identifier_hash,
                batch_merkle_root,
                Address::from(batch.sender_address),
                &non_signer_stakes_and_signature,
                &policy,
                &self.wallet_mutex,
                &on_gas_price_bumped,
            )
            .await;
        match result {
            Ok(receipt) => {
                self.metrics.inc_aggregated_responses();
                // The receipt is absent when a competing aggregator
                // responded first; the task is finished either way.
                let (tx_hash, effective_gas_price) = receipt
                    .map(|receipt| {
                        (
                            receipt.transaction_hash.to_string(),
                            receipt.effective_gas_price,
                        )
                    })
                    .unwrap_or_else(|| ("unknown".to_string(), 0));
                self.telemetry
                    .task_sent_to_ethereum(batch_merkle_root, &tx_hash, effective_gas_price)
                    .await;
                tracing::info!(
                    task_index = response.task_index,
                    tx_hash,
                    "Aggregator successfully responded to task"
                );
            }
            Err(error) => {
                tracing::error!(
                    task_index = response.task_index,
                    batch_merkle_root = %hex::encode(batch_merkle_root),
                    batch_identifier_hash = %hex::encode(batch.identifier_hash),
                    error = %error,
                    "Aggregator failed to respond to task, this batch will be lost"
                );
                self.telemetry
                    .log_task_error(batch_merkle_root, &error.to_string())
                    .await;
            }
        }
        self.telemetry.finish_trace(batch_merkle_root);
    }

    /// One garbage-collection sweep: ask the chain for the newest batch old
    /// enough to collect and drop everything in the registry up to it.
    async fn collect_finalized_batches(&self) -> anyhow::Result<()> {
        tracing::info!("Cleaning finalized batches from the registry");
        let old_batch = self
            .reader
            .get_old_batch_hash(
                self.config.aggregator.garbage_collector_tasks_age,
                self.config.aggregator.garbage_collector_tasks_interval,
            )
            .await
            .map_err(|error| anyhow::anyhow!("probing for old batches: {error}"))?;
        match old_batch {
            Some(identifier_hash) => self.registry.delete_up_to(identifier_hash),
            None => tracing::warn!("No old batches found"),
        }
        Ok(())
    }
}

/// Repacks the aggregation service's curve points and indices into the
/// service manager's calldata layout. The values themselves are opaque here.
fn build_non_signer_stakes_and_signature(
    aggregation: &BlsAggregationServiceResponse,
) -> anyhow::Result<NonSignerStakesAndSignature> {
    let mut non_signer_pubkeys = Vec::with_capacity(aggregation.non_signers_pub_keys_g1.len());
    for pub_key in &aggregation.non_signers_pub_keys_g1 {
        let point = eigensdk::crypto_bls::convert_to_g1_point(pub_key.g1())
            .map_err(|error| anyhow::anyhow!("converting non-signer pubkey: {error:?}"))?;
        non_signer_pubkeys.push(G1Point {
            X: point.X,
            Y: point.Y,
        });
    }
    let mut quorum_apks = Vec::with_capacity(aggregation.quorum_apks_g1.len());
    for quorum_apk in &aggregation.quorum_apks_g1 {
        let point = eigensdk::crypto_bls::convert_to_g1_point(quorum_apk.g1())
            .map_err(|error| anyhow::anyhow!("converting quorum apk: {error:?}"))?;
        quorum_apks.push(G1Point {
            X: point.X,
            Y: point.Y,
        });
    }
    let apk_g2 = eigensdk::crypto_bls::convert_to_g2_point(aggregation.signers_apk_g2.g2())
        .map_err(|error| anyhow::anyhow!("converting signers apk: {error:?}"))?;
    let sigma =
        eigensdk::crypto_bls::convert_to_g1_point(aggregation.signers_agg_sig_g1.g1_point().g1())
            .map_err(|error| anyhow::anyhow!("converting aggregated signature: {error:?}"))?;

    Ok(NonSignerStakesAndSignature {
        nonSignerQuorumBitmapIndices: aggregation.non_signer_quorum_bitmap_indices.clone(),
        nonSignerPubkeys: non_signer_pubkeys,
        quorumApks: quorum_apks,
        apkG2: G2Point {
            X: apk_g2.X,
            Y: apk_g2.Y,
        },
        sigma: G1Point {
            X: sigma.X,
            Y: sigma.Y,
        },
        quorumApkIndices: aggregation.quorum_apk_indices.clone(),
        totalStakeIndices: aggregation.total_stake_indices.clone(),
        nonSignerStakeIndices: aggregation.non_signer_stake_indices.clone(),
    })
}
