// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

use alloy::network::EthereumWallet;
use alloy::providers::Provider;
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use eigensdk::client_avsregistry::reader::AvsRegistryChainReader;
use eigensdk::client_avsregistry::subscriber::AvsRegistryChainSubscriber;
use eigensdk::logging::get_logger;
use eigensdk::services_avsregistry::chaincaller::AvsRegistryServiceChainCaller;
use eigensdk::services_blsaggregation::bls_agg::BlsAggregatorService;
use eigensdk::services_operatorsinfo::operatorsinfo_inmemory::OperatorInfoServiceInMemory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use verilayer_aggregator::config::Config;
use verilayer_aggregator::Aggregator;
use verilayer_bls_aggregation::{AggregatedResponse, EigenBlsAggregationService};

/// Service that aggregates signed batch attestations from operator nodes.
#[derive(Parser)]
#[command(name = "verilayer-aggregator", version)]
struct Args {
    /// Path to the aggregator YAML config.
    #[arg(long, value_name = "FILE")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("building tokio runtime");
    if let Err(error) = runtime.block_on(run()) {
        tracing::error!(error = ?error, "Aggregator failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    let signer = PrivateKeySigner::decrypt_keystore(
        &config.base.ecdsa_private_key_store_path,
        &config.base.ecdsa_private_key_store_password,
    )?;
    let aggregator_address = signer.address();
    let wallet = EthereumWallet::from(signer);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received interrupt, shutting down");
                cancel.cancel();
            }
        });
    }

    let (aggregation_service, response_rx) =
        build_aggregation_service(&config, cancel.clone()).await?;
    let aggregator =
        Aggregator::new(config, aggregation_service, wallet, aggregator_address).await?;
    aggregator.start(response_rx, cancel).await
}

/// Builds the stake-aware BLS aggregation service from the AVS registry
/// contracts and wraps it for the aggregator.
async fn build_aggregation_service(
    config: &Config,
    cancel: CancellationToken,
) -> anyhow::Result<(
    Arc<EigenBlsAggregationService>,
    mpsc::UnboundedReceiver<AggregatedResponse>,
)> {
    let http_url = config.base.eth_rpc_url.clone();
    let ws_url = config.base.eth_ws_url.clone();

    let avs_registry_reader = AvsRegistryChainReader::new(
        get_logger(),
        config.aggregator.bls_public_key_compendium_address,
        config.aggregator.operator_state_retriever_address,
        http_url.clone(),
    )
    .await
    .map_err(|error| anyhow::anyhow!("building AVS registry reader: {error:?}"))?;

    let avs_registry_subscriber = AvsRegistryChainSubscriber::new(
        get_logger(),
        config.aggregator.bls_public_key_compendium_address,
        ws_url.clone(),
    );

    let (operators_info, _operators_info_errors) = OperatorInfoServiceInMemory::new(
        get_logger(),
        avs_registry_subscriber,
        avs_registry_reader.clone(),
        ws_url,
    )
    .await
    .map_err(|error| anyhow::anyhow!("building operator info service: {error:?}"))?;

    let provider = verilayer_chainio::http_provider(&http_url)?;
    let current_block = provider.get_block_number().await?;
    {
        let operators_info = operators_info.clone();
        tokio::spawn(async move {
            if let Err(error) = operators_info.start_service(&cancel, 0, current_block).await {
                tracing::error!(error = ?error, "Operator info service stopped");
            }
        });
    }

    let avs_registry_service =
        AvsRegistryServiceChainCaller::new(avs_registry_reader, operators_info);
    let bls_service = BlsAggregatorService::new(avs_registry_service, get_logger());
    let (handle, aggregate_receiver) = bls_service.start();
    Ok(EigenBlsAggregationService::start(handle, aggregate_receiver))
}
