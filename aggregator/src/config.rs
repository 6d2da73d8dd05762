// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Aggregator configuration, loaded from a YAML file.

use alloy::primitives::Address;
use serde::Deserialize;
use serde_with::serde_as;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub base: BaseConfig,
    pub aggregator: AggregatorOpts,
}

/// Endpoints and key material shared with the rest of the deployment.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseConfig {
    pub eth_rpc_url: String,
    pub eth_rpc_url_fallback: String,
    pub eth_ws_url: String,
    pub eth_ws_url_fallback: String,
    pub ecdsa_private_key_store_path: PathBuf,
    pub ecdsa_private_key_store_password: String,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregatorOpts {
    pub server_ip_port_address: String,
    pub bls_public_key_compendium_address: Address,
    pub avs_service_manager_address: Address,
    pub operator_state_retriever_address: Address,
    pub enable_metrics: bool,
    pub metrics_ip_port_address: String,
    pub telemetry_ip_port_address: String,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub garbage_collector_period: Duration,
    /// Minimum age, in blocks, before a finalized batch is collected.
    pub garbage_collector_tasks_age: u64,
    /// Width, in blocks, of the window the collector probes per sweep.
    pub garbage_collector_tasks_interval: u64,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub bls_service_task_timeout: Duration,
    pub gas_base_bump_percentage: u64,
    pub gas_bump_incremental_percentage: u64,
    pub gas_bump_percentage_limit: u64,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub time_to_wait_before_bump: Duration,
    /// Historical window scanned when an operator responds to a batch the
    /// registry does not know yet.
    pub pending_batch_fetch_block_range: u64,
}

impl Default for AggregatorOpts {
    fn default() -> Self {
        Self {
            server_ip_port_address: "127.0.0.1:8090".to_string(),
            bls_public_key_compendium_address: Address::ZERO,
            avs_service_manager_address: Address::ZERO,
            operator_state_retriever_address: Address::ZERO,
            enable_metrics: false,
            metrics_ip_port_address: "127.0.0.1:9091".to_string(),
            telemetry_ip_port_address: "127.0.0.1:4001".to_string(),
            garbage_collector_period: Duration::from_secs(2 * 60 * 60),
            garbage_collector_tasks_age: 21600,
            garbage_collector_tasks_interval: 1800,
            bls_service_task_timeout: Duration::from_secs(60 * 60),
            gas_base_bump_percentage: 25,
            gas_bump_incremental_percentage: 20,
            gas_bump_percentage_limit: 150,
            time_to_wait_before_bump: Duration::from_secs(36),
            pending_batch_fetch_block_range: 1000,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|error| anyhow::anyhow!("reading config {}: {error}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|error| anyhow::anyhow!("parsing config {}: {error}", path.display()))?;
        anyhow::ensure!(
            config.aggregator.avs_service_manager_address != Address::ZERO,
            "avs_service_manager_address must be set"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
base:
  eth_rpc_url: "http://localhost:8545"
  eth_rpc_url_fallback: "http://localhost:8546"
  eth_ws_url: "ws://localhost:8545"
  eth_ws_url_fallback: "ws://localhost:8546"
  ecdsa_private_key_store_path: "config-files/aggregator.ecdsa.key.json"
  ecdsa_private_key_store_password: ""
aggregator:
  server_ip_port_address: "0.0.0.0:8090"
  bls_public_key_compendium_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
  avs_service_manager_address: "0x851356ae760d987E095750cCeb3bC6014560891C"
  operator_state_retriever_address: "0x9d4454B023096f34B160D6B654540c56A1F81688"
  enable_metrics: true
  metrics_ip_port_address: "0.0.0.0:9091"
  telemetry_ip_port_address: "0.0.0.0:4001"
  garbage_collector_period: 7200
  garbage_collector_tasks_age: 21600
  garbage_collector_tasks_interval: 1800
  bls_service_task_timeout: 3600000
  gas_base_bump_percentage: 25
  gas_bump_incremental_percentage: 20
  gas_bump_percentage_limit: 150
  time_to_wait_before_bump: 36000
  pending_batch_fetch_block_range: 1000
"#;

    #[test]
    fn sample_config_parses() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.aggregator.server_ip_port_address, "0.0.0.0:8090");
        assert_eq!(
            config.aggregator.garbage_collector_period,
            Duration::from_secs(7200)
        );
        assert_eq!(
            config.aggregator.time_to_wait_before_bump,
            Duration::from_secs(36)
        );
        assert!(config.aggregator.enable_metrics);
    }

    #[test]
    fn tunables_fall_back_to_defaults() {
        let minimal = r#"
base:
  eth_rpc_url: "http://localhost:8545"
  eth_rpc_url_fallback: "http://localhost:8546"
  eth_ws_url: "ws://localhost:8545"
  eth_ws_url_fallback: "ws://localhost:8546"
  ecdsa_private_key_store_path: "key.json"
  ecdsa_private_key_store_password: ""
aggregator:
  avs_service_manager_address: "0x851356ae760d987E095750cCeb3bC6014560891C"
"#;
        let config: Config = serde_yaml::from_str(minimal).unwrap();
        assert_eq!(config.aggregator.gas_base_bump_percentage, 25);
        assert_eq!(config.aggregator.pending_batch_fetch_block_range, 1000);
    }
}
