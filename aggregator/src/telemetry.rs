// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! HTTP client posting task lifecycle milestones to the telemetry dashboard.
//!
//! Telemetry is best-effort: every failure is logged and dropped, nothing
//! here may affect task processing.

use serde::Serialize;
use std::time::Duration;
use url::Url;

#[derive(Serialize)]
struct TraceMessage {
    merkle_root: String,
}

#[derive(Serialize)]
struct OperatorResponseMessage {
    merkle_root: String,
    operator_id: String,
}

#[derive(Serialize)]
struct TaskErrorMessage {
    merkle_root: String,
    error: String,
}

#[derive(Serialize)]
struct TaskSetGasPriceMessage {
    merkle_root: String,
    gas_price: String,
}

#[derive(Serialize)]
struct TaskSentToEthereumMessage {
    merkle_root: String,
    tx_hash: String,
    effective_gas_price: String,
}

#[derive(Clone)]
pub struct Telemetry {
    client: reqwest::Client,
    base_url: Option<Url>,
}

impl Telemetry {
    /// `server_address` is a host:port; an unparsable address disables the
    /// client rather than failing aggregator startup.
    pub fn new(server_address: &str) -> Self {
        let base_url = Url::parse(&format!("http://{server_address}"))
            .map_err(|error| {
                tracing::warn!(
                    server_address,
                    error = %error,
                    "Invalid telemetry address, telemetry disabled"
                );
            })
            .ok();
        if let Some(url) = &base_url {
            tracing::info!(telemetry_url = %url, "Starting telemetry client");
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub async fn init_new_trace(&self, batch_merkle_root: [u8; 32]) {
        let body = TraceMessage {
            merkle_root: hex_0x(&batch_merkle_root),
        };
        self.send("api/initTaskTrace", &body).await;
    }

    pub async fn log_operator_response(
        &self,
        batch_merkle_root: [u8; 32],
        operator_id: [u8; 32],
    ) {
        let body = OperatorResponseMessage {
            merkle_root: hex_0x(&batch_merkle_root),
            operator_id: hex_0x(&operator_id),
        };
        self.send("api/operatorResponse", &body).await;
    }

    pub async fn log_quorum_reached(&self, batch_merkle_root: [u8; 32]) {
        let body = TraceMessage {
            merkle_root: hex_0x(&batch_merkle_root),
        };
        self.send("api/quorumReached", &body).await;
    }

    pub async fn log_task_error(&self, batch_merkle_root: [u8; 32], error: &str) {
        let body = TaskErrorMessage {
            merkle_root: hex_0x(&batch_merkle_root),
            error: error.to_string(),
        };
        self.send("api/taskError", &body).await;
    }

    pub async fn task_set_gas_price(&self, batch_merkle_root: [u8; 32], gas_price: u128) {
        let body = TaskSetGasPriceMessage {
            merkle_root: hex_0x(&batch_merkle_root),
            gas_price: gas_price.to_string(),
        };
        self.send("api/aggregatorTaskSetGasPrice", &body).await;
    }

    pub async fn task_sent_to_ethereum(
        &self,
        batch_merkle_root: [u8; 32],
        tx_hash: &str,
        effective_gas_price: u128,
    ) {
        let body = TaskSentToEthereumMessage {
            merkle_root: hex_0x(&batch_merkle_root),
            tx_hash: tx_hash.to_string(),
            effective_gas_price: effective_gas_price.to_string(),
        };
        self.send("api/aggregatorTaskSent", &body).await;
    }

    /// Delayed so that operator responses arriving after quorum are still
    /// attributed to the trace.
    pub fn finish_trace(&self, batch_merkle_root: [u8; 32]) {
        let telemetry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let body = TraceMessage {
                merkle_root: hex_0x(&batch_merkle_root),
            };
            telemetry.send("api/finishTaskTrace", &body).await;
        });
    }

    async fn send<T: Serialize>(&self, endpoint: &str, message: &T) {
        let Some(base_url) = &self.base_url else { return };
        let url = match base_url.join(endpoint) {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(endpoint, error = %error, "Invalid telemetry endpoint");
                return;
            }
        };
        match self.client.post(url).json(message).send().await {
            Ok(response) => {
                if !response.status().is_success() {
                    tracing::warn!(
                        endpoint,
                        status = %response.status(),
                        "Telemetry server rejected message"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(endpoint, error = %error, "Failed to post telemetry message");
            }
        }
    }
}

fn hex_0x(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}
