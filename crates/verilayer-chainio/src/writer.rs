// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Aggregated-response submission with gas-price bumping.
//!
//! Submission keeps attempting until a receipt is obtained or the batch
//! shows up on chain as already responded; the only fatal exits are the
//! balance and fee-limit preflights, which make every further attempt
//! pointless.

use crate::bindings::BatchServiceManager::{self, BatchServiceManagerInstance};
use crate::reader::{
    balance_call, batcher_balance_call, batches_state_call, gas_price_call, primary_then_fallback,
};
use crate::{BatchState, NonSignerStakesAndSignature};
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{DynProvider, Provider};
use alloy::rpc::types::TransactionReceipt;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use verilayer_metrics::Metrics;
use verilayer_retry::{retry_with_data, RetryError, RetryParams};

/// Mempools reject replacement transactions priced less than 10 % over the
/// transaction they replace; this floor is not tunable.
const REPLACEMENT_FLOOR_PERCENTAGE: u64 = 10;

/// Gas bump configuration for one submission loop.
#[derive(Clone, Debug)]
pub struct GasBumpPolicy {
    pub base_bump_percentage: u64,
    pub incremental_bump_percentage: u64,
    pub bump_percentage_limit: u64,
    pub time_to_wait_before_bump: Duration,
}

impl GasBumpPolicy {
    /// Percentage applied to the suggested gas price on `attempt`, capped by
    /// the configured limit.
    pub fn bump_percentage(&self, attempt: u32) -> u64 {
        let percentage = self.base_bump_percentage
            + u64::from(attempt) * self.incremental_bump_percentage;
        if self.bump_percentage_limit > 0 {
            percentage.min(self.bump_percentage_limit)
        } else {
            percentage
        }
    }
}

/// `price + price · percentage / 100`.
pub fn bump_gas_price(gas_price: u128, percentage: u64) -> u128 {
    gas_price + gas_price * u128::from(percentage) / 100
}

struct SimulatedTx {
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
}

struct SubmissionState {
    attempt: u32,
    previous_gas_price: u128,
    sent_tx_hashes: Vec<TxHash>,
}

pub struct BatchServiceWriter {
    service_manager: BatchServiceManagerInstance<DynProvider>,
    service_manager_fallback: BatchServiceManagerInstance<DynProvider>,
    provider: DynProvider,
    provider_fallback: DynProvider,
    aggregator_address: Address,
    metrics: Metrics,
}

impl BatchServiceWriter {
    /// Both providers are expected to carry the aggregator wallet so either
    /// endpoint can broadcast.
    pub fn new(
        service_manager_address: Address,
        provider: DynProvider,
        provider_fallback: DynProvider,
        aggregator_address: Address,
        metrics: Metrics,
    ) -> Self {
        Self {
            service_manager: BatchServiceManager::new(service_manager_address, provider.clone()),
            service_manager_fallback: BatchServiceManager::new(
                service_manager_address,
                provider_fallback.clone(),
            ),
            provider,
            provider_fallback,
            aggregator_address,
            metrics,
        }
    }

    /// Submits the aggregated response, bumping the gas price every
    /// `time_to_wait_before_bump` until a receipt is obtained.
    ///
    /// Returns `Ok(None)` when the batch was responded to by someone else
    /// while we were still trying. The broadcast inside each attempt must be
    /// externally serialized on the wallet mutex; reads and receipt waits
    /// happen in here without it.
    pub async fn send_aggregated_response(
        &self,
        batch_identifier_hash: [u8; 32],
        batch_merkle_root: [u8; 32],
        sender_address: Address,
        non_signer_stakes_and_signature: &NonSignerStakesAndSignature,
        policy: &GasBumpPolicy,
        wallet_mutex: &tokio::sync::Mutex<()>,
        on_gas_price_bumped: &(dyn Fn(u128) + Send + Sync),
    ) -> Result<Option<TransactionReceipt>, RetryError> {
        let started_at = Instant::now();

        let simulated = self
            .simulate_respond_to_task(
                batch_merkle_root,
                sender_address,
                non_signer_stakes_and_signature,
            )
            .await?;
        let simulated_cost = U256::from(simulated.gas_limit) * U256::from(simulated.gas_price);
        self.check_respond_to_task_fee_limit(simulated_cost, batch_identifier_hash, sender_address)
            .await
            .map_err(RetryError::permanent)?;

        let nonce = simulated.nonce;
        let gas_limit = simulated.gas_limit;
        let state = Mutex::new(SubmissionState {
            attempt: 0,
            previous_gas_price: simulated.gas_price,
            sent_tx_hashes: Vec::new(),
        });

        let state_ref = &state;
        let receipt = retry_with_data(
            move || async move {
                let (attempt, previous_gas_price, sent_tx_hashes) = {
                    let state = state_ref.lock();
                    (
                        state.attempt,
                        state.previous_gas_price,
                        state.sent_tx_hashes.clone(),
                    )
                };

                if attempt > 0 {
                    // A previous broadcast may have been mined after its
                    // receipt wait timed out, or a competing aggregator may
                    // have responded already.
                    if let Some(receipt) = self.find_receipt_for_any(&sent_tx_hashes).await {
                        return Ok(Some(receipt));
                    }
                    if let Ok(state) = self.batches_state(batch_identifier_hash).await {
                        if state.responded {
                            tracing::info!(
                                batch_identifier_hash = %alloy::hex::encode(batch_identifier_hash),
                                "Batch was already responded on chain, nothing to submit"
                            );
                            return Ok(None);
                        }
                    }
                }

                let suggested = self.get_gas_price().await?;
                let bumped = bump_gas_price(suggested, policy.bump_percentage(attempt));
                let minimum = bump_gas_price(previous_gas_price, REPLACEMENT_FLOOR_PERCENTAGE);
                let gas_price = bumped.max(minimum);

                if attempt > 0 {
                    self
                        .metrics
                        .inc_bumped_gas_price_for_aggregated_response();
                    on_gas_price_bumped(gas_price);
                }

                let tx_cost = U256::from(gas_limit) * U256::from(gas_price);
                self
                    .check_respond_to_task_fee_limit(
                        tx_cost,
                        batch_identifier_hash,
                        sender_address,
                    )
                    .await
                    .map_err(RetryError::permanent)?;

                tracing::info!(gas_price, attempt, "Sending respondToTask transaction");
                // Only the broadcast is serialized on the wallet; reads and
                // receipt waits run outside the critical section.
                let tx_hash = {
                    let _wallet = wallet_mutex.lock().await;
                    self.broadcast_respond_to_task(
                        batch_merkle_root,
                        sender_address,
                        non_signer_stakes_and_signature,
                        nonce,
                        gas_price,
                        gas_limit,
                    )
                    .await?
                };
                {
                    let mut state = state_ref.lock();
                    state.sent_tx_hashes.push(tx_hash);
                    state.previous_gas_price = gas_price;
                }

                match self
                    .wait_for_receipt(tx_hash, policy.time_to_wait_before_bump)
                    .await
                {
                    Ok(receipt) => Ok(Some(receipt)),
                    Err(_) => {
                        state_ref.lock().attempt += 1;
                        tracing::info!(
                            tx_hash = %tx_hash,
                            "respondToTask receipt wait timed out, will bump gas price"
                        );
                        Err(RetryError::transient(anyhow::anyhow!(
                            "transaction {tx_hash} not included before the bump deadline"
                        )))
                    }
                }
            },
            &RetryParams::respond_to_task(),
        )
        .await?;

        if let Some(receipt) = &receipt {
            self.track_cost_paid_for_batcher(receipt, batch_identifier_hash)
                .await;
        }
        self.metrics
            .observe_respond_to_task_latency(started_at.elapsed());
        Ok(receipt)
    }

    /// Preflight for a submission attempt costing `tx_cost`.
    ///
    /// The batcher covers the response cost up to the on-chain fee limit and
    /// the aggregator fronts the gas, so both balances must cover the limit.
    /// When the fee limit cannot be read the comparison falls back to the
    /// transaction cost itself. Failed balance reads are skipped; a balance
    /// that was read and is insufficient is a permanent failure.
    async fn check_respond_to_task_fee_limit(
        &self,
        tx_cost: U256,
        batch_identifier_hash: [u8; 32],
        sender_address: Address,
    ) -> anyhow::Result<()> {
        let required = match self.batches_state(batch_identifier_hash).await {
            Ok(state) => {
                if state.respond_to_task_fee_limit < tx_cost {
                    anyhow::bail!(
                        "transaction cost {tx_cost} is higher than the batch fee limit {}",
                        state.respond_to_task_fee_limit
                    );
                }
                state.respond_to_task_fee_limit
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    "Failed to read batch state, checking balances against the simulated cost"
                );
                tx_cost
            }
        };

        match self.aggregator_balance().await {
            Ok(balance) if balance < required => {
                anyhow::bail!("required amount {required} is higher than the aggregator balance {balance}");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "Failed to read aggregator balance"),
        }
        match self.batcher_balance(sender_address).await {
            Ok(balance) if balance < required => {
                anyhow::bail!("required amount {required} is higher than the batcher balance {balance}");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "Failed to read batcher balance"),
        }
        Ok(())
    }

    async fn simulate_respond_to_task(
        &self,
        batch_merkle_root: [u8; 32],
        sender_address: Address,
        non_signer_stakes_and_signature: &NonSignerStakesAndSignature,
    ) -> Result<SimulatedTx, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "simulateRespondToTask",
                    simulate_call(
                        &self.service_manager,
                        &self.provider,
                        self.aggregator_address,
                        batch_merkle_root,
                        sender_address,
                        non_signer_stakes_and_signature,
                    ),
                    move || {
                        simulate_call(
                            &self.service_manager_fallback,
                            &self.provider_fallback,
                            self.aggregator_address,
                            batch_merkle_root,
                            sender_address,
                            non_signer_stakes_and_signature,
                        )
                    },
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    async fn broadcast_respond_to_task(
        &self,
        batch_merkle_root: [u8; 32],
        sender_address: Address,
        non_signer_stakes_and_signature: &NonSignerStakesAndSignature,
        nonce: u64,
        gas_price: u128,
        gas_limit: u64,
    ) -> Result<TxHash, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "respondToTaskV2",
                    send_call(
                        &self.service_manager,
                        self.aggregator_address,
                        batch_merkle_root,
                        sender_address,
                        non_signer_stakes_and_signature,
                        nonce,
                        gas_price,
                        gas_limit,
                    ),
                    move || {
                        send_call(
                            &self.service_manager_fallback,
                            self.aggregator_address,
                            batch_merkle_root,
                            sender_address,
                            non_signer_stakes_and_signature,
                            nonce,
                            gas_price,
                            gas_limit,
                        )
                    },
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<TransactionReceipt, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "getTransactionReceipt",
                    receipt_call(&self.provider, tx_hash),
                    move || receipt_call(&self.provider_fallback, tx_hash),
                )
            },
            &RetryParams::wait_for_receipt(timeout),
        )
        .await
    }

    async fn find_receipt_for_any(&self, tx_hashes: &[TxHash]) -> Option<TransactionReceipt> {
        for tx_hash in tx_hashes {
            if let Ok(receipt) = receipt_call(&self.provider, *tx_hash).await {
                return Some(receipt);
            }
            if let Ok(receipt) = receipt_call(&self.provider_fallback, *tx_hash).await {
                return Some(receipt);
            }
        }
        None
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

    async fn batcher_balance(&self, sender_address: Address) -> Result<U256, RetryError> {
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

    async fn aggregator_balance(&self) -> Result<U256, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "getBalance",
                    balance_call(&self.provider, self.aggregator_address),
                    move || balance_call(&self.provider_fallback, self.aggregator_address),
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    async fn get_gas_price(&self) -> Result<u128, RetryError> {
        retry_with_data(
            move || {
                primary_then_fallback(
                    "gasPrice",
                    gas_price_call(&self.provider),
                    move || gas_price_call(&self.provider_fallback),
                )
            },
            &RetryParams::eth_call(),
        )
        .await
    }

    /// When the mined transaction ended up costing more than the batch fee
    /// limit, the aggregator ate the difference; account for it.
    async fn track_cost_paid_for_batcher(
        &self,
        receipt: &TransactionReceipt,
        batch_identifier_hash: [u8; 32],
    ) {
        let actual_cost =
            U256::from(receipt.gas_used) * U256::from(receipt.effective_gas_price);
        let fee_limit = match self.batches_state(batch_identifier_hash).await {
            Ok(state) => state.respond_to_task_fee_limit,
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    "Could not read fee limit after submission, skipping cost accounting"
                );
                return;
            }
        };
        if actual_cost > fee_limit {
            let excess: u128 = (actual_cost - fee_limit).try_into().unwrap_or(u128::MAX);
            self.metrics.inc_aggregator_paid_for_batcher();
            self.metrics
                .add_aggregator_gas_paid_for_batcher(excess as f64);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_call(
    service_manager: &BatchServiceManagerInstance<DynProvider>,
    aggregator_address: Address,
    batch_merkle_root: [u8; 32],
    sender_address: Address,
    non_signer_stakes_and_signature: &NonSignerStakesAndSignature,
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
) -> anyhow::Result<TxHash> {
    let pending = service_manager
        .respondToTaskV2(
            batch_merkle_root.into(),
            sender_address,
            non_signer_stakes_and_signature.clone(),
        )
        .from(aggregator_address)
        .nonce(nonce)
        .gas_price(gas_price)
        .gas(gas_limit)
        .send()
        .await?;
    Ok(*pending.tx_hash())
}

async fn simulate_call(
    service_manager: &BatchServiceManagerInstance<DynProvider>,
    provider: &DynProvider,
    aggregator_address: Address,
    batch_merkle_root: [u8; 32],
    sender_address: Address,
    non_signer_stakes_and_signature: &NonSignerStakesAndSignature,
) -> anyhow::Result<SimulatedTx> {
    let call = service_manager
        .respondToTaskV2(
            batch_merkle_root.into(),
            sender_address,
            non_signer_stakes_and_signature.clone(),
        )
        .from(aggregator_address);
    // Surfaces reverts before anything is broadcast.
    call.call().await?;
    let gas_limit = call.estimate_gas().await?;
    let gas_price = provider.get_gas_price().await?;
    let nonce = provider
        .get_transaction_count(aggregator_address)
        .await?;
    Ok(SimulatedTx {
        nonce,
        gas_price,
        gas_limit,
    })
}

async fn receipt_call(
    provider: &DynProvider,
    tx_hash: TxHash,
) -> anyhow::Result<TransactionReceipt> {
    provider
        .get_transaction_receipt(tx_hash)
        .await?
        .ok_or_else(|| anyhow::anyhow!("transaction {tx_hash} not yet mined"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GWEI: u128 = 1_000_000_000;

    fn policy() -> GasBumpPolicy {
        GasBumpPolicy {
            base_bump_percentage: 20,
            incremental_bump_percentage: 5,
            bump_percentage_limit: 50,
            time_to_wait_before_bump: Duration::from_secs(36),
        }
    }

    #[test]
    fn bump_adds_the_given_percentage() {
        assert_eq!(bump_gas_price(30 * GWEI, 0), 30 * GWEI);
        assert_eq!(bump_gas_price(30 * GWEI, 10), 33 * GWEI);
        assert_eq!(bump_gas_price(30 * GWEI, 100), 60 * GWEI);
    }

    #[test]
    fn bump_percentage_grows_per_attempt_up_to_the_limit() {
        let policy = policy();
        assert_eq!(policy.bump_percentage(0), 20);
        assert_eq!(policy.bump_percentage(1), 25);
        assert_eq!(policy.bump_percentage(6), 50);
        assert_eq!(policy.bump_percentage(60), 50);
    }

    #[test]
    fn zero_limit_means_uncapped() {
        let policy = GasBumpPolicy {
            bump_percentage_limit: 0,
            ..policy()
        };
        assert_eq!(policy.bump_percentage(100), 520);
    }

    /// The chosen price is `max(bumped suggestion, 110 % of the previous
    /// attempt)`, which makes the sequence strictly increasing even when the
    /// network's suggested price stagnates or falls.
    #[test]
    fn chosen_gas_price_is_strictly_monotonic() {
        let policy = policy();
        let suggested = [30 * GWEI, 30 * GWEI, 25 * GWEI, 10 * GWEI, 31 * GWEI];
        let mut previous = 30 * GWEI;
        let mut last_chosen = 0u128;
        for (attempt, suggestion) in suggested.into_iter().enumerate() {
            let bumped = bump_gas_price(suggestion, policy.bump_percentage(attempt as u32));
            let minimum = bump_gas_price(previous, REPLACEMENT_FLOOR_PERCENTAGE);
            let chosen = bumped.max(minimum);
            assert!(chosen > last_chosen, "attempt {attempt} did not raise the price");
            last_chosen = chosen;
            previous = chosen;
        }
    }
}
