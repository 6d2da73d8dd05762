// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Integration with the external BLS signature aggregation service.
//!
//! The aggregation service keys tasks by a `u32` index, collects per-operator
//! partial signatures and emits a quorum-reached response once the signed
//! stake passes the per-task threshold. This crate adapts that service to the
//! aggregator: task initialization registers a deadline, signatures are
//! forwarded with a typed permanent/transient classification, and both
//! quorum responses and timeouts are delivered on a single channel.

use async_trait::async_trait;
use eigensdk::crypto_bls::Signature;
use eigensdk::services_blsaggregation::bls_agg::{
    AggregateReceiver, ServiceHandle, TaskMetadata, TaskSignature,
};
pub use eigensdk::services_blsaggregation::bls_aggregation_service_response::BlsAggregationServiceResponse;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Task index assigned by the batch registry; the aggregation service knows
/// tasks by nothing else.
pub type TaskIndex = u32;

/// Extra slack given to the library-side expiry so that our own deadline
/// always fires first and carries the task index.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AggregationServiceError {
    #[error("task {0} timed out before reaching quorum")]
    TaskTimeout(TaskIndex),
    #[error("signature verification failed: {0}")]
    SignatureVerification(String),
    #[error("aggregation service error: {0}")]
    Service(#[from] anyhow::Error),
}

impl AggregationServiceError {
    /// Signature verification failures are permanent: retrying the same
    /// signature can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::SignatureVerification(_))
    }
}

/// A quorum-reached response, or the reason the task will never reach one.
#[derive(Debug)]
pub struct AggregatedResponse {
    pub task_index: TaskIndex,
    pub result: Result<BlsAggregationServiceResponse, AggregationServiceError>,
}

/// The service surface the aggregator depends on. The production
/// implementation wraps the external aggregation library; tests substitute
/// a mock.
#[async_trait]
pub trait BlsAggregationService: Send + Sync {
    /// Registers task `task_index` with the aggregation service. After
    /// `time_to_expiry` without quorum, an [`AggregatedResponse`] carrying
    /// [`AggregationServiceError::TaskTimeout`] is emitted on the response
    /// channel.
    async fn initialize_new_task(
        &self,
        task_index: TaskIndex,
        task_created_block: u32,
        quorum_numbers: Vec<u8>,
        quorum_threshold_percentages: Vec<u8>,
        time_to_expiry: Duration,
    ) -> Result<(), AggregationServiceError>;

    /// Forwards one operator's partial signature over `task_digest`.
    async fn process_new_signature(
        &self,
        task_index: TaskIndex,
        task_digest: [u8; 32],
        signature: Signature,
        operator_id: [u8; 32],
    ) -> Result<(), AggregationServiceError>;
}

/// Deadline bookkeeping for initialized tasks. An entry exists from
/// `initialize_new_task` until either a quorum response or the timeout
/// consumes it, whichever comes first.
#[derive(Default)]
struct PendingTasks {
    started_at: Mutex<HashMap<TaskIndex, Instant>>,
}

impl PendingTasks {
    fn register(&self, task_index: TaskIndex) {
        self.started_at.lock().insert(task_index, Instant::now());
    }

    /// Removes the entry, returning when the task was registered. Returns
    /// `None` if the task was already completed (or timed out).
    fn complete(&self, task_index: TaskIndex) -> Option<Instant> {
        self.started_at.lock().remove(&task_index)
    }
}

/// Production implementation over the external aggregation library.
pub struct EigenBlsAggregationService {
    handle: ServiceHandle,
    pending: Arc<PendingTasks>,
    response_tx: mpsc::UnboundedSender<AggregatedResponse>,
}

impl EigenBlsAggregationService {
    /// Wraps an already-started aggregation service. Spawns the pump task
    /// that drains the library's receiver into the unified response channel
    /// and returns the consumer end of that channel.
    pub fn start(
        handle: ServiceHandle,
        receiver: AggregateReceiver,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AggregatedResponse>) {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            handle,
            pending: Arc::new(PendingTasks::default()),
            response_tx: response_tx.clone(),
        });

        let pending = service.pending.clone();
        tokio::spawn(async move {
            let mut receiver = receiver;
            loop {
                match receiver.receive_aggregated_response().await {
                    Ok(response) => {
                        let task_index = response.task_index;
                        if pending.complete(task_index).is_none() {
                            tracing::warn!(
                                task_index,
                                "Quorum response for a task that already timed out, dropping"
                            );
                            continue;
                        }
                        if response_tx
                            .send(AggregatedResponse {
                                task_index,
                                result: Ok(response),
                            })
                            .is_err()
                        {
                            tracing::warn!("Response channel closed, stopping aggregation pump");
                            return;
                        }
                    }
                    Err(error) => {
                        // Library-side errors do not carry a task index;
                        // expiry is handled by our own deadlines.
                        tracing::warn!(error = ?error, "Aggregation service receiver error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (service, response_rx)
    }
}

#[async_trait]
impl BlsAggregationService for EigenBlsAggregationService {
    async fn initialize_new_task(
        &self,
        task_index: TaskIndex,
        task_created_block: u32,
        quorum_numbers: Vec<u8>,
        quorum_threshold_percentages: Vec<u8>,
        time_to_expiry: Duration,
    ) -> Result<(), AggregationServiceError> {
        let metadata = TaskMetadata::new(
            task_index,
            u64::from(task_created_block),
            quorum_numbers,
            quorum_threshold_percentages,
            time_to_expiry + EXPIRY_MARGIN,
        );
        self.handle
            .initialize_task(metadata)
            .await
            .map_err(|error| AggregationServiceError::Service(anyhow::anyhow!(error)))?;

        self.pending.register(task_index);

        let pending = self.pending.clone();
        let response_tx = self.response_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time_to_expiry).await;
            if pending.complete(task_index).is_some() {
                tracing::warn!(task_index, "Task expired before reaching quorum");
                let _ = response_tx.send(AggregatedResponse {
                    task_index,
                    result: Err(AggregationServiceError::TaskTimeout(task_index)),
                });
            }
        });

        Ok(())
    }

    async fn process_new_signature(
        &self,
        task_index: TaskIndex,
        task_digest: [u8; 32],
        signature: Signature,
        operator_id: [u8; 32],
    ) -> Result<(), AggregationServiceError> {
        let task_signature = TaskSignature::new(
            task_index,
            task_digest.into(),
            signature,
            operator_id.into(),
        );
        self.handle
            .process_signature(task_signature)
            .await
            .map_err(classify_process_error)
    }
}

// The single sanctioned string-match site: the aggregation library reports
// an invalid signature only through its error display form, so the
// permanent/transient split has to be made on the message here. Everything
// else stays transient and is retried by the caller.
fn classify_process_error(error: impl std::fmt::Display) -> AggregationServiceError {
    let message = error.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("signature") && lowered.contains("verif") {
        AggregationServiceError::SignatureVerification(message)
    } else {
        AggregationServiceError::Service(anyhow::anyhow!(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_some};

    #[test]
    fn pending_tasks_complete_exactly_once() {
        let pending = PendingTasks::default();
        pending.register(7);
        assert_some!(pending.complete(7));
        assert_none!(pending.complete(7));
        assert_none!(pending.complete(8));
    }

    #[test]
    fn verification_failures_are_permanent() {
        let error = classify_process_error("Incorrect signature: verification failed for operator");
        assert!(error.is_permanent());

        let error = classify_process_error("connection refused");
        assert!(!error.is_permanent());
    }

    #[test]
    fn timeout_is_not_permanent() {
        assert!(!AggregationServiceError::TaskTimeout(3).is_permanent());
    }
}
