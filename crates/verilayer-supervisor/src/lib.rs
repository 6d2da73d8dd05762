// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Panic containment for long-lived tasks.
//!
//! These helpers are the only place where recovery from a panic is
//! mandated; everything else in the workspace propagates errors as values.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Runs the future produced by `factory` forever, restarting it whenever it
/// exits, panicking or not. Parameters are expected to be passed by capture,
/// including any input and output channels the service needs.
pub fn supervise<F, Fut>(service_name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tracing::info!(service = service_name, "Starting supervised service");
            match AssertUnwindSafe(factory()).catch_unwind().await {
                Ok(()) => {
                    tracing::warn!(service = service_name, "Supervised service exited, restarting")
                }
                Err(panic) => tracing::error!(
                    service = service_name,
                    message = panic_message(panic.as_ref()),
                    "Supervised service panicked, restarting"
                ),
            }
        }
    })
}

/// Runs `task` once. A panic payload (stringified) is reported on
/// `panic_tx` when one was supplied; the sender is dropped on clean exit so
/// the receiver can always detect termination.
pub fn one_shot<Fut>(task: Fut, panic_tx: Option<oneshot::Sender<String>>) -> JoinHandle<()>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(()) => drop(panic_tx),
            Err(panic) => {
                let message = panic_message(panic.as_ref()).to_string();
                tracing::error!(message, "One-shot task panicked");
                if let Some(tx) = panic_tx {
                    let _ = tx.send(message);
                }
            }
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn supervise_restarts_after_panic() {
        let starts = Arc::new(AtomicU64::new(0));
        let counter = starts.clone();
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Arc::new(std::sync::Mutex::new(Some(done_tx)));

        let handle = supervise("panicky", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let done_tx = done_tx.clone();
            async move {
                if n < 2 {
                    panic!("boom");
                }
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                // Park so the supervisor does not spin once the test
                // condition is met.
                futures::future::pending::<()>().await;
            }
        });

        assert_ok!(done_rx.await);
        assert!(starts.load(Ordering::SeqCst) >= 3);
        handle.abort();
    }

    #[tokio::test]
    async fn one_shot_reports_panic_payload() {
        let (panic_tx, panic_rx) = oneshot::channel();
        one_shot(
            async {
                panic!("one shot exploded");
            },
            Some(panic_tx),
        );
        let message = assert_ok!(panic_rx.await);
        assert!(message.contains("one shot exploded"));
    }

    #[tokio::test]
    async fn one_shot_closes_channel_on_clean_exit() {
        let (panic_tx, panic_rx) = oneshot::channel();
        one_shot(async {}, Some(panic_tx));
        // Sender dropped without a send: the receiver errors out.
        assert_err!(panic_rx.await);
    }
}
