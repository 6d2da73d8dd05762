// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Aggregator metrics and the Prometheus `/metrics` exporter.

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const NAMESPACE: &str = "verilayer";

/// Counters and gauges of the aggregator. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    num_aggregated_responses: IntCounter,
    num_aggregator_received_tasks: IntCounter,
    num_operator_task_responses: IntCounter,
    aggregator_gas_cost_paid_for_batcher_total: Gauge,
    aggregator_num_times_paid_for_batcher: IntCounter,
    num_bumped_gas_price_for_aggregated_response: IntCounter,
    aggregator_respond_to_task_latency: Gauge,
    aggregator_task_quorum_reached_latency: Gauge,
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry
        .register(Box::new(counter.clone()))
        .with_context(|| format!("registering {name}"))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> anyhow::Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry
        .register(Box::new(gauge.clone()))
        .with_context(|| format!("registering {name}"))?;
    Ok(gauge)
}

impl Metrics {
    pub fn new(registry: &Registry) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(MetricsInner {
                num_aggregated_responses: int_counter(
                    registry,
                    "aggregated_responses_count",
                    "Number of aggregated responses sent to the service manager",
                )?,
                num_aggregator_received_tasks: int_counter(
                    registry,
                    "aggregator_received_tasks_count",
                    "Number of batches picked up from the service manager",
                )?,
                num_operator_task_responses: int_counter(
                    registry,
                    "operator_responses_count",
                    "Number of signed task responses received from operators",
                )?,
                aggregator_gas_cost_paid_for_batcher_total: gauge(
                    registry,
                    "aggregator_gas_cost_paid_for_batcher_sum",
                    "Accumulated gas cost the aggregator paid for the batcher when the tx cost \
                     was higher than the respond-to-task fee limit",
                )?,
                aggregator_num_times_paid_for_batcher: int_counter(
                    registry,
                    "aggregator_num_times_paid_for_batcher_count",
                    "Number of times the aggregator paid for the batcher when the tx cost was \
                     higher than the respond-to-task fee limit",
                )?,
                num_bumped_gas_price_for_aggregated_response: int_counter(
                    registry,
                    "respond_to_task_gas_price_bumped_count",
                    "Number of times gas price was bumped while sending an aggregated response",
                )?,
                aggregator_respond_to_task_latency: gauge(
                    registry,
                    "aggregator_respond_to_task_latency",
                    "Latency of the last respond-to-task call on the service manager",
                )?,
                aggregator_task_quorum_reached_latency: gauge(
                    registry,
                    "aggregator_task_quorum_reached_latency",
                    "Time it took the last task to reach quorum",
                )?,
            }),
        })
    }

    pub fn inc_aggregated_responses(&self) {
        self.inner.num_aggregated_responses.inc();
    }

    pub fn inc_aggregator_received_tasks(&self) {
        self.inner.num_aggregator_received_tasks.inc();
    }

    pub fn inc_operator_task_responses(&self) {
        self.inner.num_operator_task_responses.inc();
    }

    pub fn inc_aggregator_paid_for_batcher(&self) {
        self.inner.aggregator_num_times_paid_for_batcher.inc();
    }

    pub fn add_aggregator_gas_paid_for_batcher(&self, wei: f64) {
        self.inner.aggregator_gas_cost_paid_for_batcher_total.add(wei);
    }

    pub fn inc_bumped_gas_price_for_aggregated_response(&self) {
        self.inner.num_bumped_gas_price_for_aggregated_response.inc();
    }

    pub fn observe_respond_to_task_latency(&self, elapsed: Duration) {
        self.inner
            .aggregator_respond_to_task_latency
            .set(elapsed.as_secs_f64());
    }

    pub fn observe_task_quorum_reached_latency(&self, elapsed: Duration) {
        self.inner
            .aggregator_task_quorum_reached_latency
            .set(elapsed.as_secs_f64());
    }
}

/// Serves `registry` on `GET /metrics` at `address` in a background task.
///
/// The returned channel yields the server error if it ever stops; the main
/// loop treats that as fatal.
pub fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
) -> oneshot::Receiver<anyhow::Error> {
    let (error_tx, error_rx) = oneshot::channel();
    tokio::spawn(async move {
        tracing::info!(address = %address, "Starting metrics server");
        let make_service = make_service_fn(move |_conn| {
            let registry = registry.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |request| {
                    serve_request(request, registry.clone())
                }))
            }
        });
        let result = match Server::try_bind(&address) {
            Ok(builder) => builder.serve(make_service).await.map_err(Into::into),
            Err(error) => Err(anyhow::Error::from(error)),
        };
        if let Err(error) = result {
            let _ = error_tx.send(error.context("metrics server failed"));
        }
    });
    error_rx
}

async fn serve_request(
    request: Request<Body>,
    registry: Registry,
) -> Result<Response<Body>, hyper::Error> {
    if request.method() != Method::GET || request.uri().path() != "/metrics" {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_FOUND;
        return Ok(response);
    }

    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(error) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        tracing::error!(error = ?error, "Failed to encode metrics");
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Ok(response);
    }
    Ok(Response::new(Body::from(buffer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_ok;

    #[test]
    fn metrics_register_and_count() {
        let registry = Registry::new();
        let metrics = assert_ok!(Metrics::new(&registry));
        metrics.inc_aggregated_responses();
        metrics.inc_aggregated_responses();
        metrics.add_aggregator_gas_paid_for_batcher(1500.0);

        let families = registry.gather();
        let aggregated = families
            .iter()
            .find(|family| family.get_name() == "verilayer_aggregated_responses_count")
            .expect("counter is registered");
        assert_eq!(aggregated.get_metric()[0].get_counter().get_value(), 2.0);
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Registry::new();
        assert_ok!(Metrics::new(&registry));
        claims::assert_err!(Metrics::new(&registry));
    }
}
