//! Client-side half of the metrics pipeline: a buffered channel that pull
//! tasks feed while they run, drained and shipped to the aggregator once
//! the node's work is done.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tonic::async_trait;
use tonic::transport::Channel;

use super::record::{proto, AttemptRecord};

const INITIAL_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A nil-safe sink: when no aggregator endpoint is configured, producers
/// still call `send` unconditionally and it's simply a no-op, so pull task
/// code never branches on whether metrics are enabled.
#[derive(Clone)]
pub enum MetricsSink {
    Channel(mpsc::Sender<AttemptRecord>),
    Null,
}

impl MetricsSink {
    pub async fn send(&self, record: AttemptRecord) {
        if let MetricsSink::Channel(tx) = self {
            let _ = tx.send(record).await;
        }
    }
}

#[async_trait]
pub trait MetricsClient: Send {
    async fn submit(&mut self, records: Vec<AttemptRecord>) -> Result<(), tonic::Status>;
}

pub struct GrpcMetricsClient(proto::metrics_client::MetricsClient<Channel>);

impl GrpcMetricsClient {
    pub fn new(channel: Channel) -> Self {
        Self(proto::metrics_client::MetricsClient::new(channel))
    }
}

#[async_trait]
impl MetricsClient for GrpcMetricsClient {
    async fn submit(&mut self, records: Vec<AttemptRecord>) -> Result<(), tonic::Status> {
        let stream = futures::stream::iter(records.into_iter().map(proto::AttemptRecord::from));
        self.0.submit(stream).await?;
        Ok(())
    }
}

/// Drains the channel side of a `MetricsSink::Channel` and retries
/// submission of the whole accumulated batch until it succeeds or
/// `deadline` passes.
pub struct Submitter {
    receiver: mpsc::Receiver<AttemptRecord>,
}

impl Submitter {
    /// Builds a connected sink/submitter pair with the spec's capacity-1
    /// buffer: sends block only transiently, never drop.
    pub fn new() -> (Self, MetricsSink) {
        let (tx, rx) = mpsc::channel(1);
        (Submitter { receiver: rx }, MetricsSink::Channel(tx))
    }

    pub fn disabled_sink() -> MetricsSink {
        MetricsSink::Null
    }

    /// Drains until every producer's sink clone is dropped, then retries
    /// submitting the full batch on a doubling backoff (capped at
    /// `MAX_BACKOFF`) until it succeeds or `deadline` passes. Never returns
    /// an error the run-level caller needs to act on.
    pub async fn run(
        mut self,
        mut client: impl MetricsClient,
        hostname: &str,
        deadline: Instant,
    ) {
        let mut batch = Vec::new();
        while let Some(record) = self.receiver.recv().await {
            batch.push(record.stamped_with_node(hostname));
        }
        if batch.is_empty() {
            return;
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match client.submit(batch.clone()).await {
                Ok(()) => return,
                Err(status) => {
                    tracing::warn!(error = %status, "metrics submission failed, retrying");
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!("giving up on metrics submission: deadline exceeded");
                        return;
                    }
                    let sleep_for = backoff.min(deadline.saturating_duration_since(now));
                    tokio::time::sleep(sleep_for).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
