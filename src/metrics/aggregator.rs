//! Server side of the metrics pipeline: a gRPC `Submit` endpoint and an
//! HTTP `/metrics` endpoint sharing one mutex-guarded map, run the way the
//! teacher runs its axum metrics exporter — bind both listeners first so a
//! port conflict is fatal before either server starts serving.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tonic::{Request, Response, Status, Streaming};

use super::record::{proto, AttemptRecord};
use crate::error::{PrefetchError, Result};

#[derive(Clone, Default)]
pub struct Aggregator {
    records: Arc<Mutex<HashMap<String, AttemptRecord>>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    async fn snapshot(&self) -> Vec<AttemptRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Merges every item of an incoming stream into the map, last write
    /// wins on a duplicate `attempt_id`. Split out from the trait method so
    /// it can be driven by any stream of decoded records in tests, not just
    /// a live `tonic::Streaming`.
    async fn merge_stream<S>(&self, mut stream: S) -> std::result::Result<(), Status>
    where
        S: futures::Stream<Item = std::result::Result<proto::AttemptRecord, Status>> + Unpin,
    {
        use futures::StreamExt;
        while let Some(item) = stream.next().await {
            let record: AttemptRecord = item?.into();
            let mut records = self.records.lock().await;
            if records.contains_key(&record.attempt_id) {
                tracing::info!(attempt_id = %record.attempt_id, "overwriting duplicate attempt record");
            }
            records.insert(record.attempt_id.clone(), record);
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl proto::metrics_server::Metrics for Aggregator {
    async fn submit(
        &self,
        request: Request<Streaming<proto::AttemptRecord>>,
    ) -> std::result::Result<Response<proto::SubmitAck>, Status> {
        self.merge_stream(request.into_inner()).await?;
        Ok(Response::new(proto::SubmitAck {}))
    }
}

async fn metrics_handler(State(aggregator): State<Aggregator>) -> Json<Vec<AttemptRecord>> {
    Json(aggregator.snapshot().await)
}

fn http_router(aggregator: Aggregator) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(aggregator)
}

/// Binds both listeners up front (a bind failure is fatal and returned
/// before either server starts), then races the gRPC and HTTP servers:
/// when either exits, the other is dropped and its task aborted.
pub async fn run(grpc_port: u16, http_port: u16) -> Result<()> {
    let aggregator = Aggregator::new();

    let grpc_addr: SocketAddr = format!("0.0.0.0:{grpc_port}").parse().expect("valid socket address");
    let http_addr: SocketAddr = format!("0.0.0.0:{http_port}").parse().expect("valid socket address");

    let http_listener = TcpListener::bind(http_addr)
        .await
        .map_err(|source| PrefetchError::ListenerBind {
            spec: http_addr.to_string(),
            source,
        })?;
    let grpc_listener = TcpListener::bind(grpc_addr)
        .await
        .map_err(|source| PrefetchError::ListenerBind {
            spec: grpc_addr.to_string(),
            source,
        })?;

    let grpc_incoming = tokio_stream::wrappers::TcpListenerStream::new(grpc_listener);
    let grpc_server = tonic::transport::Server::builder()
        .add_service(proto::metrics_server::MetricsServer::new(aggregator.clone()))
        .serve_with_incoming(grpc_incoming);

    let http_server = axum::serve(http_listener, http_router(aggregator));

    tokio::select! {
        result = grpc_server => result.map_err(|e| PrefetchError::Serve(format!("grpc server: {e}"))),
        result = http_server => result.map_err(|e| PrefetchError::Serve(format!("http server: {e}"))),
    }
}
