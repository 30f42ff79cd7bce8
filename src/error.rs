use thiserror::Error;

/// Top-level error returned by the `fetch` and `aggregate-metrics` entry points.
#[derive(Debug, Error)]
pub enum PrefetchError {
    #[error("failed to dial CRI socket {socket}: {source}")]
    CriDial {
        socket: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("CRI call {call} failed: {source}")]
    Cri {
        call: &'static str,
        #[source]
        source: tonic::Status,
    },

    #[error("failed to read image pull secret file {path}: {source}")]
    AuthFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load registry auth document {path}: {source}")]
    AuthDocument {
        path: String,
        #[source]
        source: crate::keyring::KeyringError,
    },

    #[error("failed to connect to metrics endpoint {endpoint}: {source}")]
    MetricsDial {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("failed to bind listener on {spec}: {source}")]
    ListenerBind {
        spec: String,
        #[source]
        source: std::io::Error,
    },

    #[error("aggregator server failed: {0}")]
    Serve(String),
}

pub type Result<T> = std::result::Result<T, PrefetchError>;
