//! The concurrent pull engine: fans out one retry loop per (image,
//! credential) pair against a shared root deadline, emits an `AttemptRecord`
//! per attempt, and folds the outcomes into a per-image result map.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::TimingConfig;
use crate::cri::{connect, AuthConfig, CriClient, RuntimeImageClient};
use crate::error::{PrefetchError, Result};
use crate::keyring::{Credentials, Keyring, RegistryAuthDocument};
use crate::metrics::record::AttemptRecord;
use crate::metrics::submitter::{local_hostname, GrpcMetricsClient, MetricsSink, Submitter};

/// Per-image success, folded from every `(image, credential)` task that
/// targeted it: true once at least one credential's task succeeds.
#[derive(Debug, Default)]
pub struct NodeLabelResult {
    outcomes: HashMap<String, bool>,
}

impl NodeLabelResult {
    pub fn outcome_for(&self, image: &str) -> Option<bool> {
        self.outcomes.get(image).copied()
    }

    /// Vacuously true when no image was pulled at all.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(|&ok| ok)
    }
}

pub struct PullEngine<C> {
    client: C,
    keyring: Keyring,
    timing: TimingConfig,
    sink: MetricsSink,
}

impl<C: CriClient + Clone> PullEngine<C> {
    pub fn new(client: C, keyring: Keyring, timing: TimingConfig, sink: MetricsSink) -> Self {
        Self {
            client,
            keyring,
            timing,
            sink,
        }
    }

    /// Spawns one task per `(image, credential)` pair (a single nil-auth
    /// task when the keyring has no candidates for an image) and waits for
    /// all of them to finish before returning the folded result.
    pub async fn run(&self, images: &[String], deadline: Instant) -> NodeLabelResult {
        let outcomes: Arc<Mutex<HashMap<String, bool>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut handles = Vec::new();

        for image in images {
            let candidates = self.keyring.lookup(image);
            let credentials: Vec<Option<Credentials>> = if candidates.is_empty() {
                vec![None]
            } else {
                candidates.into_iter().map(Some).collect()
            };

            for credential in credentials {
                let client = self.client.clone();
                let sink = self.sink.clone();
                let timing = self.timing;
                let image = image.clone();
                let outcomes = outcomes.clone();

                handles.push(tokio::spawn(async move {
                    let success = run_pull_task(client, &image, credential, timing, &sink, deadline).await;
                    let mut outcomes = outcomes.lock().await;
                    let entry = outcomes.entry(image).or_insert(false);
                    *entry = *entry || success;
                }));
            }
        }

        join_all(handles).await;
        let outcomes = Arc::try_unwrap(outcomes)
            .expect("all task handles joined, no outstanding clones")
            .into_inner();
        NodeLabelResult { outcomes }
    }
}

fn credentials_to_auth_config(credential: &Credentials) -> AuthConfig {
    AuthConfig {
        username: credential.username.clone().unwrap_or_default(),
        password: credential
            .password
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .unwrap_or_default(),
        auth: String::new(),
        server_address: credential.server_address.clone().unwrap_or_default(),
        identity_token: credential
            .identity_token
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .unwrap_or_default(),
        registry_token: credential
            .registry_token
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .unwrap_or_default(),
    }
}

/// One `(image, credential)` retry loop. Returns whether the image was
/// ultimately pulled successfully.
async fn run_pull_task(
    mut client: impl CriClient,
    image: &str,
    credential: Option<Credentials>,
    timing: TimingConfig,
    sink: &MetricsSink,
    deadline: Instant,
) -> bool {
    let auth = credential.as_ref().map(credentials_to_auth_config);
    let mut attempt_timeout = timing.initial_pull_attempt_timeout;
    let mut delay = timing.initial_pull_attempt_delay;

    loop {
        let started_at_epoch_sec = chrono::Utc::now().timestamp();
        let start = Instant::now();
        let bounded_timeout = attempt_timeout.min(deadline.saturating_duration_since(start));
        let outcome = tokio::time::timeout(bounded_timeout, client.pull_image(image, auth.clone())).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let failure_message = match outcome {
            Ok(Ok(pulled)) => {
                let status_timeout = attempt_timeout.min(deadline.saturating_duration_since(Instant::now()));
                let size_bytes = tokio::time::timeout(status_timeout, client.image_status(&pulled.image_ref))
                    .await
                    .ok()
                    .and_then(|result| result.ok())
                    .flatten()
                    .unwrap_or(0);
                sink.send(AttemptRecord::success(image, started_at_epoch_sec, elapsed_ms, size_bytes))
                    .await;
                return true;
            }
            Ok(Err(status)) => status.message().to_string(),
            Err(_) => "pull attempt timed out".to_string(),
        };

        sink.send(AttemptRecord::failure(image, started_at_epoch_sec, elapsed_ms, failure_message))
            .await;

        if Instant::now() >= deadline {
            return false;
        }

        attempt_timeout = (attempt_timeout * 2).min(timing.max_pull_attempt_timeout);

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(delay.min(deadline.saturating_duration_since(now))).await;
        delay = (delay * 2).min(timing.max_pull_attempt_delay);

        if Instant::now() >= deadline {
            return false;
        }
    }
}

/// Runs the whole node-side algorithm: dial CRI, optionally debug-list
/// images, optionally start the metrics submitter, load the auth document,
/// fan out pulls, drain the submitter, optionally debug-list again.
#[allow(clippy::too_many_arguments)]
pub async fn fetch(
    timing: TimingConfig,
    cri_socket: &Path,
    auth_doc_path: Option<&Path>,
    metrics_endpoint: Option<&str>,
    images: &[String],
    verbose: bool,
) -> Result<NodeLabelResult> {
    timing.validate();
    let deadline = Instant::now() + timing.overall_timeout;

    let channel = connect(cri_socket)
        .await
        .map_err(|source| PrefetchError::CriDial {
            socket: cri_socket.display().to_string(),
            source,
        })?;
    let mut client = RuntimeImageClient::new(channel);

    if verbose {
        debug_list_images(&mut client, timing).await?;
    }

    let (submitter_handle, sink) = match metrics_endpoint {
        Some(endpoint) => {
            let metrics_channel = tonic::transport::Endpoint::from_shared(endpoint.to_string())
                .map_err(|source| PrefetchError::MetricsDial {
                    endpoint: endpoint.to_string(),
                    source,
                })?
                .connect()
                .await
                .map_err(|source| PrefetchError::MetricsDial {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            let (submitter, sink) = Submitter::new();
            (
                Some((submitter, GrpcMetricsClient::new(metrics_channel))),
                sink,
            )
        }
        None => (None, Submitter::disabled_sink()),
    };

    let mut keyring = Keyring::new();
    if let Some(path) = auth_doc_path {
        let raw = std::fs::read_to_string(path).map_err(|source| PrefetchError::AuthFileRead {
            path: path.display().to_string(),
            source,
        })?;
        let document = RegistryAuthDocument::parse(&raw).map_err(|source| PrefetchError::AuthDocument {
            path: path.display().to_string(),
            source,
        })?;
        keyring.add_document(document);
    }

    let engine = PullEngine::new(client.clone(), keyring, timing, sink);

    // Drain concurrently with the pulls, the way the Go original launches
    // the submitter as a goroutine before fanning out pulls: the channel
    // has capacity 1, so a submitter that only ran after `engine.run`
    // returned would deadlock as soon as producers outran a drain.
    let submitter_task = submitter_handle.map(|(submitter, metrics_client)| {
        let hostname = local_hostname();
        tokio::spawn(async move {
            submitter.run(metrics_client, &hostname, deadline).await;
        })
    });

    let label_result = engine.run(images, deadline).await;
    // Drops `engine`'s own `MetricsSink` clone, the last live sender once
    // every spawned pull task has already joined, so the submitter's
    // `recv()` loop observes channel closure and drains to completion.
    drop(engine);

    if let Some(task) = submitter_task {
        let _ = task.await;
    }

    if verbose {
        debug_list_images(&mut client, timing).await?;
    }

    Ok(label_result)
}

async fn debug_list_images(client: &mut RuntimeImageClient, timing: TimingConfig) -> Result<()> {
    match tokio::time::timeout(timing.image_list_timeout, client.list_images()).await {
        Ok(Ok(listing)) => {
            tracing::debug!(count = listing.images.len(), "image listing");
            Ok(())
        }
        Ok(Err(source)) => Err(PrefetchError::Cri {
            call: "ListImages",
            source,
        }),
        Err(_) => Err(PrefetchError::Cri {
            call: "ListImages",
            source: tonic::Status::deadline_exceeded("image list timed out"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::mock::ScriptedCriClient;
    use crate::cri::PullOutcome;
    use std::time::Duration;

    fn timing(initial_timeout_ms: u64, max_timeout_ms: u64, initial_delay_ms: u64, max_delay_ms: u64, overall_ms: u64) -> TimingConfig {
        TimingConfig {
            image_list_timeout: Duration::from_secs(1),
            initial_pull_attempt_timeout: Duration::from_millis(initial_timeout_ms),
            max_pull_attempt_timeout: Duration::from_millis(max_timeout_ms),
            overall_timeout: Duration::from_millis(overall_ms),
            initial_pull_attempt_delay: Duration::from_millis(initial_delay_ms),
            max_pull_attempt_delay: Duration::from_millis(max_delay_ms),
        }
    }

    #[tokio::test]
    async fn single_image_succeeds_on_first_try() {
        let client = ScriptedCriClient::new();
        client.script_pulls(
            "registry.example/foo:1",
            vec![Ok(PullOutcome {
                image_ref: "sha256:abc".to_string(),
            })],
        );
        client.script_status("sha256:abc", Some(123_456));

        let engine = PullEngine::new(
            client,
            Keyring::new(),
            timing(100, 400, 50, 200, 2_000),
            Submitter::disabled_sink(),
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        let result = engine
            .run(&["registry.example/foo:1".to_string()], deadline)
            .await;

        assert_eq!(result.outcome_for("registry.example/foo:1"), Some(true));
        assert!(result.all_succeeded());
    }

    #[tokio::test]
    async fn image_that_never_succeeds_marks_failure_and_the_other_still_succeeds() {
        let client = ScriptedCriClient::new();
        client.script_pulls(
            "a:1",
            vec![Ok(PullOutcome {
                image_ref: "a-ref".to_string(),
            })],
        );
        client.script_status("a-ref", Some(10));
        // "b" always fails; script enough failures to outlast the deadline.
        client.script_pulls("b:1", (0..50).map(|_| Err("boom".to_string())).collect());

        let engine = PullEngine::new(
            client,
            Keyring::new(),
            timing(50, 200, 20, 100, 500),
            Submitter::disabled_sink(),
        );
        let deadline = Instant::now() + Duration::from_millis(500);
        let result = engine
            .run(&["a:1".to_string(), "b:1".to_string()], deadline)
            .await;

        assert_eq!(result.outcome_for("a:1"), Some(true));
        assert_eq!(result.outcome_for("b:1"), Some(false));
        assert!(!result.all_succeeded());
    }

    #[tokio::test]
    async fn anonymous_pull_is_attempted_when_keyring_has_no_candidates() {
        let client = ScriptedCriClient::new();
        client.script_pulls(
            "unauthed:1",
            vec![Ok(PullOutcome {
                image_ref: "ref".to_string(),
            })],
        );
        client.script_status("ref", Some(1));

        let engine = PullEngine::new(
            client.clone(),
            Keyring::new(),
            timing(100, 400, 50, 200, 2_000),
            Submitter::disabled_sink(),
        );
        engine.run(&["unauthed:1".to_string()], Instant::now() + Duration::from_secs(1)).await;

        assert_eq!(client.pull_calls.lock().unwrap().len(), 1);
    }
}
