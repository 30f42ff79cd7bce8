//! Node label sanitization and the strategic-merge patch that stamps a
//! node with its prefetch outcome.

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::Api;
use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tonic::async_trait;

pub const LABEL_PREFIX: &str = "image-prefetcher.stackrox.io/";
const MAX_LABEL_LEN: usize = 63;
const FALLBACK_LABEL: &str = "prefetcher";
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("failed to build kubernetes client: {0}")]
    ClientBuild(#[source] kube::Error),
}

/// Replaces any run of characters outside `[A-Za-z0-9._-]` with a single
/// `-`, truncates to 63 chars, and strips leading/trailing `._-`. Idempotent:
/// `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(input: &str) -> String {
    let invalid_run = Regex::new(r"[^A-Za-z0-9._-]+").expect("static regex is valid");
    let replaced = invalid_run.replace_all(input, "-");
    let truncated: String = replaced.chars().take(MAX_LABEL_LEN).collect();
    let trimmed = truncated.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if trimmed.is_empty() {
        FALLBACK_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn outcome_value(all_succeeded: bool) -> &'static str {
    if all_succeeded {
        "succeeded"
    } else {
        "failed"
    }
}

pub type PatchCallError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait NodePatcher: Send + Sync {
    async fn patch_label(
        &self,
        node_name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PatchCallError>;
}

pub struct KubeNodePatcher {
    client: kube::Client,
}

impl KubeNodePatcher {
    pub async fn try_default() -> Result<Self, LabelError> {
        let client = kube::Client::try_default()
            .await
            .map_err(LabelError::ClientBuild)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodePatcher for KubeNodePatcher {
    async fn patch_label(
        &self,
        node_name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), PatchCallError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = Patch::Merge(json!({
            "metadata": {
                "labels": {
                    (key): value,
                }
            }
        }));
        api.patch(node_name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| Box::new(e) as PatchCallError)?;
        Ok(())
    }
}

/// Retries `patch_label` unconditionally on an exponential backoff until it
/// succeeds. There is no deadline on this loop per spec: node-patch
/// failure is retried by the platform's default backoff, independent of
/// the pull engine's root deadline, which has already fired by the time
/// labeling runs.
pub async fn patch_with_retry(patcher: &impl NodePatcher, node_name: &str, key: &str, value: &str) {
    let mut delay = INITIAL_RETRY_DELAY;
    loop {
        match patcher.patch_label(node_name, key, value).await {
            Ok(()) => return,
            Err(source) => {
                tracing::warn!(node = node_name, error = %source, "node label patch failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("my images!", "my-images")]
    #[case("", "prefetcher")]
    #[case("!!!", "prefetcher")]
    #[case("a.b.c", "a.b.c")]
    fn sanitize_cases(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize(input), expected);
    }

    #[test]
    fn sanitize_truncates_to_63_chars_and_trims_trailing_punctuation() {
        let input = "a".repeat(100);
        let sanitized = sanitize(&input);
        assert_eq!(sanitized.len(), 63);

        let input_with_trailing_dash = format!("{}---", "b".repeat(70));
        let sanitized = sanitize(&input_with_trailing_dash);
        assert!(sanitized.len() <= 63);
        assert!(!sanitized.ends_with('-'));
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["my images!", "", "!!!", "a.b.c", "-leading", "trailing-"] {
            let once = sanitize(input);
            let twice = sanitize(&once);
            assert_eq!(once, twice, "sanitize not idempotent for {input:?}");
        }
    }

    #[test]
    fn outcome_value_matches_overall_success() {
        assert_eq!(outcome_value(true), "succeeded");
        assert_eq!(outcome_value(false), "failed");
    }

    struct FlakyPatcher {
        remaining_failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl NodePatcher for FlakyPatcher {
        async fn patch_label(
            &self,
            _node_name: &str,
            _key: &str,
            _value: &str,
        ) -> Result<(), PatchCallError> {
            use std::sync::atomic::Ordering;
            if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err("simulated transient failure".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn patch_with_retry_eventually_succeeds() {
        let patcher = FlakyPatcher {
            remaining_failures: std::sync::atomic::AtomicUsize::new(2),
        };
        patch_with_retry(&patcher, "node-a", "k", "v").await;
    }
}
