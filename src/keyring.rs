//! Credential resolution: turns a registry-auth JSON document into an
//! ordered lookup table and answers "which credentials, if any, apply to
//! this image reference".
//!
//! Matching is ported from the Kubernetes kubelet's vendored
//! `credentialprovider` package: hostnames match label-by-label (with `*`
//! wildcards scoped to a single dot-separated label), paths match by
//! segment prefix, ports must match exactly when either side names one, and
//! an unqualified or `docker.io`-ish reference is tried against a
//! normalized `docker.io` pattern.

use crate::secret::SecretString;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use oci_distribution::Reference;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

const DEFAULT_REGISTRY_HOST: &str = "docker.io";
const LEGACY_INDEX_HOST: &str = "index.docker.io";

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("malformed registry auth document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid image reference '{reference}': {source}")]
    InvalidReference {
        reference: String,
        #[source]
        source: oci_distribution::ParseError,
    },
}

/// One entry of a registry-auth document's `auths` map, exactly as spec'd:
/// `{username, password, auth, email, serverAddress, identityToken,
/// registryToken}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryAuthEntry {
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "serverAddress")]
    pub server_address: Option<String>,
    #[serde(rename = "identityToken")]
    pub identity_token: Option<String>,
    #[serde(rename = "registryToken")]
    pub registry_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegistryAuthDocument {
    pub auths: HashMap<String, RegistryAuthEntry>,
}

impl RegistryAuthDocument {
    pub fn parse(raw: &str) -> Result<Self, KeyringError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Credentials resolved for one candidate, ready to hand to a pull call.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub identity_token: Option<SecretString>,
    pub registry_token: Option<SecretString>,
    pub server_address: Option<String>,
}

impl From<&RegistryAuthEntry> for Credentials {
    fn from(entry: &RegistryAuthEntry) -> Self {
        let (username, password) = match (&entry.username, &entry.password) {
            (Some(u), Some(p)) => (Some(u.clone()), Some(SecretString::new(p.clone()))),
            _ => decode_auth_field(entry.auth.as_deref()).unwrap_or((None, None)),
        };
        Credentials {
            username,
            password,
            identity_token: entry.identity_token.clone().map(SecretString::new),
            registry_token: entry.registry_token.clone().map(SecretString::new),
            server_address: entry.server_address.clone(),
        }
    }
}

fn decode_auth_field(auth: Option<&str>) -> Option<(Option<String>, Option<SecretString>)> {
    let auth = auth?;
    let decoded = STANDARD.decode(auth).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((Some(user.to_string()), Some(SecretString::new(pass.to_string()))))
}

/// A parsed, pre-compiled match pattern. Host labels are compiled to an
/// anchored regex once here, not per lookup.
#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    label_regexes: Vec<Regex>,
    path: String,
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        let (host, path) = split_host_path(raw);
        let host = host.to_lowercase();
        let path = normalize_path(&path);
        let label_regexes = host.split('.').map(label_to_regex).collect();
        Pattern {
            raw: raw.to_string(),
            label_regexes,
            path,
        }
    }

    fn path_segment_count(&self) -> usize {
        self.path.split('/').filter(|s| !s.is_empty()).count()
    }

    fn matches(&self, target: &MatchTarget) -> bool {
        if self.label_regexes.len() != target.host_labels.len() {
            return false;
        }
        for (regex, label) in self.label_regexes.iter().zip(target.host_labels.iter()) {
            if !regex.is_match(label) {
                return false;
            }
        }
        if self.path.is_empty() {
            return true;
        }
        target.path == self.path || target.path.starts_with(&format!("{}/", self.path))
    }
}

fn label_to_regex(label: &str) -> Regex {
    let parts: Vec<String> = label.split('*').map(regex::escape).collect();
    let pattern = format!("^{}$", parts.join(".*"));
    Regex::new(&pattern).expect("label pattern is always a valid regex")
}

/// Strips a leading scheme and trailing legacy `/v1` or `/v1/` suffix (the
/// old docker index API version marker some registry configs still carry),
/// then splits into lowercase host and raw path.
fn split_host_path(raw: &str) -> (String, String) {
    let without_scheme = raw
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(raw);
    let (host, path) = match without_scheme.split_once('/') {
        Some((h, p)) => (h.to_string(), format!("/{p}")),
        None => (without_scheme.to_string(), String::new()),
    };
    (host, path)
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/v1").unwrap_or(trimmed);
    trimmed.to_string()
}

/// The host/path/port split of an image reference being looked up, using
/// the same rules a pattern's host is split by.
struct MatchTarget {
    host_labels: Vec<String>,
    path: String,
}

impl MatchTarget {
    fn from_image(image: &str) -> Result<Self, KeyringError> {
        let reference =
            Reference::try_from(image).map_err(|source| KeyringError::InvalidReference {
                reference: image.to_string(),
                source,
            })?;
        let mut host = reference.registry().to_lowercase();
        if host.is_empty() || host == LEGACY_INDEX_HOST {
            host = DEFAULT_REGISTRY_HOST.to_string();
        }
        let path = normalize_path(&format!("/{}", reference.repository()));
        let host_labels = host.split('.').map(str::to_string).collect();
        Ok(MatchTarget { host_labels, path })
    }
}

/// A lookup table of registry patterns, sorted most-specific-first.
#[derive(Debug, Default)]
pub struct Keyring {
    entries: Vec<(Pattern, Vec<RegistryAuthEntry>)>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, doc: RegistryAuthDocument) {
        for (raw_pattern, entry) in doc.auths {
            let pattern = Pattern::parse(&raw_pattern);
            match self.entries.iter_mut().find(|(p, _)| p.raw == pattern.raw) {
                Some((_, entries)) => entries.push(entry),
                None => self.entries.push((pattern, vec![entry])),
            }
        }
        self.resort();
    }

    fn resort(&mut self) {
        self.entries.sort_by(|(a, _), (b, _)| {
            b.path_segment_count()
                .cmp(&a.path_segment_count())
                .then_with(|| b.raw.cmp(&a.raw))
        });
    }

    /// Every entry whose pattern matches `image`, in decreasing specificity
    /// order. Never fails to produce a result list; an unparsable image
    /// reference yields an empty list rather than an error, matching the
    /// "never fails" contract of the original lookup — parse errors are
    /// only surfaced via `lookup_checked`.
    pub fn lookup(&self, image: &str) -> Vec<Credentials> {
        self.lookup_checked(image).unwrap_or_default()
    }

    pub fn lookup_checked(&self, image: &str) -> Result<Vec<Credentials>, KeyringError> {
        let target = MatchTarget::from_image(image)?;
        Ok(self
            .entries
            .iter()
            .filter(|(pattern, _)| pattern.matches(&target))
            .flat_map(|(_, entries)| entries.iter().map(Credentials::from))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, &str, &str)]) -> RegistryAuthDocument {
        let mut auths = HashMap::new();
        for (pattern, username, password) in pairs {
            auths.insert(
                pattern.to_string(),
                RegistryAuthEntry {
                    username: Some(username.to_string()),
                    password: Some(password.to_string()),
                    auth: None,
                    email: None,
                    server_address: None,
                    identity_token: None,
                    registry_token: None,
                },
            );
        }
        RegistryAuthDocument { auths }
    }

    #[test]
    fn longest_path_match_sorts_first() {
        let mut keyring = Keyring::new();
        keyring.add_document(doc(&[
            ("bar.example.com/pong", "grace", "g"),
            ("bar.example.com", "ada", "a"),
        ]));

        let hits = keyring.lookup("bar.example.com/pong/x");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].username.as_deref(), Some("grace"));
        assert_eq!(hits[1].username.as_deref(), Some("ada"));

        let hits = keyring.lookup("bar.example.com/ping");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].username.as_deref(), Some("ada"));

        assert!(keyring.lookup("example.com").is_empty());
    }

    #[test]
    fn default_registry_shortcut_matches_unqualified_and_docker_io_names() {
        let mut keyring = Keyring::new();
        keyring.add_document(doc(&[("docker.io", "rex", "r")]));

        for image in ["foo/bar", "docker.io/foo/bar", "index.docker.io/foo/bar"] {
            let hits = keyring.lookup(image);
            assert_eq!(hits.len(), 1, "expected a match for {image}");
            assert_eq!(hits[0].username.as_deref(), Some("rex"));
        }

        assert!(keyring.lookup("myhostdocker.io/foo/bar").is_empty());
    }

    #[test]
    fn wildcard_label_matches_substring_within_single_label() {
        let mut keyring = Keyring::new();
        keyring.add_document(doc(&[("*-good.kubernetes.io", "w", "w")]));

        assert_eq!(keyring.lookup("nice-good.kubernetes.io/img").len(), 1);
        assert!(keyring.lookup("kubernetes.io/img").is_empty());
    }

    #[test]
    fn wildcard_label_requires_equal_label_count() {
        let mut keyring = Keyring::new();
        keyring.add_document(doc(&[("*.kubernetes.io", "w", "w")]));

        assert!(keyring.lookup("kubernetes.io/img").is_empty());
        assert_eq!(keyring.lookup("bar.kubernetes.io/img").len(), 1);
    }

    #[test]
    fn port_must_match_exactly_when_either_side_specifies_one() {
        let mut keyring = Keyring::new();
        keyring.add_document(doc(&[("*.kubernetes.io:1234/blah", "w", "w")]));

        assert!(keyring
            .lookup("bar.kubernetes.io:1111/blah/x")
            .is_empty());
        assert_eq!(
            keyring.lookup("bar.kubernetes.io:1234/blah/x").len(),
            1
        );
    }

    #[test]
    fn auth_field_is_decoded_when_username_password_absent() {
        let mut auths = HashMap::new();
        auths.insert(
            "example.com".to_string(),
            RegistryAuthEntry {
                username: None,
                password: None,
                auth: Some(STANDARD.encode("alice:s3cr3t")),
                email: None,
                server_address: None,
                identity_token: None,
                registry_token: None,
            },
        );
        let mut keyring = Keyring::new();
        keyring.add_document(RegistryAuthDocument { auths });

        let hits = keyring.lookup("example.com/foo");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].username.as_deref(), Some("alice"));
        assert_eq!(hits[0].password.as_ref().unwrap().expose_secret(), "s3cr3t");
    }

    #[test]
    fn lookup_on_unparsable_reference_is_empty_not_an_error() {
        let keyring = Keyring::new();
        assert!(keyring.lookup("   not a valid reference   ").is_empty());
    }
}
