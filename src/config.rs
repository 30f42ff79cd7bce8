//! CLI surface and process-default configuration. Treated as external
//! glue by the spec (flag parsing is explicitly out of scope for the hard
//! core) but still needed to run the binary.

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Process defaults, overridable by `IMAGE_PREFETCHER__*` env vars the same
/// way the teacher's `Settings::new` layers `Environment::default()` over a
/// `config/default.*` file with a `__` separator.
#[derive(Debug, Deserialize, Clone)]
pub struct Defaults {
    pub cri_socket: String,
    pub grpc_port: u16,
    pub http_port: u16,
}

impl Defaults {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("cri_socket", "/run/containerd/containerd.sock")?
            .set_default("grpc_port", 8443)?
            .set_default("http_port", 8080)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("IMAGE_PREFETCHER")
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    pub image_list_timeout: Duration,
    pub initial_pull_attempt_timeout: Duration,
    pub max_pull_attempt_timeout: Duration,
    pub overall_timeout: Duration,
    pub initial_pull_attempt_delay: Duration,
    pub max_pull_attempt_delay: Duration,
}

impl TimingConfig {
    /// All positive, initial <= max on both series. Panics on violation —
    /// this is checked once at process startup from CLI-parsed values.
    pub fn validate(&self) {
        assert!(!self.image_list_timeout.is_zero(), "image-list-timeout must be positive");
        assert!(!self.overall_timeout.is_zero(), "overall-timeout must be positive");
        assert!(
            self.initial_pull_attempt_timeout <= self.max_pull_attempt_timeout,
            "initial-pull-attempt-timeout must be <= max-pull-attempt-timeout"
        );
        assert!(
            self.initial_pull_attempt_delay <= self.max_pull_attempt_delay,
            "initial-pull-attempt-delay must be <= max-pull-attempt-delay"
        );
    }
}

#[derive(Parser, Debug)]
#[command(name = "image-prefetcher", about = "An image prefetching utility.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch images using CRI. Intended to run in an init container of pods
    /// of a DaemonSet.
    Fetch(FetchArgs),

    /// Accept metrics submissions and serve them. Intended to run as a
    /// singleton pod.
    AggregateMetrics(AggregateMetricsArgs),

    /// Block forever. Used as an auxiliary init-container placeholder in
    /// some deployment flavors.
    Sleep(SleepArgs),
}

#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Falls back to `Defaults::load()` (config file / env) when unset.
    #[arg(long)]
    pub cri_socket: Option<String>,

    #[arg(long)]
    pub docker_config: Option<String>,

    #[arg(long)]
    pub image_list_file: Option<String>,

    #[arg(long)]
    pub metrics_endpoint: Option<String>,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    pub image_list_timeout: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub initial_pull_attempt_timeout: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub max_pull_attempt_timeout: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "20m")]
    pub overall_timeout: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    pub initial_pull_attempt_delay: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
    pub max_pull_attempt_delay: Duration,

    #[arg(long)]
    pub debug: bool,

    /// Image names, appended after any loaded from --image-list-file.
    pub images: Vec<String>,
}

impl FetchArgs {
    pub fn timing(&self) -> TimingConfig {
        TimingConfig {
            image_list_timeout: self.image_list_timeout,
            initial_pull_attempt_timeout: self.initial_pull_attempt_timeout,
            max_pull_attempt_timeout: self.max_pull_attempt_timeout,
            overall_timeout: self.overall_timeout,
            initial_pull_attempt_delay: self.initial_pull_attempt_delay,
            max_pull_attempt_delay: self.max_pull_attempt_delay,
        }
    }
}

#[derive(Parser, Debug)]
pub struct AggregateMetricsArgs {
    /// Falls back to `Defaults::load()` (config file / env) when unset.
    #[arg(long)]
    pub grpc_port: Option<u16>,

    /// Falls back to `Defaults::load()` (config file / env) when unset.
    #[arg(long)]
    pub http_port: Option<u16>,

    #[arg(long)]
    pub debug: bool,
}

#[derive(Parser, Debug)]
pub struct SleepArgs {
    #[arg(long)]
    pub debug: bool,
}

/// Parses a text file of image names: blank lines and `#`-prefixed comment
/// lines are dropped, matching `original_source/cmd/fetch.go`'s
/// `parseImageNames`.
pub fn parse_image_names(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_image_names_skips_blank_and_comment_lines() {
        let input = "\nregistry.example/foo:1\n# a comment\n  \nregistry.example/bar:2  \n";
        let names = parse_image_names(input);
        assert_eq!(names, vec!["registry.example/foo:1", "registry.example/bar:2"]);
    }

    #[test]
    fn timing_config_validates_ordering() {
        let timing = TimingConfig {
            image_list_timeout: Duration::from_secs(1),
            initial_pull_attempt_timeout: Duration::from_secs(1),
            max_pull_attempt_timeout: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(10),
            initial_pull_attempt_delay: Duration::from_secs(1),
            max_pull_attempt_delay: Duration::from_secs(2),
        };
        timing.validate();
    }

    #[test]
    #[should_panic(expected = "initial-pull-attempt-timeout")]
    fn timing_config_rejects_inverted_timeout_bounds() {
        let timing = TimingConfig {
            image_list_timeout: Duration::from_secs(1),
            initial_pull_attempt_timeout: Duration::from_secs(5),
            max_pull_attempt_timeout: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(10),
            initial_pull_attempt_delay: Duration::from_secs(1),
            max_pull_attempt_delay: Duration::from_secs(2),
        };
        timing.validate();
    }
}
