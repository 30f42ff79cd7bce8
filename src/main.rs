use clap::Parser;
use image_prefetcher::config::{parse_image_names, Cli, Command, Defaults};
use image_prefetcher::{labels, logging, metrics, pull, signals};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let defaults = Defaults::load().unwrap_or_else(|error| {
        tracing::warn!(%error, "failed to load process defaults, falling back to built-ins");
        Defaults {
            cri_socket: "/run/containerd/containerd.sock".to_string(),
            grpc_port: 8443,
            http_port: 8080,
        }
    });

    match cli.command {
        Command::Fetch(args) => {
            let _guards = logging::init(args.debug, true);
            tracing::info!(version = VERSION, "starting image-prefetcher fetch");

            let mut images = Vec::new();
            if let Some(path) = &args.image_list_file {
                match std::fs::read_to_string(path) {
                    Ok(contents) => images.extend(parse_image_names(&contents)),
                    Err(error) => {
                        tracing::error!(path, %error, "failed to read image list file");
                        std::process::exit(1);
                    }
                }
            }
            images.extend(args.images.iter().cloned());

            let cri_socket = args.cri_socket.clone().unwrap_or(defaults.cri_socket);
            let timing = args.timing();
            let result = pull::fetch(
                timing,
                std::path::Path::new(&cri_socket),
                args.docker_config.as_deref().map(std::path::Path::new),
                args.metrics_endpoint.as_deref(),
                &images,
                args.debug,
            )
            .await;

            let label_result = match result {
                Ok(label_result) => label_result,
                Err(error) => {
                    tracing::error!(%error, "fetch failed");
                    std::process::exit(1);
                }
            };

            apply_node_label(&label_result).await;
        }
        Command::AggregateMetrics(args) => {
            let _guards = logging::init(args.debug, false);
            tracing::info!(version = VERSION, "starting image-prefetcher metrics aggregator");
            let grpc_port = args.grpc_port.unwrap_or(defaults.grpc_port);
            let http_port = args.http_port.unwrap_or(defaults.http_port);
            if let Err(error) = metrics::aggregator::run(grpc_port, http_port).await {
                tracing::error!(%error, "aggregator exited");
                std::process::exit(1);
            }
        }
        Command::Sleep(args) => {
            let _guards = logging::init(args.debug, false);
            tracing::info!("sleeping until a shutdown signal is received");
            signals::wait_for_shutdown_signal().await;
        }
    }
}

/// Patches the node with the run's outcome, if `NODE_NAME`/`INSTANCE_NAME`
/// are set and a Kubernetes client can be built. Missing environment or a
/// client-construction failure is a warning, not a fatal error.
async fn apply_node_label(label_result: &pull::NodeLabelResult) {
    let (Ok(node_name), Ok(instance_name)) = (
        std::env::var("NODE_NAME"),
        std::env::var("INSTANCE_NAME"),
    ) else {
        tracing::warn!("NODE_NAME or INSTANCE_NAME not set, skipping node labeling");
        return;
    };

    let patcher = match labels::KubeNodePatcher::try_default().await {
        Ok(patcher) => patcher,
        Err(error) => {
            tracing::warn!(%error, "failed to build kubernetes client, skipping node labeling");
            return;
        }
    };

    let key = format!("{}{}", labels::LABEL_PREFIX, labels::sanitize(&instance_name));
    let value = labels::outcome_value(label_result.all_succeeded());
    labels::patch_with_retry(&patcher, &node_name, &key, value).await;
}
