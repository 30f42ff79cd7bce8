//! Wraps the generated CRI `ImageService` client behind a small trait, the
//! way `ivynet-grpc` wraps its backend client: call sites depend on
//! `CriClient`, not on `tonic::transport::Channel`, so tests can swap in a
//! fake without touching a real socket.

use std::path::Path;

use tonic::async_trait;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

pub mod proto {
    #![allow(clippy::derive_partial_eq_without_eq)]
    tonic::include_proto!("runtime.v1");
}

use proto::image_service_client::ImageServiceClient;
pub use proto::{AuthConfig, Image, ImageSpec, ListImagesResponse};
use proto::{ImageStatusRequest, ListImagesRequest, PullImageRequest};

#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    pub image_ref: String,
}

#[async_trait]
pub trait CriClient: Send + Sync + 'static {
    async fn list_images(&mut self) -> Result<ListImagesResponse, tonic::Status>;

    async fn pull_image(
        &mut self,
        image: &str,
        auth: Option<AuthConfig>,
    ) -> Result<PullOutcome, tonic::Status>;

    /// Size in bytes, or `None` if the runtime couldn't produce a status
    /// for the pulled reference.
    async fn image_status(&mut self, image_ref: &str) -> Result<Option<u64>, tonic::Status>;
}

/// Dials the runtime's UNIX-domain socket the way
/// `grpc.DialContext(ctx, "unix://"+path, insecure.NewCredentials())` does:
/// unencrypted, local-only.
pub async fn connect(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();
    Endpoint::try_from("http://[::]:50051")
        .expect("static placeholder URI is always valid")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                let stream = tokio::net::UnixStream::connect(socket_path).await?;
                Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
            }
        }))
        .await
}

#[derive(Clone)]
pub struct RuntimeImageClient(ImageServiceClient<Channel>);

impl RuntimeImageClient {
    pub fn new(channel: Channel) -> Self {
        Self(ImageServiceClient::new(channel))
    }
}

#[async_trait]
impl CriClient for RuntimeImageClient {
    async fn list_images(&mut self) -> Result<ListImagesResponse, tonic::Status> {
        let response = self
            .0
            .list_images(ListImagesRequest { filter: None })
            .await?;
        Ok(response.into_inner())
    }

    async fn pull_image(
        &mut self,
        image: &str,
        auth: Option<AuthConfig>,
    ) -> Result<PullOutcome, tonic::Status> {
        let request = PullImageRequest {
            image: Some(ImageSpec {
                image: image.to_string(),
            }),
            auth,
        };
        let response = self.0.pull_image(request).await?;
        Ok(PullOutcome {
            image_ref: response.into_inner().image_ref,
        })
    }

    async fn image_status(&mut self, image_ref: &str) -> Result<Option<u64>, tonic::Status> {
        let request = ImageStatusRequest {
            image: Some(ImageSpec {
                image: image_ref.to_string(),
            }),
            verbose: false,
        };
        let response = self.0.image_status(request).await?;
        Ok(response.into_inner().image.map(|image| image.size))
    }
}
