//! Client plumbing for the intake service: bearer-authenticated channel
//! setup and the delta streamer that uploads the store's change feed.

mod streamer;
pub use streamer::{DeltaStreamer, Metrics};

use proto_intake::intake_service_client::IntakeServiceClient;
use tonic::codegen::http::HeaderValue;
use tonic::transport::channel::Channel;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("bad uri: '{0}'")]
    BadUri(String),

    #[error("grpc transport error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    #[error("invalid bearer token")]
    InvalidBearerToken,
}

/// A connected intake client: the routed gRPC sub-client plus the raw
/// channel, kept for connection-readiness probes when (re)opening streams.
#[derive(Clone)]
pub struct Client {
    channel: Channel,
    grpc: IntakeServiceClient<WithAuthToken>,
}

/// Dial the intake service. `secure` selects TLS with native roots; the
/// API key, when present, is attached to every request as a bearer
/// `authorization` header.
pub async fn connect(
    address: &str,
    api_key: Option<String>,
    secure: bool,
) -> Result<Client, ConnectError> {
    let scheme = if secure { "https" } else { "http" };
    let url = format!("{scheme}://{address}");
    tracing::trace!(%url, "about to connect channel");

    let auth_header = if let Some(token) = api_key {
        Some(
            format!("Bearer {}", &token)
                .parse()
                // parse can only fail if the bearer token contains invalid characters
                .map_err(|_| ConnectError::InvalidBearerToken)?,
        )
    } else {
        None
    };

    let mut endpoint = Channel::from_shared(url.clone())
        .map_err(|_| ConnectError::BadUri(url))?
        .connect_timeout(std::time::Duration::from_secs(20));
    if secure {
        endpoint = endpoint.tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())?;
    }
    let channel = endpoint.connect().await?;

    tracing::trace!("channel is connected");
    let grpc = IntakeServiceClient::new(WithAuthToken {
        inner: channel.clone(),
        token_header: auth_header,
    });

    Ok(Client { channel, grpc })
}

#[derive(Clone)]
pub struct WithAuthToken {
    inner: Channel,
    token_header: Option<HeaderValue>,
}

impl tonic::client::GrpcService<tonic::body::BoxBody> for WithAuthToken {
    type ResponseBody = <::tonic::transport::Channel as tonic::client::GrpcService<
        tonic::body::BoxBody,
    >>::ResponseBody;
    type Error =
        <::tonic::transport::Channel as tonic::client::GrpcService<tonic::body::BoxBody>>::Error;
    type Future =
        <::tonic::transport::Channel as tonic::client::GrpcService<tonic::body::BoxBody>>::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(
        &mut self,
        mut request: tonic::codegen::http::Request<tonic::body::BoxBody>,
    ) -> Self::Future {
        if let Some(header) = self.token_header.as_ref() {
            request
                .headers_mut()
                .insert("authorization", header.clone());
        }
        self.inner.call(request)
    }
}

/// Maps a retry attempt to its backoff duration.
pub fn backoff(attempt: u32) -> std::time::Duration {
    match attempt {
        0 => std::time::Duration::ZERO,
        1 | 2 => std::time::Duration::from_millis(50),
        3 | 4 => std::time::Duration::from_secs(1),
        _ => std::time::Duration::from_secs(5),
    }
}
