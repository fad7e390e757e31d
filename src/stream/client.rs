//! Geyser gRPC transport and connector seam.
//!
//! A [`Connector`] produces one [`Subscription`] per call: an outbound
//! request queue and an inbound update stream. The supervisor only talks to
//! this trait, so tests can drive sessions with scripted transports.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::mpsc;
use tonic::transport::ClientTlsConfig;
use tracing::debug;
use yellowstone_grpc_client::{GeyserGrpcBuilderError, GeyserGrpcClient};
use yellowstone_grpc_proto::prelude::{SubscribeRequest, SubscribeUpdate};

/// Public Yellowstone endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "https://solana-yellowstone-grpc.publicnode.com:443";

/// Largest inbound message the client will decode.
pub const MAX_DECODING_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Capacity of the outbound request queue.
pub const REQUEST_QUEUE_CAPACITY: usize = 16;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound half of a subscription.
pub type UpdateStream = Pin<Box<dyn Stream<Item = Result<SubscribeUpdate, StreamError>> + Send>>;

/// One open bidirectional subscription stream.
///
/// Dropping `requests` half-closes the outbound side.
pub struct Subscription {
    /// Outbound requests, written in order.
    pub requests: mpsc::Sender<SubscribeRequest>,
    /// Inbound updates. Ends when the server closes the stream.
    pub updates: UpdateStream,
}

impl Subscription {
    /// Pairs a request queue with an update stream.
    pub fn new<U>(requests: mpsc::Sender<SubscribeRequest>, updates: U) -> Self
    where
        U: Stream<Item = Result<SubscribeUpdate, StreamError>> + Send + 'static,
    {
        Self {
            requests,
            updates: Box::pin(updates),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Opens subscription streams.
pub trait Connector {
    /// Establishes a new stream. Errors here happen before any stream
    /// exists.
    fn connect(&self) -> impl Future<Output = Result<Subscription, StreamError>> + Send;
}

/// Errors produced by the stream transport.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Endpoint, TLS, or channel setup failed.
    #[error("grpc connect error: {0}")]
    Builder(#[from] GeyserGrpcBuilderError),

    /// Opening the subscribe call failed.
    #[error("grpc subscribe error: {0}")]
    Subscribe(#[source] tonic::Status),

    /// Transport reported an error while streaming.
    #[error("stream status: {0}")]
    Status(#[from] tonic::Status),

    /// A request could not be written to the stream.
    #[error("write error: {0}")]
    Write(String),

    /// Connecting did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

/// Production connector backed by `yellowstone-grpc-client`.
#[derive(Clone)]
pub struct GeyserConnector {
    endpoint: String,
    x_token: Option<SecretString>,
    connect_timeout: Duration,
}

impl GeyserConnector {
    /// Creates a connector for `endpoint`. TLS is used for `https://` URLs.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end().to_string(),
            x_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the `x-token` header sent with every request.
    pub fn with_x_token(mut self, x_token: Option<SecretString>) -> Self {
        self.x_token = x_token;
        self
    }

    /// Bounds the channel connect. Defaults to 10 seconds.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn uses_tls(&self) -> bool {
        self.endpoint.starts_with("https://")
    }

    async fn open(&self) -> Result<Subscription, StreamError> {
        let mut builder = GeyserGrpcClient::build_from_shared(self.endpoint.clone())?
            .x_token(
                self.x_token
                    .as_ref()
                    .map(|token| token.expose_secret().clone()),
            )?
            .connect_timeout(self.connect_timeout)
            .max_decoding_message_size(MAX_DECODING_MESSAGE_SIZE);
        if self.uses_tls() {
            builder = builder.tls_config(ClientTlsConfig::new().with_native_roots())?;
        }

        let mut client = builder.connect().await?;
        let (requests, outbound) = request_queue();
        let response = client
            .geyser
            .subscribe(outbound)
            .await
            .map_err(StreamError::Subscribe)?;
        debug!(event = "grpc_subscribe_opened", endpoint = %self.endpoint);

        let updates = response
            .into_inner()
            .map(|item| item.map_err(StreamError::from));
        Ok(Subscription::new(requests, updates))
    }
}

impl std::fmt::Debug for GeyserConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeyserConnector")
            .field("endpoint", &self.endpoint)
            .field("x_token", &self.x_token.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Outbound queue whose receiving half is handed to the gRPC call as the
/// request stream.
fn request_queue() -> (
    mpsc::Sender<SubscribeRequest>,
    impl Stream<Item = SubscribeRequest> + Send + 'static,
) {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
    let outbound = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|request| (request, rx))
    });
    (tx, outbound)
}

impl Connector for GeyserConnector {
    fn connect(&self) -> impl Future<Output = Result<Subscription, StreamError>> + Send {
        self.open()
    }
}
