//! Wire access to the relay: one long-lived stream per room and one-shot
//! emits. `Transport` is the seam the multiplexer talks to, so tests can
//! swap the HTTP implementation for an in-memory one.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use relay_common::{EmitRequest, StreamParams};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Response, Url};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::frame::{decode_frames, RawFrame};

pub const STREAM_PATH: &str = "/realtime/stream";
pub const EMIT_PATH: &str = "/realtime/emit";

/// Frames of one open stream; ends when the connection does
pub type FrameStream = BoxStream<'static, Result<RawFrame, ClientError>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the event stream of `params.room`
    async fn open_stream(&self, params: &StreamParams) -> Result<FrameStream, ClientError>;

    /// Publish one event
    async fn emit(&self, request: &EmitRequest) -> Result<(), ClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    request_timeout: std::time::Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        // No overall timeout on the client: streams stay open indefinitely
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        })
    }

    fn stream_url(&self, params: &StreamParams) -> Result<Url, ClientError> {
        Url::parse_with_params(
            &format!("{}{STREAM_PATH}", self.base_url),
            [
                ("room", params.room.as_str()),
                ("id", params.id.as_str()),
                ("name", params.name.as_str()),
                ("role", params.role.as_str()),
            ],
        )
        .map_err(|e| ClientError::Url(e.to_string()))
    }
}

async fn ensure_success(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, params: &StreamParams) -> Result<FrameStream, ClientError> {
        let url = self.stream_url(params)?;
        debug!(%url, "Opening event stream");

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ClientError::from))
            .boxed();
        Ok(decode_frames(bytes))
    }

    async fn emit(&self, request: &EmitRequest) -> Result<(), ClientError> {
        let response = self
            .client
            .post(format!("{}{EMIT_PATH}", self.base_url))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}
