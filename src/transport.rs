//! HTTP transport for chat requests.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use futures::stream::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result, classify_transport};
use crate::observability::{CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS};

/// Body chunks of a successful response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Body of one chat request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    /// The user's message, trimmed.
    pub message: String,
    /// Auth token of the user.
    pub auth_token: String,
    /// Key for the automation backend.
    pub api_key: String,
    /// Backend the agent should act on.
    pub api_url: String,
    /// Continuation token; serialized as `null` when absent.
    pub session_id: Option<String>,
    /// Opaque credentials relayed to the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_credentials: Option<Value>,
    /// Model provider key supplied by the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_key: Option<String>,
}

/// Opens one chat exchange.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the body stream of a successful response.
    ///
    /// A non-success status must come back as [`Error::Http`] carrying the
    /// body text; connection failures as [`Error::Network`].
    async fn open(&self, request: ChatRequest) -> Result<ByteStream>;
}

/// [`Transport`] that POSTs to `{service_url}/chat`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
    endpoint: String,
}

impl HttpTransport {
    /// Creates a transport for `service_url`.
    ///
    /// `timeout` bounds the whole request, stream included; `None` waits
    /// indefinitely.
    pub fn new(service_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = ReqwestClient::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            Error::network(
                format!("Failed to build HTTP client: {e}"),
                Some(Box::new(e)),
            )
        })?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat", service_url.trim_end_matches('/')),
        })
    }

    /// The URL requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers
    }

    async fn process_error_response(response: Response) -> Error {
        let status_code = response.status().as_u16();
        match response.text().await {
            Ok(body) => Error::http(status_code, body),
            Err(e) => classify_transport(e),
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: ChatRequest) -> Result<ByteStream> {
        CLIENT_REQUESTS.click();
        let response = self
            .client
            .post(&self.endpoint)
            .headers(Self::default_headers())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                CLIENT_REQUEST_ERRORS.click();
                classify_transport(e)
            })?;

        if !response.status().is_success() {
            CLIENT_REQUEST_ERRORS.click();
            return Err(Self::process_error_response(response).await);
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify_transport));
        Ok(Box::pin(stream))
    }
}
