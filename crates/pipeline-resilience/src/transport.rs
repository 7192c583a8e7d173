//! Wire-level transport for upstream calls.
//!
//! [`Transport`] sends one JSON request and returns the raw response. It
//! does not retry and knows nothing about circuit breakers; that is the job
//! of [`crate::ResilientClient`]. [`HttpTransport`] is the `reqwest`
//! implementation; tests may substitute their own.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::time::Duration;

use crate::error::{TransportFailure, UpstreamError, UpstreamResult};

/// HTTP method subset used by upstream calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

/// One outgoing request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Option<serde_json::Value>,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl TransportRequest {
    /// Create a GET request
    #[must_use]
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    /// Create a POST request with a JSON body
    #[must_use]
    pub fn post(url: impl Into<String>, body: serde_json::Value, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            timeout,
        }
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Raw upstream response
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends a single request to an upstream
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. Non-2xx responses are returned, not raised.
    async fn send(&self, target: &str, request: TransportRequest)
        -> UpstreamResult<TransportResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the given connect timeout
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built
    pub fn new(connect_timeout: Duration) -> UpstreamResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| {
                UpstreamError::transport("http", TransportFailure::Other, e.to_string())
            })?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_reqwest_error(target: &str, timeout: Duration, error: &reqwest::Error) -> UpstreamError {
        if error.is_timeout() {
            return UpstreamError::Timeout {
                target: target.to_string(),
                timeout,
            };
        }
        UpstreamError::transport(target, classify(error), error.to_string())
    }
}

/// Walk the source chain for the underlying I/O or resolver failure
fn classify(error: &reqwest::Error) -> TransportFailure {
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return TransportFailure::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    return TransportFailure::ConnectionReset
                }
                std::io::ErrorKind::TimedOut => return TransportFailure::TimedOut,
                _ => {}
            }
        }
        let message = err.to_string().to_ascii_lowercase();
        if message.contains("dns") || message.contains("lookup") || message.contains("resolve") {
            return TransportFailure::UnresolvedHost;
        }
        source = err.source();
    }
    TransportFailure::Other
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        target: &str,
        request: TransportRequest,
    ) -> UpstreamResult<TransportResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        }
        .timeout(request.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_reqwest_error(target, request.timeout, &e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_reqwest_error(target, request.timeout, &e))?;

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}
