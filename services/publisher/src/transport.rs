//! Persistent-connection HTTP transport to one REST host.
//!
//! The publisher talks to the API through the [`Transport`] trait so the
//! state machine can be driven against scripted responses in tests. The
//! production implementation, [`HttpTransport`], keeps one pooled keep-alive
//! connection per host.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Which remote host a transport talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Metadata calls (listing, folder creation).
    Api,
    /// File content uploads.
    Content,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Api => f.write_str("api"),
            Endpoint::Content => f.write_str("content"),
        }
    }
}

/// Errors that can occur while exchanging a request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open connection to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("Connection to {endpoint} lost: {message}")]
    ConnectionLost { endpoint: Endpoint, message: String },

    #[error("Request to {endpoint} timed out")]
    Timeout { endpoint: Endpoint },

    #[error("Request to {endpoint} failed: {message}")]
    Request { endpoint: Endpoint, message: String },
}

impl TransportError {
    /// The endpoint whose connection dropped, if this error means one did.
    pub fn lost_connection(&self) -> Option<Endpoint> {
        match self {
            TransportError::ConnectionLost { endpoint, .. } => Some(*endpoint),
            _ => None,
        }
    }
}

/// Outgoing request body.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    /// Compact single-line JSON.
    Json(String),
    /// Raw bytes, attached by reference: the transport holds a refcount on the
    /// caller's buffer instead of copying it.
    Bytes(Bytes),
}

impl RequestBody {
    pub fn len(&self) -> usize {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Json(json) => json.len(),
            RequestBody::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Body bytes, for logging and inspection.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RequestBody::Empty => &[],
            RequestBody::Json(json) => json.as_bytes(),
            RequestBody::Bytes(bytes) => bytes,
        }
    }
}

/// A labeled request against one host.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Short operation name used in logs.
    pub label: &'static str,
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(label: &'static str, method: Method, path: impl Into<String>) -> Self {
        Self {
            label,
            method,
            path: path.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response as received, whatever its status.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Body as text, lossy, for log lines.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Request/response exchange over one persistent connection.
///
/// Each call resolves exactly once, with either a response or an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Connection settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// reqwest-backed transport holding a single keep-alive connection.
pub struct HttpTransport {
    endpoint: Endpoint,
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build the client for `base_url` (e.g. `https://api.dropboxapi.com`).
    pub fn open(
        endpoint: Endpoint,
        base_url: &str,
        settings: &TransportSettings,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .pool_max_idle_per_host(1)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| TransportError::Connect {
                host: base_url.to_string(),
                message: e.to_string(),
            })?;

        debug!(endpoint = %endpoint, base_url = %base_url, "HTTP transport opened");

        Ok(Self {
            endpoint,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout {
                endpoint: self.endpoint,
            }
        } else if error.is_connect() {
            TransportError::ConnectionLost {
                endpoint: self.endpoint,
                message: error.to_string(),
            }
        } else {
            TransportError::Request {
                endpoint: self.endpoint,
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(endpoint = %self.endpoint, label = request.label, path = %request.path))]
    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method.clone(), &url);

        for (name, value) in &request.headers {
            // reqwest derives Host from the URL
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(json) => builder.body(json),
            RequestBody::Bytes(bytes) => builder.body(bytes),
        };

        let response = builder.send().await.map_err(|e| {
            let error = self.classify(e);
            warn!(method = %request.method, error = %error, "Request failed");
            error
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        debug!(status = status, size_bytes = body.len(), "Response received");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
