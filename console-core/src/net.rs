use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String, // "GET" or "POST"
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Serializes `value` as the request body and sets the JSON content type.
    pub fn with_json<T: serde::Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header("Content-Type", "application/json")
            .with_body(body))
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Lossy UTF-8 view of the body, used for error reporting.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// An event produced by an open event stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The gateway accepted the stream request.
    Connected,
    /// Raw bytes of the stream body. Frame boundaries are not preserved.
    DataReceived(Bytes),
    /// The stream ended or the connection was lost.
    Disconnected,
}

/// Represents an open push-event stream.
/// The stream is a dumb pipe for bytes with no knowledge of gateway framing.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Closes the stream and releases the underlying connection.
    async fn close(&self);
}

/// A factory responsible for opening event streams.
#[async_trait]
pub trait EventStreamFactory: Send + Sync {
    /// Opens a stream for the request and returns it, along with its events.
    async fn open(
        &self,
        request: HttpRequest,
    ) -> Result<(Arc<dyn EventStream>, mpsc::Receiver<StreamEvent>)>;
}
