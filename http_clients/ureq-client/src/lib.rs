use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace, warn};
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use ureq::Agent;
use whatsapp_console_core::net::{
    EventStream, EventStreamFactory, HttpClient, HttpRequest, HttpResponse, StreamEvent,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_CHUNK_SIZE: usize = 8 * 1024;
const STREAM_CHANNEL_CAPACITY: usize = 100;

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
///
/// Non-2xx responses are returned as-is so callers can inspect the status.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: Agent,
}

impl UreqHttpClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn call(agent: &Agent, request: HttpRequest) -> Result<ureq::http::Response<ureq::Body>> {
    let response = match request.method.as_str() {
        "GET" => {
            let mut req = agent.get(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            req.call()?
        }
        "POST" => {
            let mut req = agent.post(&request.url);
            for (key, value) in &request.headers {
                req = req.header(key, value);
            }
            if let Some(body) = request.body {
                req.send(&body[..])?
            } else {
                req.send(&[])?
            }
        }
        method => {
            return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method));
        }
    };
    Ok(response)
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || {
            let response = call(&agent, request)?;
            let status_code = response.status().as_u16();
            let body = response.into_body().read_to_vec()?;
            Ok(HttpResponse { status_code, body })
        })
        .await?
    }
}

/// Opens the gateway's event stream as a long-lived `ureq` response body.
///
/// The body is read on a blocking thread. After `close` the thread exits on
/// its next read, which the gateway's keepalive comments guarantee.
#[derive(Debug, Clone)]
pub struct UreqEventStreamFactory {
    agent: Agent,
}

impl UreqEventStreamFactory {
    pub fn new() -> Self {
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(STREAM_CONNECT_TIMEOUT))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for UreqEventStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UreqEventStream {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl EventStream for UreqEventStream {
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing event stream");
        }
    }
}

#[async_trait]
impl EventStreamFactory for UreqEventStreamFactory {
    async fn open(
        &self,
        request: HttpRequest,
    ) -> Result<(Arc<dyn EventStream>, mpsc::Receiver<StreamEvent>)> {
        let agent = self.agent.clone();
        let response = tokio::task::spawn_blocking(move || call(&agent, request)).await??;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.into_body().read_to_string().unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Event stream rejected with status {}: {}",
                status,
                body.trim()
            ));
        }

        let (event_tx, event_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let _ = event_tx.send(StreamEvent::Connected).await;

        let reader = response.into_body().into_reader();
        let pump_closed = closed.clone();
        tokio::task::spawn_blocking(move || read_pump(reader, event_tx, pump_closed));

        Ok((Arc::new(UreqEventStream { closed }), event_rx))
    }
}

fn read_pump(mut reader: impl Read, event_tx: mpsc::Sender<StreamEvent>, closed: Arc<AtomicBool>) {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        if closed.load(Ordering::Acquire) {
            break;
        }
        match reader.read(&mut chunk) {
            Ok(0) => {
                debug!("Event stream ended by server");
                break;
            }
            Ok(n) => {
                trace!("<-- Received {} stream bytes", n);
                let data = Bytes::copy_from_slice(&chunk[..n]);
                if event_tx.blocking_send(StreamEvent::DataReceived(data)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !closed.load(Ordering::Acquire) {
                    warn!("Error reading event stream: {e}");
                }
                break;
            }
        }
    }
    let _ = event_tx.blocking_send(StreamEvent::Disconnected);
}
