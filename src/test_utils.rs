//! Scripted HTTP and stream doubles for exercising the console without a gateway.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use whatsapp_console_core::net::{
    EventStream, EventStreamFactory, HttpClient, HttpRequest, HttpResponse, StreamEvent,
};

#[derive(Debug, Clone)]
pub enum MockReply {
    Response { status: u16, body: Vec<u8> },
    Error(String),
    Delayed(Duration, Box<MockReply>),
    /// Never completes.
    Hang,
}

fn request_path(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme
        .find('/')
        .map_or("/", |i| &without_scheme[i..]);
    path.split('?').next().unwrap_or(path)
}

/// HTTP client answering from per-path scripts. The last reply queued for a
/// path repeats; unscripted paths answer 404.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    routes: Mutex<HashMap<String, VecDeque<MockReply>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, path: &str, reply: MockReply) {
        self.routes
            .lock()
            .expect("mutex should not be poisoned")
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn respond_json(&self, path: &str, status: u16, body: Value) {
        self.respond_raw(path, status, body.to_string().into_bytes());
    }

    pub fn respond_raw(&self, path: &str, status: u16, body: Vec<u8>) {
        self.push(path, MockReply::Response { status, body });
    }

    pub fn respond_json_after(&self, path: &str, delay: Duration, status: u16, body: Value) {
        let reply = MockReply::Response {
            status,
            body: body.to_string().into_bytes(),
        };
        self.push(path, MockReply::Delayed(delay, Box::new(reply)));
    }

    pub fn fail(&self, path: &str, message: &str) {
        self.push(path, MockReply::Error(message.to_string()));
    }

    pub fn hang(&self, path: &str) {
        self.push(path, MockReply::Hang);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }

    pub fn calls(&self, path: &str) -> usize {
        self.requests
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .filter(|r| request_path(&r.url) == path)
            .count()
    }

    fn next_reply(&self, path: &str) -> MockReply {
        let mut routes = self.routes.lock().expect("mutex should not be poisoned");
        match routes.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(MockReply::Hang),
            Some(queue) => queue.front().cloned().unwrap_or(MockReply::Hang),
            None => MockReply::Response {
                status: 404,
                body: Vec::new(),
            },
        }
    }
}

async fn play(reply: MockReply) -> Result<HttpResponse> {
    let mut reply = reply;
    loop {
        match reply {
            MockReply::Response { status, body } => {
                return Ok(HttpResponse {
                    status_code: status,
                    body,
                });
            }
            MockReply::Error(message) => return Err(anyhow::anyhow!(message)),
            MockReply::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
            MockReply::Hang => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let reply = self.next_reply(request_path(&request.url));
        self.requests
            .lock()
            .expect("mutex should not be poisoned")
            .push(request);
        play(reply).await
    }
}

pub struct MockEventStream {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl EventStream for MockEventStream {
    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Stream factory whose sessions are fed by the test.
pub struct MockStreamFactory {
    failures: AtomicUsize,
    closed: Arc<AtomicUsize>,
    senders: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    requests: Mutex<Vec<HttpRequest>>,
    opened: watch::Sender<usize>,
}

impl Default for MockStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStreamFactory {
    pub fn new() -> Self {
        Self {
            failures: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            senders: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            opened: watch::channel(0).0,
        }
    }

    /// Makes the next `count` open attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Open attempts so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.requests
            .lock()
            .expect("mutex should not be poisoned")
            .len()
    }

    pub fn sessions(&self) -> usize {
        *self.opened.borrow()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        let mut rx = self.opened.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }

    fn latest(&self) -> Option<mpsc::Sender<StreamEvent>> {
        self.senders
            .lock()
            .expect("mutex should not be poisoned")
            .last()
            .cloned()
    }

    /// Sends raw bytes on the newest session.
    pub async fn push_bytes(&self, data: impl Into<Bytes>) {
        if let Some(tx) = self.latest() {
            let _ = tx.send(StreamEvent::DataReceived(data.into())).await;
        }
    }

    /// Sends one SSE-framed JSON event on the newest session.
    pub async fn push_frame(&self, frame: Value) {
        self.push_bytes(format!("data: {frame}\n\n")).await;
    }

    /// Simulates the gateway dropping the newest session.
    pub async fn drop_connection(&self) {
        if let Some(tx) = self.latest() {
            let _ = tx.send(StreamEvent::Disconnected).await;
        }
    }
}

#[async_trait]
impl EventStreamFactory for MockStreamFactory {
    async fn open(
        &self,
        request: HttpRequest,
    ) -> Result<(Arc<dyn EventStream>, mpsc::Receiver<StreamEvent>)> {
        self.requests
            .lock()
            .expect("mutex should not be poisoned")
            .push(request);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("connection refused"));
        }

        let (tx, rx) = mpsc::channel(64);
        let _ = tx.send(StreamEvent::Connected).await;
        self.senders
            .lock()
            .expect("mutex should not be poisoned")
            .push(tx);
        self.opened.send_modify(|n| *n += 1);

        let stream = MockEventStream {
            closed: self.closed.clone(),
        };
        Ok((Arc::new(stream), rx))
    }
}
