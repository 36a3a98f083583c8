//! Lifecycle of the gateway's push-event stream.

use crate::types::events::{Event, EventBus};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use whatsapp_console_core::backoff::ReconnectPolicy;
use whatsapp_console_core::framing::FrameDecoder;
use whatsapp_console_core::net::{EventStream, EventStreamFactory, HttpRequest, StreamEvent};
use whatsapp_console_core::proto::{self, RawFrame};
use whatsapp_console_core::types::ConnectionState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct StreamSession {
    instance_id: String,
    stop: StopHandle,
    task: JoinHandle<()>,
}

impl StreamSession {
    /// Stops the session without waiting. The run loop closes the stream on
    /// its way out; a loop stuck past the grace period is aborted.
    fn stop_detached(self) {
        self.stop.stop();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let mut task = self.task;
                runtime.spawn(async move {
                    if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                        task.abort();
                    }
                });
            }
            Err(_) => self.task.abort(),
        }
    }
}

/// Stops one specific stream session, even after it has been replaced.
#[derive(Clone, Debug)]
pub struct StopHandle(Arc<Notify>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.notify_one();
    }
}

/// Everything the run loop needs, detached from the manager so the loop can
/// outlive a borrow of it.
#[derive(Clone)]
struct RunContext {
    factory: Arc<dyn EventStreamFactory>,
    policy: ReconnectPolicy,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    shutdown: Arc<Notify>,
    idle_timeout: Option<Duration>,
    request: HttpRequest,
    frames: mpsc::Sender<RawFrame>,
}

impl RunContext {
    fn transition(&self, next: ConnectionState) {
        transition(&self.state, &self.events, next);
    }
}

fn transition(state: &watch::Sender<ConnectionState>, events: &EventBus, next: ConnectionState) {
    let changed = state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        debug!(target: "Console/Stream", "Connection state -> {next:?}");
        events.dispatch(Event::Connection(next));
    }
}

enum PumpExit {
    Stopped,
    Dropped,
}

/// Owns the single live stream session.
///
/// `connect` replaces any previous session, so at most one stream and one
/// reconnect timer exist at a time. Decoded frames go out through a bounded
/// channel; malformed frames are logged and dropped.
pub struct StreamConnectionManager {
    factory: Arc<dyn EventStreamFactory>,
    policy: ReconnectPolicy,
    channel_capacity: usize,
    idle_timeout: Option<Duration>,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<StreamSession>>,
}

impl StreamConnectionManager {
    pub fn new(
        factory: Arc<dyn EventStreamFactory>,
        policy: ReconnectPolicy,
        channel_capacity: usize,
        events: EventBus,
    ) -> Self {
        Self {
            factory,
            policy,
            channel_capacity: channel_capacity.max(1),
            idle_timeout: None,
            events,
            state: watch::channel(ConnectionState::Disconnected).0,
            session: Mutex::new(None),
        }
    }

    /// Treats a session that delivers nothing for `limit` as dead and
    /// reconnects. The gateway's keepalive comments count as activity.
    pub fn with_idle_timeout(mut self, limit: Option<Duration>) -> Self {
        self.idle_timeout = limit;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Instance id of the current session, if one is running.
    pub fn instance_id(&self) -> Option<String> {
        self.session
            .lock()
            .expect("mutex should not be poisoned")
            .as_ref()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.instance_id.clone())
    }

    /// Starts a stream session for `instance_id`, replacing any previous one.
    ///
    /// Never fails: open errors are retried in the background according to
    /// the reconnect policy. The returned channel closes when the session
    /// ends; the handle stops this session and no later one.
    pub async fn connect(
        &self,
        instance_id: &str,
        request: HttpRequest,
    ) -> (mpsc::Receiver<RawFrame>, StopHandle) {
        self.disconnect().await;

        let (frames_tx, frames_rx) = mpsc::channel(self.channel_capacity);
        let shutdown = Arc::new(Notify::new());
        let ctx = RunContext {
            factory: self.factory.clone(),
            policy: self.policy.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            shutdown: shutdown.clone(),
            idle_timeout: self.idle_timeout,
            request,
            frames: frames_tx,
        };

        info!(target: "Console/Stream", "Opening event stream for instance {instance_id}");
        let task = tokio::spawn(run(ctx));
        *self.session.lock().expect("mutex should not be poisoned") = Some(StreamSession {
            instance_id: instance_id.to_string(),
            stop: StopHandle(shutdown.clone()),
            task,
        });
        (frames_rx, StopHandle(shutdown))
    }

    /// Ends the current session and waits for its task to finish. The
    /// stream is closed and no reconnect timer survives.
    pub async fn disconnect(&self) {
        let session = self
            .session
            .lock()
            .expect("mutex should not be poisoned")
            .take();
        let Some(session) = session else {
            return;
        };
        info!(target: "Console/Stream", "Closing event stream for instance {}", session.instance_id);
        session.stop.stop();
        let mut task = session.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!(target: "Console/Stream", "Stream task did not stop in time, aborting");
            task.abort();
            transition(&self.state, &self.events, ConnectionState::Disconnected);
        }
    }

    /// Stops the current session without waiting for it. Usable from
    /// synchronous contexts such as `Drop`.
    pub fn shutdown(&self) {
        let session = self
            .session
            .lock()
            .expect("mutex should not be poisoned")
            .take();
        if let Some(session) = session {
            info!(target: "Console/Stream", "Stopping event stream for instance {}", session.instance_id);
            session.stop_detached();
        }
    }
}

impl Drop for StreamConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.session.lock()
            && let Some(session) = guard.take()
        {
            session.stop_detached();
        }
    }
}

async fn run(ctx: RunContext) {
    let _state_guard = scopeguard::guard(ctx.clone(), |ctx| {
        ctx.transition(ConnectionState::Disconnected);
    });

    // Consecutive failures since the last successful open.
    let mut attempt: u32 = 0;
    ctx.transition(ConnectionState::Connecting);

    loop {
        let opened = tokio::select! {
            biased;
            _ = ctx.shutdown.notified() => break,
            opened = ctx.factory.open(ctx.request.clone()) => opened,
        };

        match opened {
            Ok((stream, stream_events)) => {
                let exit = pump(&ctx, stream_events, &mut attempt).await;
                stream.close().await;
                if let PumpExit::Stopped = exit {
                    break;
                }
            }
            Err(e) => {
                warn!(target: "Console/Stream", "Failed to open event stream: {e}");
            }
        }

        attempt += 1;
        if !ctx.policy.allows(attempt) {
            let attempts = attempt - 1;
            warn!(target: "Console/Stream", "Giving up after {attempts} reconnect attempts");
            ctx.events.dispatch(Event::ReconnectExhausted { attempts });
            break;
        }
        let delay = ctx.policy.delay(attempt);
        info!(
            target: "Console/Stream",
            "Will attempt to reconnect in {:?} (attempt {})", delay, attempt
        );
        ctx.transition(ConnectionState::Reconnecting { attempt, delay });

        tokio::select! {
            biased;
            _ = ctx.shutdown.notified() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(target: "Console/Stream", "Stream run loop has shut down");
}

async fn pump(
    ctx: &RunContext,
    mut stream_events: mpsc::Receiver<StreamEvent>,
    attempt: &mut u32,
) -> PumpExit {
    let mut decoder = FrameDecoder::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.shutdown.notified() => return PumpExit::Stopped,
            received = recv_within(&mut stream_events, ctx.idle_timeout) => match received {
                Some(event) => event,
                None => {
                    warn!(
                        target: "Console/Stream",
                        "No stream activity for {:?}, assuming the connection is dead",
                        ctx.idle_timeout.unwrap_or_default()
                    );
                    return PumpExit::Dropped;
                }
            },
        };
        match event {
            Some(StreamEvent::Connected) => {
                *attempt = 0;
                info!(target: "Console/Stream", "Event stream connected");
                ctx.transition(ConnectionState::Connected);
            }
            Some(StreamEvent::DataReceived(data)) => {
                decoder.feed(&data);
                while let Some(frame) = decoder.decode_frame() {
                    match proto::parse_frame(&frame) {
                        Ok(raw) => {
                            if ctx.frames.send(raw).await.is_err() {
                                debug!(target: "Console/Stream", "Frame consumer gone, stopping");
                                return PumpExit::Stopped;
                            }
                        }
                        Err(e) => {
                            warn!(target: "Console/Stream", "Dropping malformed frame: {e}");
                        }
                    }
                }
            }
            Some(StreamEvent::Disconnected) | None => {
                info!(target: "Console/Stream", "Event stream disconnected");
                return PumpExit::Dropped;
            }
        }
    }
}

/// `None` when nothing arrived within `limit`.
async fn recv_within(
    stream_events: &mut mpsc::Receiver<StreamEvent>,
    limit: Option<Duration>,
) -> Option<Option<StreamEvent>> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, stream_events.recv()).await.ok(),
        None => Some(stream_events.recv().await),
    }
}
