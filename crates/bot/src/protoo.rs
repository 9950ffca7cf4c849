//! Protoo WebSocket client.
//!
//! One client per session, owned for the session's lifetime. Sends are safe
//! from any task: before the socket opens (and between reconnects) frames
//! are buffered and flushed in FIFO order on open. Requests are correlated
//! by id and guarded by a timeout; on socket loss every pending request is
//! completed with an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use stampede_protocol::{
    ProtooMessage, ProtooNotification, ProtooParseError, ProtooRequest, ProtooResponse,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ProtooError {
    #[error("request timeout, method={0}")]
    Timeout(String),
    #[error("connection closed")]
    Closed,
}

pub struct ProtooClient {
    inner: Arc<Inner>,
}

struct Inner {
    request_timeout: Duration,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ProtooResponse>>>,
    writer: Mutex<Writer>,
    handlers: Mutex<Handlers>,
    connection: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

enum Writer {
    /// No live socket; frames wait here and flush in FIFO order on open.
    Buffering(Vec<String>),
    Open(mpsc::UnboundedSender<Message>),
}

#[derive(Default)]
struct Handlers {
    on_request: Option<Arc<dyn Fn(ProtooRequest) + Send + Sync>>,
    on_notify: Option<Arc<dyn Fn(ProtooNotification) + Send + Sync>>,
    on_close: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ProtooClient {
    pub fn new() -> Self {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_timeout,
                next_request_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                writer: Mutex::new(Writer::Buffering(Vec::new())),
                handlers: Mutex::new(Handlers::default()),
                connection: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_on_request(&self, handler: impl Fn(ProtooRequest) + Send + Sync + 'static) {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_request = Some(Arc::new(handler));
    }

    pub fn set_on_notify(&self, handler: impl Fn(ProtooNotification) + Send + Sync + 'static) {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_notify = Some(Arc::new(handler));
    }

    pub fn set_on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_close = Some(Arc::new(handler));
    }

    /// Open the socket and keep it open: reconnects with exponential backoff
    /// (1 s, doubling, capped at 10 s) until `close` is called.
    pub fn connect(&self, url: &str) {
        self.inner.closed.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let url = url.to_owned();
        let task = tokio::spawn(async move { Inner::run(inner, url).await });

        let previous = self
            .inner
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Tear the connection down and fail everything in flight. The client
    /// can `connect` again later.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self
            .inner
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        *self.inner.writer.lock().unwrap_or_else(|e| e.into_inner()) =
            Writer::Buffering(Vec::new());
        self.inner.fail_pending();
        self.inner.notify_close();
    }

    /// Fire-and-forget notification; buffered until the socket is open.
    pub fn notify(&self, method: &str, data: Value) {
        let frame = ProtooNotification::new(method, data).to_json().to_string();
        self.inner.send_or_buffer(frame);
    }

    /// Send a request and await its response (or time out).
    pub async fn request(&self, method: &str, data: Value) -> Result<ProtooResponse, ProtooError> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let frame = ProtooRequest::new(id, method, data).to_json().to_string();

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        self.inner.send_or_buffer(frame);

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The pending entry was dropped by socket loss or close.
            Ok(Err(_)) => Err(ProtooError::Closed),
            Err(_) => {
                self.inner
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(ProtooError::Timeout(method.to_owned()))
            }
        }
    }

    /// Send a response to a server-initiated request. Responses are
    /// reactive: they are never buffered, only sent on a live socket.
    pub fn response(&self, response: ProtooResponse) {
        let frame = response.to_json().to_string();
        let writer = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
        match &*writer {
            Writer::Open(tx) => {
                let _ = tx.send(Message::Text(frame.into()));
            }
            Writer::Buffering(_) => {
                warn!(id = response.id, "dropping response, socket is not open");
            }
        }
    }

    /// Requests awaiting a response right now. Diagnostics only.
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Drop for ProtooClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    async fn run(inner: Arc<Inner>, url: String) {
        let mut delay = RECONNECT_MIN_DELAY;
        loop {
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }

            match Self::connect_once(&inner, &url).await {
                Ok(()) => {
                    // The socket was open and then went away.
                    delay = RECONNECT_MIN_DELAY;
                    inner.fail_pending();
                    inner.notify_close();
                }
                Err(e) => {
                    debug!(url = %url, error = format!("{e:#}"), "protoo connect failed");
                }
            }

            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
    }

    /// One socket lifetime. `Err` means the socket never opened; `Ok` means
    /// it opened and later closed (cleanly or not).
    async fn connect_once(inner: &Arc<Inner>, url: &str) -> anyhow::Result<()> {
        let mut request = url.into_client_request().context("invalid websocket url")?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("protoo"));

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("websocket connect failed")?;
        info!(url, "protoo socket open");
        let (mut ws_tx, mut ws_rx) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        {
            // Swap to the live writer and flush the pre-open buffer in
            // order, all under the one lock so nothing can jump the queue.
            let mut writer = inner.writer.lock().unwrap_or_else(|e| e.into_inner());
            if let Writer::Buffering(buffered) =
                std::mem::replace(&mut *writer, Writer::Open(out_tx.clone()))
            {
                for frame in buffered {
                    let _ = out_tx.send(Message::Text(frame.into()));
                }
            }
        }

        let result = loop {
            tokio::select! {
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => inner.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Err(e)) => break Err(e),
                    Some(Ok(_)) => {}
                },
                outgoing = out_rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = ws_tx.send(message).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        *inner.writer.lock().unwrap_or_else(|e| e.into_inner()) = Writer::Buffering(Vec::new());
        if let Err(e) = result {
            warn!(url, error = %e, "protoo socket error");
        }
        Ok(())
    }

    fn handle_frame(&self, raw: &str) {
        match ProtooMessage::parse(raw) {
            Ok(ProtooMessage::Request(request)) => {
                let handler = self
                    .handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_request
                    .clone();
                match handler {
                    Some(handler) => handler(request),
                    None => debug!(method = %request.method, "request with no handler"),
                }
            }
            Ok(ProtooMessage::Response(response)) => {
                let sender = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&response.id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = response.id, "response for unknown or expired request"),
                }
            }
            Ok(ProtooMessage::Notification(notification)) => {
                let handler = self
                    .handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_notify
                    .clone();
                if let Some(handler) = handler {
                    handler(notification);
                }
            }
            // Objects without a protoo tag (and non-objects) are dropped
            // silently; that is wire-compatible behavior.
            Err(ProtooParseError::NotAnObject | ProtooParseError::UnknownShape) => {}
            Err(e) => warn!(error = %e, "malformed protoo frame"),
        }
    }

    fn send_or_buffer(&self, frame: String) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *writer {
            Writer::Open(tx) => {
                if tx.send(Message::Text(frame.clone().into())).is_err() {
                    // The socket task ended before the writer was swapped
                    // back; keep the frame for the next connection.
                    *writer = Writer::Buffering(vec![frame]);
                }
            }
            Writer::Buffering(buffer) => buffer.push(frame),
        }
    }

    fn fail_pending(&self) {
        let pending = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()),
        );
        // Dropping the senders completes every waiting request with an
        // error on the receiving side.
        drop(pending);
    }

    fn notify_close(&self) {
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_close
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}
