use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::protocol::{Message, MessageKind};

/// What a handler returns: an optional response payload, or a failure message
/// that becomes an error response (for correlated requests) or a log line
/// (for fire-and-forget messages).
pub type HandlerResult = Result<Option<Value>, String>;

/// An async message handler. Handlers are awaited one at a time to preserve
/// delivery order, so they should return promptly and spawn anything
/// long-running; a handler that blocks on a request back to its own peer will
/// deadlock the pump.
type Handler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// State shared between a bridge end's public handle and its pump task.
struct Shared {
    /// Which side this end is, for log lines only.
    side: &'static str,
    /// One handler per message kind. Registering a second handler for a kind
    /// replaces the first.
    handlers: Mutex<HashMap<MessageKind, Handler>>,
    /// Requests awaiting a reply, by correlation id. Dropping a sender here
    /// resolves the waiting `request()` call with `PeerGone`.
    pending: Mutex<HashMap<u64, oneshot::Sender<HandlerResult>>>,
    /// The next correlation id. Ids are per-end; the `reply` marker on
    /// messages is what keeps the two ends' id spaces from colliding.
    next_id: AtomicU64,
    request_timeout: Duration,
    /// Set when the owning handle drops. The pump holds a clone of the
    /// outbound sender (for responses), so without this signal the two pumps
    /// would keep each other's channels open forever.
    closed: Notify,
    is_closed: AtomicBool,
}

/// One end of the bidirectional, single-peer channel between the host and the
/// view. Messages sent from one end are delivered to the other in send order;
/// correlated requests resolve in whatever order the peer answers them.
///
/// Dropping an end tears the connection down: the peer's outstanding requests
/// fail with `PeerGone` and its handlers are cleared.
pub struct BridgeEnd {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl BridgeEnd {
    /// Creates a connected pair of bridge ends, conventionally (host, view).
    /// Each end's receive pump runs as its own task until the peer goes away.
    pub fn pair(config: &BridgeConfig) -> (BridgeEnd, BridgeEnd) {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = mpsc::unbounded_channel();
        let timeout = Duration::from_millis(config.request_timeout_ms);

        let host = Self::construct("host", view_tx, host_rx, timeout);
        let view = Self::construct("view", host_tx, view_rx, timeout);
        (host, view)
    }

    fn construct(
        side: &'static str,
        tx: mpsc::UnboundedSender<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
        request_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            side,
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            request_timeout,
            closed: Notify::new(),
            is_closed: AtomicBool::new(false),
        });
        tokio::spawn(pump(shared.clone(), tx.clone(), rx));
        Self { tx, shared }
    }

    /// Sends a fire-and-forget message. Fails with `NoPeer` if the peer end
    /// has been dropped; that failure is fatal to whatever operation needed
    /// the send, so callers propagate it rather than swallowing it.
    pub fn send(&self, message: Message) -> Result<(), BridgeError> {
        self.tx.send(message).map_err(|_| BridgeError::NoPeer)
    }

    /// Sends a correlated request and waits for the peer's response payload.
    /// Fails with `PeerGone` if the peer disconnects first, `PeerTimeout` if
    /// the response doesn't arrive within the configured deadline, and
    /// `Rejected` if the peer's handler reported an error.
    pub async fn request<T: Serialize>(
        &self,
        kind: MessageKind,
        payload: &T,
    ) -> Result<Option<Value>, BridgeError> {
        let payload = serde_json::to_value(payload).map_err(|err| BridgeError::Payload { err })?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, resp_tx);

        if self.tx.send(Message::request(kind, payload, id)).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(BridgeError::NoPeer);
        }

        match tokio::time::timeout(self.shared.request_timeout, resp_rx).await {
            Err(_) => {
                // Nobody will answer now; make sure a late reply doesn't find
                // a stale entry
                self.shared.pending.lock().remove(&id);
                Err(BridgeError::PeerTimeout {
                    kind: kind.as_str().to_string(),
                    timeout_ms: self.shared.request_timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(BridgeError::PeerGone),
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(message))) => Err(BridgeError::Rejected { message }),
        }
    }

    /// Registers the handler for a message kind, replacing any existing
    /// handler for that kind (re-registration is how a reconnecting component
    /// takes over cleanly, so it's deliberate, not an error).
    pub fn on<F, Fut>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        if self
            .shared
            .handlers
            .lock()
            .insert(kind, handler)
            .is_some()
        {
            debug!(side = self.shared.side, %kind, "replaced existing handler");
        }
    }

    /// Removes the handler for a message kind, returning whether one existed.
    pub fn off(&self, kind: MessageKind) -> bool {
        self.shared.handlers.lock().remove(&kind).is_some()
    }

    /// Whether the peer end is still attached.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl Drop for BridgeEnd {
    fn drop(&mut self) {
        self.shared.is_closed.store(true, Ordering::SeqCst);
        // `notify_one` stores a permit, so this wakes the pump even if it
        // hasn't reached its `select!` yet
        self.shared.closed.notify_one();
        self.shared.pending.lock().clear();
    }
}

/// Receives from the peer and dispatches until the peer goes away. Replies
/// resolve pending requests; everything else is handed to the registered
/// handler for its kind, strictly one at a time so that delivery order is
/// observable order.
async fn pump(
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        if shared.is_closed.load(Ordering::SeqCst) {
            break;
        }
        let message = tokio::select! {
            _ = shared.closed.notified() => break,
            maybe = rx.recv() => match maybe {
                Some(message) => message,
                None => break,
            },
        };
        if message.reply {
            let id = match message.correlation_id {
                Some(id) => id,
                None => {
                    warn!(side = shared.side, "received reply with no correlation id");
                    continue;
                }
            };
            match shared.pending.lock().remove(&id) {
                Some(resp_tx) => {
                    let result = match message.error {
                        Some(err) => Err(err),
                        None => Ok(message.payload),
                    };
                    // If the requester gave up (timeout), there's nobody to
                    // tell, and that's fine
                    let _ = resp_tx.send(result);
                }
                None => debug!(
                    side = shared.side,
                    id, "reply arrived for an abandoned request"
                ),
            }
            continue;
        }

        let handler = shared.handlers.lock().get(&message.kind).cloned();
        let Some(handler) = handler else {
            // Fail closed: an unhandled kind is either a wiring bug or a peer
            // speaking a newer protocol, and neither should be silently
            // half-processed
            warn!(side = shared.side, kind = %message.kind, "no handler for message kind");
            if let Some(id) = message.correlation_id {
                let _ = tx.send(Message::error_response(
                    message.kind,
                    id,
                    format!("no handler registered for '{}'", message.kind),
                ));
            }
            continue;
        };

        let result = handler(message.payload).await;
        match (message.correlation_id, result) {
            (Some(id), Ok(payload)) => {
                let _ = tx.send(Message::response(message.kind, id, payload));
            }
            (Some(id), Err(err)) => {
                warn!(side = shared.side, kind = %message.kind, %err, "handler failed");
                let _ = tx.send(Message::error_response(message.kind, id, err));
            }
            (None, Ok(_)) => {}
            (None, Err(err)) => {
                // Handler failures never terminate the bridge; the next
                // message is still processed
                warn!(side = shared.side, kind = %message.kind, %err, "handler failed");
            }
        }
    }

    // Either the peer is gone or our own handle closed: fail everything
    // still waiting and drop the handlers so their captured state can be
    // reclaimed. Returning also drops our sender clone, which is what lets
    // the peer's pump observe the disconnect.
    debug!(side = shared.side, "tearing down bridge end");
    shared.pending.lock().clear();
    shared.handlers.lock().clear();
}
