use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::DebouncerConfig;
use crate::watcher::{ChangeKind, WatchEvent};

/// The set of paths the engine has just written to itself. The autosave queue
/// inserts a tag immediately before each write; the debouncer consumes the
/// tag when the corresponding filesystem event comes back around, and drops
/// the event instead of reporting a change nobody external made. This is the
/// mechanism that breaks the save → watch → reload → save feedback loop.
///
/// Only the autosave queue inserts and only the debouncer consumes; there is
/// no third party, which is why a plain mutex-wrapped map is enough.
///
/// Tags expire on their own if no matching event ever arrives (the OS may
/// coalesce our write into an event we never see as distinct). An expired tag
/// suppresses nothing: the failure direction is a spurious external-change
/// notification, not a swallowed real one.
pub struct InternalWriteTags {
    inner: Mutex<HashMap<PathBuf, Instant>>,
    expiry: Duration,
}

impl InternalWriteTags {
    pub fn new(expiry: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    /// Tags a path as about-to-be-written-by-us. Re-tagging refreshes the
    /// expiry.
    pub fn insert(&self, path: &Path) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        // Keep expired entries from accumulating for paths that never
        // produce an event
        inner.retain(|_, expires| *expires > now);
        inner.insert(path.to_path_buf(), now + self.expiry);
        debug!(?path, "tagged internal write");
    }

    /// Takes the tag for a path if a live one exists. Expired tags are
    /// removed but don't count.
    pub fn consume(&self, path: &Path) -> bool {
        match self.inner.lock().remove(path) {
            Some(expires) if Instant::now() < expires => true,
            Some(_) => {
                debug!(?path, "internal-write tag had already expired");
                false
            }
            None => false,
        }
    }

    /// How many live tags exist right now.
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .values()
            .filter(|expires| **expires > now)
            .count()
    }
}

/// Coalesces raw watch events and suppresses echoes of the engine's own
/// writes.
///
/// Coalescing is keyed by `(kind, path)`, not just path: a burst of modify
/// events for one file must collapse to a single notification, but a delete
/// arriving on the heels of a modify is new information and still has to be
/// reported.
///
/// Failures downstream of the emitted events are the consumer's problem; the
/// debouncer keeps processing whatever arrives next. It stops only when one
/// of its channels closes.
pub struct EventDebouncer;

impl EventDebouncer {
    /// Spawns the debounce loop reading raw events from `rx` and emitting
    /// coalesced events on `tx`. A window of zero disables coalescing and
    /// forwards every event as it arrives.
    pub fn spawn(
        config: &DebouncerConfig,
        tags: Arc<InternalWriteTags>,
        rx: mpsc::UnboundedReceiver<WatchEvent>,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> JoinHandle<()> {
        let window = Duration::from_millis(config.debounce_ms);
        tokio::spawn(run(window, tags, rx, tx))
    }
}

async fn run(
    window: Duration,
    tags: Arc<InternalWriteTags>,
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    tx: mpsc::UnboundedSender<WatchEvent>,
) {
    // Pending events by (kind, path), each with the deadline at which it
    // fires. Every new arrival for a key resets the deadline and replaces
    // the stored event.
    let mut pending: HashMap<(ChangeKind, PathBuf), (WatchEvent, Instant)> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|(_, deadline)| *deadline).min();

        tokio::select! {
            maybe = rx.recv() => {
                let Some(event) = maybe else {
                    // Upstream is gone; flush anything still pending so no
                    // observed change is silently lost, then stop
                    flush_due(&mut pending, &tx, None);
                    break;
                };

                if tags.consume(&event.path) {
                    // On modification (what we expect), block the event;
                    // anything else getting here means the OS gave us a
                    // surprising sequence, but a tag always drops the first
                    // event on its path regardless
                    if event.kind == ChangeKind::Modify {
                        debug!(path = ?event.path, "suppressed echo of internal write");
                    } else {
                        warn!(path = ?event.path, kind = ?event.kind, "consumed internal-write tag on a non-modify event");
                    }
                    continue;
                }

                if window.is_zero() {
                    if tx.send(event).is_err() {
                        break;
                    }
                    continue;
                }

                let deadline = Instant::now() + window;
                pending.insert((event.kind, event.path.clone()), (event, deadline));
            },
            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() =>
            {
                if !flush_due(&mut pending, &tx, Some(Instant::now())) {
                    break;
                }
            },
        }
    }
}

/// Emits every pending event whose deadline has passed (or all of them, when
/// `now` is `None`), earliest deadline first. Returns false once the
/// downstream receiver is gone.
fn flush_due(
    pending: &mut HashMap<(ChangeKind, PathBuf), (WatchEvent, Instant)>,
    tx: &mpsc::UnboundedSender<WatchEvent>,
    now: Option<Instant>,
) -> bool {
    let mut due: Vec<_> = pending
        .iter()
        .filter(|(_, (_, deadline))| now.map_or(true, |now| *deadline <= now))
        .map(|(key, (_, deadline))| (key.clone(), *deadline))
        .collect();
    due.sort_by_key(|(_, deadline)| *deadline);

    for (key, _) in due {
        if let Some((event, _)) = pending.remove(&key) {
            if tx.send(event).is_err() {
                return false;
            }
        }
    }
    true
}
