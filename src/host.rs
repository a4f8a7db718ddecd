use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::autosave::{AutosaveQueue, SaveOptions, SaveOutcome};
use crate::bridge::BridgeEnd;
use crate::config::{Config, DebouncerConfig};
use crate::content::FileContent;
use crate::debouncer::{EventDebouncer, InternalWriteTags};
use crate::diagnostics::{DiagnosticMessage, DiagnosticsSink, FileReport};
use crate::error::{BridgeError, FileOpsError, WatchError};
use crate::file_ops::{FileOps, ReadOptions};
use crate::protocol::{
    FileChangeExternal, FileUpdate, Message, MessageKind, ReadFile, SaveComplete, SaveRequest,
    UpdateReason, WatchFailed, WriteFile,
};
use crate::watcher::{ChangeKind, PathWatcher, WatchEvent, WatchGuard, WatchRegistration, WatcherSignal};

/// The root of the host side. Owns the file operations layer, the autosave
/// queue, the internal-write tag set, and the host end of the bridge, and
/// wires filesystem watches through the debouncer to the view. Everything is
/// constructed here and injected downward; no component reaches for a global.
pub struct HostEngine {
    config: Config,
    file_ops: Arc<FileOps>,
    tags: Arc<InternalWriteTags>,
    autosave: AutosaveQueue,
    diagnostics: Arc<dyn DiagnosticsSink>,
    bridge: Arc<BridgeEnd>,
}

impl HostEngine {
    /// Builds the engine on the host end of a bridge and registers its
    /// message handlers (`save-request`, `read-file`, `write-file`).
    pub fn new(
        config: Config,
        bridge: Arc<BridgeEnd>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Arc<Self> {
        let file_ops = Arc::new(FileOps::new(config.file_ops.clone()));
        let tags = Arc::new(InternalWriteTags::new(Duration::from_millis(
            config.autosave.tag_expiry_ms,
        )));
        let autosave = AutosaveQueue::new(
            config.autosave.clone(),
            file_ops.clone(),
            tags.clone(),
            diagnostics.clone(),
        );

        let engine = Arc::new(Self {
            config,
            file_ops,
            tags,
            autosave,
            diagnostics,
            bridge,
        });
        engine.register_handlers();
        engine
    }

    /// The file operations layer, for host-side collaborators that need disk
    /// access and must go through the same limits the engine does.
    pub fn file_ops(&self) -> &Arc<FileOps> {
        &self.file_ops
    }
    pub fn tags(&self) -> &Arc<InternalWriteTags> {
        &self.tags
    }
    pub(crate) fn bridge(&self) -> &Arc<BridgeEnd> {
        &self.bridge
    }

    /// Opens a path into the view: reads it and pushes a `file-update` with
    /// reason `initial-load`. A file that doesn't exist yet yields empty
    /// content (the first save will create it); an unreadable one yields an
    /// error update so the view knows why its session can't start.
    pub async fn open(&self, path: &Path) -> Result<(), BridgeError> {
        let update = match self.file_ops.read(path, &ReadOptions::default()).await {
            Ok((content, metadata)) => {
                self.diagnostics.report(path, FileReport::stats(metadata));
                FileUpdate {
                    path: path.to_path_buf(),
                    content: Some(content),
                    reason: UpdateReason::InitialLoad,
                    error: None,
                }
            }
            Err(FileOpsError::NotFound { .. }) => FileUpdate {
                path: path.to_path_buf(),
                content: Some(FileContent::empty()),
                reason: UpdateReason::InitialLoad,
                error: None,
            },
            Err(err) => {
                self.diagnostics.report(
                    path,
                    FileReport::problem(DiagnosticMessage::error(err.to_string())),
                );
                FileUpdate {
                    path: path.to_path_buf(),
                    content: None,
                    reason: UpdateReason::InitialLoad,
                    error: Some(err.to_string()),
                }
            }
        };
        self.bridge
            .send(Message::event(MessageKind::FileUpdate, &update)?)
    }

    /// Starts watching per the registration, forwarding debounced external
    /// changes to the view as `file-change-external` (followed by a
    /// `file-update` with fresh content for non-delete changes). Returns the
    /// handle whose drop ends the watch; the engine deliberately doesn't
    /// keep it.
    pub fn watch(self: &Arc<Self>, registration: WatchRegistration) -> Result<WatchHandle, WatchError> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let guard = PathWatcher::spawn(&registration, signal_tx)?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (debounced_tx, debounced_rx) = mpsc::unbounded_channel();
        let debouncer_config = DebouncerConfig {
            debounce_ms: registration
                .debounce_ms
                .unwrap_or(self.config.debouncer.debounce_ms),
        };
        let debounce_task = EventDebouncer::spawn(
            &debouncer_config,
            self.tags.clone(),
            raw_rx,
            debounced_tx,
        );

        let engine = self.clone();
        let root = guard.root().to_path_buf();
        let forward_task = tokio::spawn(forward_changes(engine, root, signal_rx, raw_tx, debounced_rx));

        info!(root = ?guard.root(), pattern = %registration.pattern, "watch registered");
        Ok(WatchHandle {
            _guard: guard,
            tasks: vec![debounce_task, forward_task],
        })
    }

    /// Shuts the host side down: the autosave queue cancels its timers and
    /// finishes in-flight writes. Watches are owned by their handles and end
    /// when those drop.
    pub async fn shutdown(&self) {
        self.autosave.close().await;
    }

    /// Flushes every pending autosave immediately, returning the outcomes.
    pub async fn flush_saves(&self) -> Vec<(PathBuf, SaveOutcome)> {
        self.autosave.flush_all().await
    }

    fn register_handlers(self: &Arc<Self>) {
        // save-request: fire-and-forget from the view. Scheduling is
        // instant; the outcome comes back later as a save-complete message,
        // off the pump so slow disks don't stall message delivery
        let engine = self.clone();
        self.bridge.on(MessageKind::SaveRequest, move |payload| {
            let engine = engine.clone();
            async move {
                let request: SaveRequest = decode(payload)?;
                let ticket = engine.autosave.schedule(
                    request.path.clone(),
                    request.content.clone(),
                    SaveOptions {
                        create_dirs: true,
                        ..SaveOptions::default()
                    },
                );
                tokio::spawn(async move {
                    let complete = match ticket.outcome().await {
                        SaveOutcome::Written { bytes } => SaveComplete {
                            path: request.path,
                            content: request.content,
                            bytes_written: bytes,
                            error: None,
                        },
                        // The superseding save will report for this path;
                        // saying anything now would just confuse the session
                        SaveOutcome::Superseded | SaveOutcome::Cancelled => return,
                        SaveOutcome::Failed { message } => SaveComplete {
                            path: request.path,
                            content: request.content,
                            bytes_written: 0,
                            error: Some(message),
                        },
                    };
                    let send = Message::event(MessageKind::SaveComplete, &complete)
                        .map(|message| engine.bridge.send(message));
                    if !matches!(send, Ok(Ok(()))) {
                        warn!(path = ?complete.path, "couldn't deliver save completion to view");
                    }
                });
                Ok(None)
            }
        });

        // read-file: correlated request, response is the content. An absent
        // file answers with empty content: that's the initial-load path for
        // documents that don't exist yet
        let engine = self.clone();
        self.bridge.on(MessageKind::ReadFile, move |payload| {
            let engine = engine.clone();
            async move {
                let request: ReadFile = decode(payload)?;
                match engine.file_ops.read(&request.path, &ReadOptions::default()).await {
                    Ok((content, metadata)) => {
                        engine
                            .diagnostics
                            .report(&request.path, FileReport::stats(metadata));
                        encode(&content).map(Some)
                    }
                    Err(FileOpsError::NotFound { .. }) => encode(&FileContent::empty()).map(Some),
                    Err(err) => Err(err.to_string()),
                }
            }
        });

        // write-file: correlated request, response is bytes written. Routed
        // through the autosave queue (immediate, no debounce) so the
        // one-write-in-flight-per-path guarantee covers it and the write
        // gets tagged like any of ours
        let engine = self.clone();
        self.bridge.on(MessageKind::WriteFile, move |payload| {
            let engine = engine.clone();
            async move {
                let request: WriteFile = decode(payload)?;
                let ticket = engine.autosave.schedule(
                    request.path,
                    request.content,
                    SaveOptions {
                        immediate: true,
                        backup: Some(false),
                        ..SaveOptions::default()
                    },
                );
                match ticket.outcome().await {
                    SaveOutcome::Written { bytes } => encode(&bytes).map(Some),
                    SaveOutcome::Superseded => Err("write superseded by a newer one".to_string()),
                    SaveOutcome::Cancelled => Err("write cancelled".to_string()),
                    SaveOutcome::Failed { message } => Err(message),
                }
            }
        });
    }
}

/// A running watch registration: the OS watcher plus the debounce and
/// forwarding tasks behind it. Dropping this stops all three.
pub struct WatchHandle {
    _guard: WatchGuard,
    tasks: Vec<JoinHandle<()>>,
}
impl WatchHandle {
    /// Stops the watch. Equivalent to dropping the handle.
    pub fn dispose(self) {}
}
impl Drop for WatchHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Routes raw watcher signals into the debouncer and debounced events out to
/// the view, until either side of the pipeline closes.
async fn forward_changes(
    engine: Arc<HostEngine>,
    root: PathBuf,
    mut signal_rx: mpsc::UnboundedReceiver<WatcherSignal>,
    raw_tx: mpsc::UnboundedSender<WatchEvent>,
    mut debounced_rx: mpsc::UnboundedReceiver<WatchEvent>,
) {
    loop {
        tokio::select! {
            signal = signal_rx.recv() => match signal {
                Some(WatcherSignal::Event(event)) => {
                    if raw_tx.send(event).is_err() {
                        break;
                    }
                }
                Some(WatcherSignal::Failed { error }) => {
                    engine.on_watch_failed(&root, error);
                    break;
                }
                None => break,
            },
            event = debounced_rx.recv() => match event {
                Some(event) => engine.forward_external(event).await,
                None => break,
            },
        }
    }
    debug!(?root, "watch forwarding stopped");
}

impl HostEngine {
    /// Sends one debounced external change to the view: the change
    /// notification itself, then (for anything still readable) a
    /// `file-update` carrying the new content.
    async fn forward_external(&self, event: WatchEvent) {
        let change = FileChangeExternal {
            path: event.path.clone(),
            change_type: event.kind,
        };
        let sent = Message::event(MessageKind::FileChangeExternal, &change)
            .map(|message| self.bridge.send(message));
        if !matches!(sent, Ok(Ok(()))) {
            debug!(path = ?event.path, "view unavailable for external change");
            return;
        }
        info!(path = ?event.path, kind = ?event.kind, "forwarded external change");

        if event.kind == ChangeKind::Delete {
            return;
        }

        let update = match self.file_ops.read(&event.path, &ReadOptions::default()).await {
            Ok((content, metadata)) => {
                self.diagnostics
                    .report(&event.path, FileReport::stats(metadata));
                FileUpdate {
                    path: event.path.clone(),
                    content: Some(content),
                    reason: UpdateReason::ExternalChange,
                    error: None,
                }
            }
            // The file came and went between the event and our read; the
            // delete event behind it is on its way
            Err(FileOpsError::NotFound { .. }) => return,
            Err(err) => {
                self.diagnostics.report(
                    &event.path,
                    FileReport::problem(DiagnosticMessage::error(err.to_string())),
                );
                FileUpdate {
                    path: event.path.clone(),
                    content: None,
                    reason: UpdateReason::ExternalChange,
                    error: Some(err.to_string()),
                }
            }
        };
        let sent = Message::event(MessageKind::FileUpdate, &update)
            .map(|message| self.bridge.send(message));
        if !matches!(sent, Ok(Ok(()))) {
            debug!(path = ?event.path, "view unavailable for file update");
        }
    }

    fn on_watch_failed(&self, root: &Path, error: String) {
        error!(?root, %error, "watch registration failed persistently");
        self.diagnostics.report(
            root,
            FileReport::problem(DiagnosticMessage::error(format!("watch failed: {error}"))),
        );
        let failed = WatchFailed {
            path: root.to_path_buf(),
            error,
        };
        let sent = Message::event(MessageKind::WatchFailed, &failed)
            .map(|message| self.bridge.send(message));
        if !matches!(sent, Ok(Ok(()))) {
            debug!(?root, "view unavailable for watch failure");
        }
    }
}

fn decode<T: for<'de> serde::Deserialize<'de>>(payload: Option<Value>) -> Result<T, String> {
    serde_json::from_value(payload.unwrap_or(Value::Null)).map_err(|err| err.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|err| err.to_string())
}
