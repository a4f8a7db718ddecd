use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bridge::BridgeEnd;
use crate::config::SessionConfig;
use crate::content::FileContent;
use crate::error::SessionError;
use crate::protocol::{
    FileUpdate, Message, MessageKind, ReadFile, SaveComplete, SaveRequest, UpdateReason,
    WatchFailed,
};
use crate::session::{
    ConflictChoice, EditSession, SessionEffect, SessionEvent, SessionState,
};

/// A point-in-time view of a session, for UIs that poll rather than listen.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub path: PathBuf,
    pub state: SessionState,
    pub dirty: bool,
    pub buffer: FileContent,
    pub last_saved: FileContent,
    pub last_external: FileContent,
}

/// Everything the UI layer can observe from the view runtime. The UI is an
/// external collaborator: it gets content and state, and the few moments
/// (buffer replacement, conflict) where it must act.
#[derive(Clone, Debug)]
pub enum UiEvent {
    /// A session came into being, host-initiated. View-initiated opens
    /// already hold the handle and don't get this.
    SessionOpened { path: PathBuf },
    /// The session's state or dirtiness changed.
    StateChanged {
        path: PathBuf,
        state: SessionState,
        dirty: bool,
    },
    /// The buffer was replaced wholesale; the UI should re-render and
    /// restore the cursor position it was holding.
    BufferReplaced { path: PathBuf, content: FileContent },
    /// Both sides of a conflict, for the user to choose between.
    ConflictPresented {
        path: PathBuf,
        local: FileContent,
        external: FileContent,
    },
    /// The host couldn't load initial content; the session is stuck in
    /// `Initializing` until a later `file-update` rescues it.
    LoadFailed { path: PathBuf, message: String },
    /// A save failed terminally. The buffer still holds the unsaved edits.
    SaveFailed { path: PathBuf, message: String },
    /// The bridge peer is unreachable; edits are safe locally but nothing is
    /// reaching the disk.
    Offline { path: PathBuf },
    /// A host-side watch registration died.
    WatchFailed { path: PathBuf, error: String },
    /// Opaque theme payload from the host.
    ThemeChanged(Value),
    /// Opaque session-state payload from the host.
    StateRestore(Value),
}

/// Commands from session handles into the worker.
enum ViewCommand {
    Open {
        path: PathBuf,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    UserEdit {
        path: PathBuf,
        content: FileContent,
    },
    RequestSave {
        path: PathBuf,
    },
    Resolve {
        path: PathBuf,
        choice: ConflictChoice,
    },
    Snapshot {
        path: PathBuf,
        reply: oneshot::Sender<Result<SessionSnapshot, SessionError>>,
    },
    CloseSession {
        path: PathBuf,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Host(HostMsg),
}

/// Messages arriving from the host, already decoded.
enum HostMsg {
    FileUpdate(FileUpdate),
    SaveComplete(SaveComplete),
    WatchFailed(WatchFailed),
    Theme(Value),
    StateRestore(Value),
    /// The outcome of a view-initiated `read-file` for an opening session.
    LoadResult {
        path: PathBuf,
        result: Result<FileContent, String>,
    },
}

/// A cheap, cloneable handle to one open session. This is what the UI calls
/// into; all state lives in the runtime's worker.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    path: PathBuf,
    cmd_tx: mpsc::UnboundedSender<ViewCommand>,
}
impl SessionHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// The user changed the buffer to this content.
    pub fn user_edit(&self, content: FileContent) -> Result<(), SessionError> {
        self.cmd_tx
            .send(ViewCommand::UserEdit {
                path: self.path.clone(),
                content,
            })
            .map_err(|_| SessionError::Closed)
    }
    /// Save now, without waiting for the autosave debounce.
    pub fn request_save(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(ViewCommand::RequestSave {
                path: self.path.clone(),
            })
            .map_err(|_| SessionError::Closed)
    }
    pub fn resolve_conflict(&self, choice: ConflictChoice) -> Result<(), SessionError> {
        self.cmd_tx
            .send(ViewCommand::Resolve {
                path: self.path.clone(),
                choice,
            })
            .map_err(|_| SessionError::Closed)
    }
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ViewCommand::Snapshot {
                path: self.path.clone(),
                reply: tx,
            })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
    /// Closes the session: pending autosave and idle timers are dropped and
    /// the path becomes openable again.
    pub async fn close(self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ViewCommand::CloseSession {
                path: self.path,
                reply: tx,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// The view side of the engine: owns every [`EditSession`] for its bridge
/// connection, drives their timers, and translates between bridge messages
/// and session events. There is exactly one session per path.
pub struct ViewRuntime {
    cmd_tx: mpsc::UnboundedSender<ViewCommand>,
    task: JoinHandle<()>,
}

impl ViewRuntime {
    /// Creates the runtime on the view end of a bridge, returning it along
    /// with the stream of UI events. Registers this side's message handlers;
    /// any previous registrations for those kinds are replaced.
    pub fn new(
        bridge: Arc<BridgeEnd>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();

        register_handlers(&bridge, &cmd_tx);

        let worker = ViewWorker {
            bridge,
            config,
            sessions: HashMap::new(),
            ui_tx,
            cmd_tx: cmd_tx.clone(),
        };
        let task = tokio::spawn(worker.run(cmd_rx));
        (Self { cmd_tx, task }, ui_rx)
    }

    /// Opens a session for the given path. The returned handle is live
    /// immediately; the session itself is `Initializing` until the host's
    /// content arrives.
    pub async fn open(&self, path: impl Into<PathBuf>) -> Result<SessionHandle, SessionError> {
        let path = path.into();
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ViewCommand::Open {
                path: path.clone(),
                reply: tx,
            })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)??;
        Ok(SessionHandle {
            path,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// A handle to an already-open session (e.g. one the host opened).
    pub fn handle(&self, path: impl Into<PathBuf>) -> SessionHandle {
        SessionHandle {
            path: path.into(),
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Shuts the runtime down: every session is closed and this side's
    /// bridge handlers are unregistered.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ViewCommand::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }
        let _ = self.task.await;
    }
}

fn register_handlers(bridge: &BridgeEnd, cmd_tx: &mpsc::UnboundedSender<ViewCommand>) {
    let forward = |cmd_tx: mpsc::UnboundedSender<ViewCommand>,
                   map: fn(Option<Value>) -> Result<HostMsg, String>| {
        move |payload: Option<Value>| {
            let cmd_tx = cmd_tx.clone();
            let mapped = map(payload);
            async move {
                let msg = mapped?;
                cmd_tx
                    .send(ViewCommand::Host(msg))
                    .map_err(|_| "view runtime has shut down".to_string())?;
                Ok(None)
            }
        }
    };

    bridge.on(
        MessageKind::FileUpdate,
        forward(cmd_tx.clone(), |payload| {
            decode::<FileUpdate>(payload).map(HostMsg::FileUpdate)
        }),
    );
    bridge.on(
        MessageKind::SaveComplete,
        forward(cmd_tx.clone(), |payload| {
            decode::<SaveComplete>(payload).map(HostMsg::SaveComplete)
        }),
    );
    bridge.on(
        MessageKind::WatchFailed,
        forward(cmd_tx.clone(), |payload| {
            decode::<WatchFailed>(payload).map(HostMsg::WatchFailed)
        }),
    );
    bridge.on(
        MessageKind::ThemeChanged,
        forward(cmd_tx.clone(), |payload| {
            Ok(HostMsg::Theme(payload.unwrap_or(Value::Null)))
        }),
    );
    bridge.on(
        MessageKind::StateRestore,
        forward(cmd_tx.clone(), |payload| {
            Ok(HostMsg::StateRestore(payload.unwrap_or(Value::Null)))
        }),
    );
}

fn decode<T: for<'de> serde::Deserialize<'de>>(payload: Option<Value>) -> Result<T, String> {
    serde_json::from_value(payload.unwrap_or(Value::Null)).map_err(|err| err.to_string())
}

/// One session plus its two timers. The deadlines live here, outside the
/// pure state machine, which only ever asks for them via effects.
struct SessionDriver {
    session: EditSession,
    autosave_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Autosave,
    EditingIdle,
}

struct ViewWorker {
    bridge: Arc<BridgeEnd>,
    config: SessionConfig,
    sessions: HashMap<PathBuf, SessionDriver>,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
    cmd_tx: mpsc::UnboundedSender<ViewCommand>,
}

impl ViewWorker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ViewCommand>) {
        loop {
            let next_timer = self.next_timer();
            let sleep_at = next_timer.as_ref().map(|(_, _, at)| *at);

            tokio::select! {
                maybe = cmd_rx.recv() => {
                    let Some(cmd) = maybe else { break };
                    match cmd {
                        ViewCommand::Open { path, reply } => {
                            let _ = reply.send(self.open_session(path, true));
                        }
                        ViewCommand::UserEdit { path, content } => {
                            self.apply(&path, SessionEvent::UserEdit { content });
                        }
                        ViewCommand::RequestSave { path } => {
                            self.apply(&path, SessionEvent::SaveRequested);
                        }
                        ViewCommand::Resolve { path, choice } => {
                            self.apply(&path, SessionEvent::ResolveConflict(choice));
                        }
                        ViewCommand::Snapshot { path, reply } => {
                            let _ = reply.send(self.snapshot(&path));
                        }
                        ViewCommand::CloseSession { path, reply } => {
                            self.close_session(&path);
                            let _ = reply.send(());
                        }
                        ViewCommand::Shutdown { reply } => {
                            let paths: Vec<_> = self.sessions.keys().cloned().collect();
                            for path in paths {
                                self.close_session(&path);
                            }
                            self.unregister_handlers();
                            let _ = reply.send(());
                            break;
                        }
                        ViewCommand::Host(msg) => self.handle_host(msg),
                    }
                },
                _ = tokio::time::sleep_until(sleep_at.unwrap_or_else(Instant::now)),
                    if sleep_at.is_some() =>
                {
                    if let Some((path, kind, _)) = next_timer {
                        self.fire_timer(&path, kind);
                    }
                },
            }
        }
        debug!("view runtime worker stopped");
    }

    fn next_timer(&self) -> Option<(PathBuf, TimerKind, Instant)> {
        self.sessions
            .iter()
            .flat_map(|(path, driver)| {
                let autosave = driver
                    .autosave_deadline
                    .map(|at| (path.clone(), TimerKind::Autosave, at));
                let idle = driver
                    .idle_deadline
                    .map(|at| (path.clone(), TimerKind::EditingIdle, at));
                autosave.into_iter().chain(idle)
            })
            .min_by_key(|(_, _, at)| *at)
    }

    fn fire_timer(&mut self, path: &Path, kind: TimerKind) {
        let Some(driver) = self.sessions.get_mut(path) else {
            return;
        };
        let event = match kind {
            TimerKind::Autosave => {
                driver.autosave_deadline = None;
                SessionEvent::SaveRequested
            }
            TimerKind::EditingIdle => {
                driver.idle_deadline = None;
                SessionEvent::EditingIdle
            }
        };
        self.apply(path, event);
    }

    fn open_session(&mut self, path: PathBuf, request_load: bool) -> Result<(), SessionError> {
        if self.sessions.contains_key(&path) {
            return Err(SessionError::AlreadyOpen { path });
        }
        self.sessions.insert(
            path.clone(),
            SessionDriver {
                session: EditSession::new(path.clone()),
                autosave_deadline: None,
                idle_deadline: None,
            },
        );

        if request_load {
            // Ask the host for the initial content; the result comes back
            // through the command channel like any other host message
            let bridge = self.bridge.clone();
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let result = match bridge
                    .request(MessageKind::ReadFile, &ReadFile { path: path.clone() })
                    .await
                {
                    Ok(Some(value)) => {
                        serde_json::from_value::<FileContent>(value).map_err(|err| err.to_string())
                    }
                    Ok(None) => Err("host returned an empty read response".to_string()),
                    Err(err) => Err(err.to_string()),
                };
                let _ = cmd_tx.send(ViewCommand::Host(HostMsg::LoadResult { path, result }));
            });
        }
        Ok(())
    }

    fn close_session(&mut self, path: &Path) {
        if let Some(mut driver) = self.sessions.remove(path) {
            // The Close transition's effects are all timer cancellations,
            // and the timers die with the driver
            let _ = driver.session.apply(SessionEvent::Close);
            debug!(?path, "closed session");
        }
    }

    fn snapshot(&self, path: &Path) -> Result<SessionSnapshot, SessionError> {
        let driver = self
            .sessions
            .get(path)
            .ok_or_else(|| SessionError::Closed)?;
        let session = &driver.session;
        Ok(SessionSnapshot {
            path: path.to_path_buf(),
            state: session.state(),
            dirty: session.dirty(),
            buffer: session.buffer().clone(),
            last_saved: session.last_saved().clone(),
            last_external: session.last_external().clone(),
        })
    }

    fn handle_host(&mut self, msg: HostMsg) {
        match msg {
            HostMsg::FileUpdate(update) => {
                if !self.sessions.contains_key(&update.path) {
                    if update.reason == UpdateReason::InitialLoad {
                        // Host-initiated open: the host decided this path
                        // should be on screen
                        if self.open_session(update.path.clone(), false).is_ok() {
                            let _ = self.ui_tx.send(UiEvent::SessionOpened {
                                path: update.path.clone(),
                            });
                        }
                    } else {
                        debug!(path = ?update.path, "dropped file-update for unknown session");
                        return;
                    }
                }
                if let Some(error) = update.error {
                    let _ = self.ui_tx.send(UiEvent::LoadFailed {
                        path: update.path.clone(),
                        message: error.clone(),
                    });
                    self.apply(
                        &update.path.clone(),
                        SessionEvent::LoadFailed { message: error },
                    );
                } else if let Some(content) = update.content {
                    self.apply(&update.path.clone(), SessionEvent::HostUpdate { content });
                }
            }
            HostMsg::SaveComplete(complete) => {
                if let Some(error) = complete.error {
                    let _ = self.ui_tx.send(UiEvent::SaveFailed {
                        path: complete.path.clone(),
                        message: error.clone(),
                    });
                    self.apply(&complete.path, SessionEvent::SaveFailed { message: error });
                } else {
                    self.apply(
                        &complete.path,
                        SessionEvent::SaveCompleted {
                            content: complete.content,
                        },
                    );
                }
            }
            HostMsg::WatchFailed(failed) => {
                let _ = self.ui_tx.send(UiEvent::WatchFailed {
                    path: failed.path,
                    error: failed.error,
                });
            }
            HostMsg::Theme(payload) => {
                let _ = self.ui_tx.send(UiEvent::ThemeChanged(payload));
            }
            HostMsg::StateRestore(payload) => {
                let _ = self.ui_tx.send(UiEvent::StateRestore(payload));
            }
            HostMsg::LoadResult { path, result } => match result {
                Ok(content) => self.apply(&path, SessionEvent::HostUpdate { content }),
                Err(message) => {
                    let _ = self.ui_tx.send(UiEvent::LoadFailed {
                        path: path.clone(),
                        message: message.clone(),
                    });
                    self.apply(&path, SessionEvent::LoadFailed { message });
                }
            },
        }
    }

    /// Applies one event to one session and carries out the effects. This is
    /// the single funnel between the pure machine and the messy world.
    fn apply(&mut self, path: &Path, event: SessionEvent) {
        let Some(driver) = self.sessions.get_mut(path) else {
            debug!(?path, "event for unknown session");
            return;
        };
        let before = (driver.session.state(), driver.session.dirty());
        let effects = driver.session.apply(event);
        let now = Instant::now();

        for effect in effects {
            match effect {
                SessionEffect::ScheduleAutosave => {
                    driver.autosave_deadline =
                        Some(now + Duration::from_millis(self.config.autosave_debounce_ms));
                }
                SessionEffect::CancelAutosave => {
                    driver.autosave_deadline = None;
                }
                SessionEffect::StartEditingIdle => {
                    driver.idle_deadline =
                        Some(now + Duration::from_millis(self.config.editing_idle_ms));
                }
                SessionEffect::SendSaveRequest { content } => {
                    let request = SaveRequest {
                        path: path.to_path_buf(),
                        content: content.clone(),
                    };
                    let send = Message::event(MessageKind::SaveRequest, &request)
                        .map(|message| self.bridge.send(message));
                    match send {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => {
                            // The host is unreachable; the buffer stays
                            // intact and the session falls back to dirty.
                            // Feeding the failure back through the command
                            // channel keeps effect handling in one place
                            warn!(?path, "couldn't reach host for save");
                            let _ = self.ui_tx.send(UiEvent::Offline {
                                path: path.to_path_buf(),
                            });
                            let _ = self.cmd_tx.send(ViewCommand::Host(HostMsg::SaveComplete(
                                SaveComplete {
                                    path: path.to_path_buf(),
                                    content,
                                    bytes_written: 0,
                                    error: Some("bridge peer unavailable".to_string()),
                                },
                            )));
                        }
                    }
                }
                SessionEffect::BufferReplaced { content } => {
                    let _ = self.ui_tx.send(UiEvent::BufferReplaced {
                        path: path.to_path_buf(),
                        content,
                    });
                }
                SessionEffect::ConflictPresented { local, external } => {
                    let _ = self.ui_tx.send(UiEvent::ConflictPresented {
                        path: path.to_path_buf(),
                        local,
                        external,
                    });
                }
            }
        }

        let after = (driver.session.state(), driver.session.dirty());
        if before != after {
            let _ = self.ui_tx.send(UiEvent::StateChanged {
                path: path.to_path_buf(),
                state: after.0,
                dirty: after.1,
            });
        }
    }

    fn unregister_handlers(&self) {
        for kind in [
            MessageKind::FileUpdate,
            MessageKind::SaveComplete,
            MessageKind::WatchFailed,
            MessageKind::ThemeChanged,
            MessageKind::StateRestore,
        ] {
            self.bridge.off(kind);
        }
    }
}
