use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AutosaveConfig;
use crate::content::{now_ms, FileContent, FileMetadata};
use crate::debouncer::InternalWriteTags;
use crate::diagnostics::{DiagnosticMessage, DiagnosticsSink, FileReport};
use crate::file_ops::{backup_path_for, FileOps, ReadOptions, WriteOptions};

/// The longest a back-pressure-stretched debounce window is allowed to get.
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Options for one scheduled save.
#[derive(Clone, Debug, Default)]
pub struct SaveOptions {
    /// Overrides the configured backup behaviour for this save; `None`
    /// inherits the queue's config.
    pub backup: Option<bool>,
    /// Create missing parent directories before writing. Wanted when the
    /// save is creating a brand-new file.
    pub create_dirs: bool,
    /// Skip the debounce window and write as soon as the path is free of any
    /// in-flight write. Used for explicit writes that have already been
    /// debounced (or never should be).
    pub immediate: bool,
}

/// How one scheduled save ended. `Superseded` and `Cancelled` are normal
/// lifecycle outcomes, not failures: newer content took this submission's
/// place, or the caller withdrew it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Written { bytes: u64 },
    Superseded,
    Cancelled,
    Failed { message: String },
}

/// The future half of a scheduled save. Resolves when that specific
/// submission completes, is superseded, or is cancelled.
pub struct SaveTicket {
    rx: oneshot::Receiver<SaveOutcome>,
}
impl SaveTicket {
    pub async fn outcome(self) -> SaveOutcome {
        // A dropped sender means the queue went away with the save still
        // pending, which is a cancellation from the caller's point of view
        self.rx.await.unwrap_or(SaveOutcome::Cancelled)
    }
}

enum Command {
    Schedule {
        path: PathBuf,
        content: FileContent,
        options: SaveOptions,
        ticket: oneshot::Sender<SaveOutcome>,
    },
    Cancel {
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    FlushAll {
        reply: oneshot::Sender<Vec<(PathBuf, SaveOutcome)>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct WriteDone {
    path: PathBuf,
}

/// A save waiting for its moment. `deadline` is `None` while the entry is
/// parked behind an in-flight write for the same path; it gets a real
/// deadline once that write completes.
struct PendingSave {
    content: FileContent,
    options: SaveOptions,
    deadline: Option<Instant>,
    waiters: Vec<oneshot::Sender<SaveOutcome>>,
}

/// Per-path back-pressure state. When content for a path is superseded three
/// or more times within one pending window, the window doubles (capped);
/// after a write that saw no supersessions, it decays back to the configured
/// base. This dampens runaway schedule/supersede cycles under rapid
/// programmatic edits.
struct PathBackoff {
    window: Duration,
    supersessions: u32,
}

/// The per-path debounced writer for the host side. Coalesces rapid
/// schedules into at most one disk write per window, serializes writes per
/// path, retries transient failures with linear backoff, optionally backs up
/// the previous content, and tags every write so the event debouncer can
/// tell our writes from the world's.
///
/// All state lives in a single worker task; this handle just sends commands.
pub struct AutosaveQueue {
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AutosaveQueue {
    pub fn new(
        config: AutosaveConfig,
        file_ops: Arc<FileOps>,
        tags: Arc<InternalWriteTags>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            config,
            file_ops,
            tags,
            diagnostics,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            backoff: HashMap::new(),
        };
        let task = tokio::spawn(worker.run(cmd_rx));
        Self {
            cmd_tx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Schedules content to be written to a path after the debounce window,
    /// replacing any not-yet-written content previously scheduled for it
    /// (whose ticket resolves `Superseded`). The returned ticket resolves
    /// when this specific submission is done, one way or another.
    pub fn schedule(
        &self,
        path: impl Into<PathBuf>,
        content: FileContent,
        options: SaveOptions,
    ) -> SaveTicket {
        let (tx, rx) = oneshot::channel();
        // If the queue has shut down, the dropped sender resolves the ticket
        // as cancelled, which is the honest answer
        let _ = self.cmd_tx.send(Command::Schedule {
            path: path.into(),
            content,
            options,
            ticket: tx,
        });
        SaveTicket { rx }
    }

    /// Cancels any pending (unwritten) save for the path, returning whether
    /// one existed. A write that has already started is not aborted; it runs
    /// to completion.
    pub async fn cancel(&self, path: &Path) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Cancel {
                path: path.to_path_buf(),
                reply: tx,
            })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Immediately performs every pending write and returns their outcomes.
    pub async fn flush_all(&self) -> Vec<(PathBuf, SaveOutcome)> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::FlushAll { reply: tx }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Shuts the queue down: pending timers are cancelled (their tickets
    /// resolve `Cancelled`) and in-flight writes are awaited to completion,
    /// so the internal-write tag lifecycle stays consistent. Idempotent;
    /// later calls (and all other operations) become no-ops.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { reply: tx }).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Worker {
    config: AutosaveConfig,
    file_ops: Arc<FileOps>,
    tags: Arc<InternalWriteTags>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    pending: HashMap<PathBuf, PendingSave>,
    in_flight: HashSet<PathBuf>,
    backoff: HashMap<PathBuf, PathBackoff>,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<WriteDone>();
        let mut close_reply: Option<oneshot::Sender<()>> = None;
        let mut closing = false;

        loop {
            if closing && self.in_flight.is_empty() {
                break;
            }
            let next_deadline = self
                .pending
                .values()
                .filter_map(|pending| pending.deadline)
                .min();

            tokio::select! {
                maybe = cmd_rx.recv(), if !closing => {
                    match maybe {
                        Some(Command::Schedule { path, content, options, ticket }) => {
                            self.handle_schedule(path, content, options, ticket);
                        }
                        Some(Command::Cancel { path, reply }) => {
                            let _ = reply.send(self.handle_cancel(&path));
                        }
                        Some(Command::FlushAll { reply }) => {
                            self.handle_flush_all(reply);
                        }
                        Some(Command::Close { reply }) => {
                            close_reply = Some(reply);
                            closing = true;
                            self.cancel_all_pending();
                        }
                        // Handle dropped without an explicit close: same
                        // drill, nobody to tell
                        None => {
                            closing = true;
                            self.cancel_all_pending();
                        }
                    }
                },
                Some(done) = done_rx.recv() => {
                    self.handle_done(done);
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                    if next_deadline.is_some() =>
                {
                    self.fire_due(&done_tx);
                },
            }
        }

        if let Some(reply) = close_reply {
            let _ = reply.send(());
        }
        debug!("autosave queue worker stopped");
    }

    fn handle_schedule(
        &mut self,
        path: PathBuf,
        content: FileContent,
        options: SaveOptions,
        ticket: oneshot::Sender<SaveOutcome>,
    ) {
        let superseded = self.pending.remove(&path);
        let base = Duration::from_millis(self.config.debounce_ms);
        let backoff = self.backoff.entry(path.clone()).or_insert(PathBackoff {
            window: base,
            supersessions: 0,
        });

        if let Some(prev) = superseded {
            for waiter in prev.waiters {
                let _ = waiter.send(SaveOutcome::Superseded);
            }
            backoff.supersessions += 1;
            if backoff.supersessions % 3 == 0 && backoff.window < BACKOFF_CAP {
                backoff.window = (backoff.window * 2).min(BACKOFF_CAP);
                warn!(
                    ?path,
                    supersessions = backoff.supersessions,
                    window_ms = backoff.window.as_millis() as u64,
                    "schedules are outpacing writes, stretching debounce window"
                );
            }
            debug!(?path, "superseded pending save");
        }

        let deadline = if self.in_flight.contains(&path) {
            // Parked: the in-flight write finishes first, then this entry's
            // own window starts
            None
        } else if options.immediate {
            Some(Instant::now())
        } else {
            Some(Instant::now() + backoff.window)
        };

        self.pending.insert(
            path,
            PendingSave {
                content,
                options,
                deadline,
                waiters: vec![ticket],
            },
        );
    }

    fn handle_cancel(&mut self, path: &Path) -> bool {
        match self.pending.remove(path) {
            Some(pending) => {
                for waiter in pending.waiters {
                    let _ = waiter.send(SaveOutcome::Cancelled);
                }
                debug!(?path, "cancelled pending save");
                true
            }
            None => false,
        }
    }

    fn handle_flush_all(&mut self, reply: oneshot::Sender<Vec<(PathBuf, SaveOutcome)>>) {
        let mut observers = Vec::new();
        for (path, pending) in self.pending.iter_mut() {
            let (tx, rx) = oneshot::channel();
            pending.waiters.push(tx);
            observers.push((path.clone(), rx));
            match pending.deadline {
                Some(_) => pending.deadline = Some(Instant::now()),
                // Parked entries can't fire yet; make them fire the moment
                // their path frees up
                None => pending.options.immediate = true,
            }
        }
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(observers.len());
            for (path, rx) in observers {
                results.push((path, rx.await.unwrap_or(SaveOutcome::Cancelled)));
            }
            let _ = reply.send(results);
        });
    }

    fn cancel_all_pending(&mut self) {
        for (path, pending) in self.pending.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(SaveOutcome::Cancelled);
            }
            debug!(?path, "cancelled pending save at close");
        }
    }

    fn fire_due(&mut self, done_tx: &mpsc::UnboundedSender<WriteDone>) {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(path, pending)| {
                pending.deadline.map_or(false, |deadline| deadline <= now)
                    && !self.in_flight.contains(*path)
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            let Some(pending) = self.pending.remove(&path) else {
                continue;
            };
            self.in_flight.insert(path.clone());
            if let Some(backoff) = self.backoff.get_mut(&path) {
                backoff.supersessions = 0;
            }

            let write = WriteJob {
                config: self.config.clone(),
                file_ops: self.file_ops.clone(),
                tags: self.tags.clone(),
                diagnostics: self.diagnostics.clone(),
                path,
                content: pending.content,
                options: pending.options,
                waiters: pending.waiters,
            };
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                write.run(done_tx).await;
            });
        }
    }

    fn handle_done(&mut self, done: WriteDone) {
        self.in_flight.remove(&done.path);

        if let Some(backoff) = self.backoff.get_mut(&done.path) {
            // A quiet write (no supersessions while it was pending or in
            // flight) lets the window decay back to its configured base
            if backoff.supersessions == 0 {
                backoff.window = Duration::from_millis(self.config.debounce_ms);
            }
        }

        // A schedule that landed during the write has been waiting for its
        // turn; start its window now
        if let Some(parked) = self.pending.get_mut(&done.path) {
            if parked.deadline.is_none() {
                let window = if parked.options.immediate {
                    Duration::ZERO
                } else {
                    self.backoff
                        .get(&done.path)
                        .map(|backoff| backoff.window)
                        .unwrap_or(Duration::from_millis(self.config.debounce_ms))
                };
                parked.deadline = Some(Instant::now() + window);
            }
        }
    }
}

/// One write, executed off the worker loop so writes to other paths aren't
/// held up. Per-path serialization is the worker's `in_flight` set; by
/// construction at most one `WriteJob` exists per path at a time.
struct WriteJob {
    config: AutosaveConfig,
    file_ops: Arc<FileOps>,
    tags: Arc<InternalWriteTags>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    path: PathBuf,
    content: FileContent,
    options: SaveOptions,
    waiters: Vec<oneshot::Sender<SaveOutcome>>,
}

impl WriteJob {
    async fn run(self, done_tx: mpsc::UnboundedSender<WriteDone>) {
        let started = Instant::now();

        if self.options.backup.unwrap_or(self.config.backup) {
            self.write_backup().await;
        }

        let write_options = WriteOptions {
            create_dirs: self.options.create_dirs,
            validate: None,
        };

        let mut failures = 0u32;
        let outcome = loop {
            // The tag goes in *before* the write so the filesystem event it
            // causes can never race ahead of it. Re-inserting on retry just
            // refreshes the expiry.
            if self.config.flag_internal_writes {
                self.tags.insert(&self.path);
            }

            match self.file_ops.write(&self.path, &self.content, &write_options).await {
                Ok(bytes) => {
                    let metadata = FileMetadata::derive(&self.content, &self.path, now_ms());
                    let elapsed = started.elapsed().as_millis() as u64;
                    self.diagnostics.report(
                        &self.path,
                        FileReport::stats(metadata).with_timing("autosave", elapsed),
                    );
                    info!(path = ?self.path, bytes, "autosave write succeeded");
                    break SaveOutcome::Written { bytes };
                }
                Err(err) => {
                    failures += 1;
                    if !err.is_retryable() || failures > self.config.max_retries {
                        self.diagnostics.report(
                            &self.path,
                            FileReport::problem(DiagnosticMessage::error(format!(
                                "autosave failed after {failures} attempt(s): {err}"
                            ))),
                        );
                        error!(path = ?self.path, %err, failures, "autosave write failed");
                        break SaveOutcome::Failed {
                            message: err.to_string(),
                        };
                    }
                    self.diagnostics.report(
                        &self.path,
                        FileReport::problem(DiagnosticMessage::warning(format!(
                            "autosave attempt {failures} failed: {err}"
                        ))),
                    );
                    warn!(path = ?self.path, %err, attempt = failures, "autosave write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * failures as u64)).await;
                }
            }
        };

        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
        let _ = done_tx.send(WriteDone { path: self.path });
    }

    /// Copies the path's current content to a timestamped sibling before the
    /// primary write. Backup failure is logged but never aborts the write:
    /// persisting the user's latest content matters more than archiving the
    /// previous version.
    async fn write_backup(&self) {
        if !self.file_ops.exists(&self.path).await {
            return;
        }
        match self.file_ops.read(&self.path, &ReadOptions::default()).await {
            Ok((current, _)) => {
                let backup_path = backup_path_for(&self.path);
                match self
                    .file_ops
                    .write(&backup_path, &current, &WriteOptions::default())
                    .await
                {
                    Ok(_) => debug!(?backup_path, "wrote backup"),
                    Err(err) => warn!(path = ?self.path, %err, "backup write failed"),
                }
            }
            Err(err) => warn!(path = ?self.path, %err, "couldn't read current content for backup"),
        }
    }
}
