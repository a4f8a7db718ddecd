use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use notify::{
    event::{CreateKind, ModifyKind, RenameMode},
    EventKind as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::content::now_ms;
use crate::error::WatchError;

/// How many consecutive backend errors we tolerate before declaring the
/// watch dead.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// The kinds of filesystem change the engine recognises. Renames don't
/// appear here: the watcher decomposes them into a deletion of the old path
/// and a creation of the new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

/// One normalized filesystem event. The watcher emits these raw; coalescing
/// and echo suppression are the debouncer's job, not ours.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// When the event was observed, in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Which event kinds a registration wants to hear about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventMask {
    pub create: bool,
    pub modify: bool,
    pub delete: bool,
}
impl Default for EventMask {
    fn default() -> Self {
        Self {
            create: true,
            modify: true,
            delete: true,
        }
    }
}
impl EventMask {
    fn allows(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Create => self.create,
            ChangeKind::Modify => self.modify,
            ChangeKind::Delete => self.delete,
        }
    }
}

/// A request to watch a directory tree. Matching is done on paths relative
/// to the root: `**` crosses directory separators, `*` and `?` don't.
#[derive(Clone, Debug)]
pub struct WatchRegistration {
    /// The directory to watch, recursively. Canonicalized at spawn time so
    /// event paths compare byte-exactly with paths elsewhere in the engine.
    pub root: PathBuf,
    /// Which files under the root this registration cares about.
    pub pattern: String,
    /// Globs for paths to ignore even when the pattern matches them.
    pub ignore: Vec<String>,
    pub mask: EventMask,
    /// A per-registration debounce window override, in milliseconds. `None`
    /// uses the engine-wide debouncer config.
    pub debounce_ms: Option<u64>,
}
impl WatchRegistration {
    /// A registration for everything under the given root.
    pub fn all_of(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pattern: "**/*".to_string(),
            ignore: Vec::new(),
            mask: EventMask::default(),
            debounce_ms: None,
        }
    }
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }
    pub fn with_ignore(mut self, ignore: impl Into<String>) -> Self {
        self.ignore.push(ignore.into());
        self
    }
}

/// What a running watch sends to whoever is listening.
#[derive(Clone, Debug)]
pub enum WatcherSignal {
    Event(WatchEvent),
    /// The backend has failed persistently; no further events will come from
    /// this registration, and it should be disposed.
    Failed { error: String },
}

/// Decides whether a concrete path is interesting to a registration.
struct PathFilter {
    root: PathBuf,
    pattern: GlobMatcher,
    ignore: GlobSet,
}
impl PathFilter {
    fn build(root: PathBuf, registration: &WatchRegistration) -> Result<Self, WatchError> {
        let pattern = GlobBuilder::new(&registration.pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| WatchError::BadPattern {
                pattern: registration.pattern.clone(),
                err,
            })?
            .compile_matcher();

        let mut ignore = GlobSetBuilder::new();
        for glob in &registration.ignore {
            ignore.add(
                GlobBuilder::new(glob)
                    .literal_separator(true)
                    .build()
                    .map_err(|err| WatchError::BadPattern {
                        pattern: glob.clone(),
                        err,
                    })?,
            );
        }
        let ignore = ignore.build().map_err(|err| WatchError::BadPattern {
            pattern: registration.ignore.join(","),
            err,
        })?;

        Ok(Self {
            root,
            pattern,
            ignore,
        })
    }

    fn accepts(&self, path: &Path) -> bool {
        // Events for paths outside the root can show up when the OS reports
        // on a renamed ancestor; they're not ours
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        self.pattern.is_match(rel) && !self.ignore.is_match(rel)
    }
}

/// A handle to a running watch registration. Dropping it (or calling
/// [`Self::dispose`]) stops the underlying OS watcher; nothing else will.
pub struct WatchGuard {
    // Held only to keep the OS watcher alive
    _watcher: RecommendedWatcher,
    root: PathBuf,
}
impl WatchGuard {
    /// The canonicalized root this guard is watching.
    pub fn root(&self) -> &Path {
        &self.root
    }
    /// Stops the watch. Equivalent to dropping the guard, but reads better
    /// at call sites that are deliberately tearing a registration down.
    pub fn dispose(self) {}
}

/// The host-side path watcher: turns OS notifications into normalized
/// [`WatchEvent`]s on a channel, filtered per registration. It knows nothing
/// about internal-write tags; every matching event is forwarded, echoes of
/// our own writes included.
pub struct PathWatcher;
impl PathWatcher {
    /// Starts watching per the given registration, sending signals to `tx`.
    /// Failure to set the watch up at all is returned immediately; transient
    /// backend errors after that are logged and watching continues, and a
    /// persistent backend failure emits [`WatcherSignal::Failed`] once.
    pub fn spawn(
        registration: &WatchRegistration,
        tx: mpsc::UnboundedSender<WatcherSignal>,
    ) -> Result<WatchGuard, WatchError> {
        let root = registration
            .root
            .canonicalize()
            .map_err(|_| WatchError::BadRoot {
                path: registration.root.clone(),
            })?;
        if !root.is_dir() {
            return Err(WatchError::BadRoot { path: root });
        }

        let filter = PathFilter::build(root.clone(), registration)?;
        let mask = registration.mask;
        let consecutive_errors = AtomicU32::new(0);
        let dead = AtomicBool::new(false);
        let signal_root = root.clone();

        let mut watcher =
            notify::recommended_watcher(move |ev: Result<notify::Event, notify::Error>| {
                if dead.load(Ordering::SeqCst) {
                    return;
                }
                let ev = match ev {
                    Ok(ev) => {
                        consecutive_errors.store(0, Ordering::SeqCst);
                        ev
                    }
                    Err(err) => {
                        let failures = consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!(?err, failures, root = ?signal_root, "watch backend error");
                        if failures >= MAX_CONSECUTIVE_ERRORS {
                            dead.store(true, Ordering::SeqCst);
                            let _ = tx.send(WatcherSignal::Failed {
                                error: err.to_string(),
                            });
                        }
                        return;
                    }
                };

                for event in normalize(&ev) {
                    if !mask.allows(event.kind) || !filter.accepts(&event.path) {
                        continue;
                    }
                    debug!(kind = ?event.kind, path = ?event.path, "watch event");
                    // A send failure means the listener is gone, and so are
                    // we, imminently
                    let _ = tx.send(WatcherSignal::Event(event));
                }
            })
            .map_err(|err| WatchError::CreateFailed {
                path: root.clone(),
                err,
            })?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|err| WatchError::CreateFailed {
                path: root.clone(),
                err,
            })?;

        Ok(WatchGuard {
            _watcher: watcher,
            root,
        })
    }
}

/// Maps one raw notify event to zero or more normalized events. Renames
/// become delete+create; folder creations, metadata-only modifications, and
/// accesses disappear here.
fn normalize(ev: &notify::Event) -> Vec<WatchEvent> {
    let stamp = now_ms();
    let event = |kind: ChangeKind, path: &PathBuf| WatchEvent {
        kind,
        path: path.clone(),
        timestamp_ms: stamp,
    };

    let Some(first) = ev.paths.first() else {
        return Vec::new();
    };

    match &ev.kind {
        NotifyEvent::Create(create_kind) => match create_kind {
            // If we're told this is a folder, ignore it; if we're unsure,
            // let it through and downstream filtering sort it out
            CreateKind::Folder => Vec::new(),
            _ => vec![event(ChangeKind::Create, first)],
        },
        NotifyEvent::Modify(modify_kind) => match modify_kind {
            ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other => {
                vec![event(ChangeKind::Modify, first)]
            }
            // Nothing to do for a metadata change
            ModifyKind::Metadata(_) => Vec::new(),
            ModifyKind::Name(rename_mode) => match rename_mode {
                _ if ev.paths.len() > 1 => vec![
                    event(ChangeKind::Delete, first),
                    event(ChangeKind::Create, &ev.paths[1]),
                ],
                RenameMode::From => vec![event(ChangeKind::Delete, first)],
                RenameMode::To => vec![event(ChangeKind::Create, first)],
                // A rename where we don't even know which side we're seeing;
                // safest reading is "something changed here"
                _ => {
                    debug!(path = ?first, "unpaired rename event, treating as modify");
                    vec![event(ChangeKind::Modify, first)]
                }
            },
        },
        NotifyEvent::Remove(_) => vec![event(ChangeKind::Delete, first)],
        // Non-modifying accesses don't concern us
        NotifyEvent::Access(_) => Vec::new(),
        // We can't really do anything with these...
        NotifyEvent::Any | NotifyEvent::Other => Vec::new(),
    }
}
