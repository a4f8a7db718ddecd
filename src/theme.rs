//! Theme and session-state push: the thin end of the bridge.
//!
//! The engine neither parses nor stores these payloads; they're opaque JSON
//! blobs owned by the outer host process (a theme source, a workspace-state
//! store). They ride the bridge because they need its ordering guarantee: a
//! theme change sent after a file update arrives after it, full stop. The
//! view surfaces them verbatim as [`UiEvent::ThemeChanged`] and
//! [`UiEvent::StateRestore`].
//!
//! [`UiEvent::ThemeChanged`]: crate::view::UiEvent::ThemeChanged
//! [`UiEvent::StateRestore`]: crate::view::UiEvent::StateRestore

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::BridgeError;
use crate::host::HostEngine;
use crate::protocol::{Message, MessageKind};

impl HostEngine {
    /// Pushes an opaque theme payload to the view.
    pub fn push_theme(&self, payload: Value) -> Result<(), BridgeError> {
        self.bridge()
            .send(Message::opaque(MessageKind::ThemeChanged, payload))
    }

    /// Pushes an opaque session-state payload to the view, typically one
    /// previously handed to a [`SessionStateStore`].
    pub fn push_session_state(&self, payload: Value) -> Result<(), BridgeError> {
        self.bridge()
            .send(Message::opaque(MessageKind::StateRestore, payload))
    }
}

/// Where per-session view state (scroll position, cursor, folding, whatever
/// the view chooses to serialize) is kept between sessions. The host
/// integration provides the real implementation; the engine only defines the
/// seam and never looks inside the blobs.
pub trait SessionStateStore: Send + Sync {
    fn persist(&self, path: &Path, state: Value);
    fn restore(&self, path: &Path) -> Option<Value>;
}

/// An in-memory store, good enough for tests and single-process embedders.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<PathBuf, Value>>,
}
impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}
impl SessionStateStore for MemoryStateStore {
    fn persist(&self, path: &Path, state: Value) {
        self.states.lock().insert(path.to_path_buf(), state);
    }
    fn restore(&self, path: &Path) -> Option<Value> {
        self.states.lock().get(path).cloned()
    }
}
