//! Tern keeps an in-editor document buffer and a file on disk consistent
//! while both sides change. One side is a **host** with direct disk access;
//! the other is a sandboxed **view** holding the buffer a human is editing.
//! The two are connected by an ordered, asynchronous message bridge, and
//! three mechanisms do the real work:
//!
//! - a debounced, per-path **autosave queue** on the host that coalesces
//!   rapid edits into single writes, with retries and optional backups;
//! - **change detection** that watches paths, debounces filesystem events,
//!   and suppresses the echoes of the engine's own writes so an autosave is
//!   never mistaken for an external change;
//! - a **buffer state machine** on the view that reconciles user edits with
//!   external changes, never losing either side's content: echoes of our
//!   saves can't clobber fresh keystrokes, and genuinely conflicting changes
//!   are put to the user as a whole-document choice.
//!
//! Construction is explicit: build a [`config::Config`], create a bridge
//! pair with [`bridge::BridgeEnd::pair`], hand one end to
//! [`host::HostEngine`] and the other to [`view::ViewRuntime`].

pub mod autosave;
pub mod bridge;
pub mod config;
pub mod content;
pub mod debouncer;
pub mod diagnostics;
pub mod error;
pub mod file_ops;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod theme;
pub mod view;
pub mod watcher;

#[cfg(test)]
mod tests;

pub use bridge::BridgeEnd;
pub use config::Config;
pub use content::{FileContent, FileMetadata};
pub use host::HostEngine;
pub use session::{ConflictChoice, EditSession, SessionState};
pub use view::{SessionHandle, UiEvent, ViewRuntime};
