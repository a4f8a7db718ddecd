use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::FileContent;
use crate::error::BridgeError;
use crate::watcher::ChangeKind;

/// Every kind of message the engine sends over the bridge. This is a closed
/// set: a message whose kind isn't listed here fails to deserialize, and the
/// bridge drops it rather than guessing (there is deliberately no "unknown
/// message" branch).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Host → view: authoritative content for a path, whether from the
    /// initial load, an external change, or the echo of our own save.
    #[serde(rename = "file-update")]
    FileUpdate,
    /// View → host: please persist this content.
    #[serde(rename = "save-request")]
    SaveRequest,
    /// Host → view: a save finished (successfully or not).
    #[serde(rename = "save-complete")]
    SaveComplete,
    /// Host → view: a watched path changed externally. Followed by a
    /// `file-update` with the new content for non-delete changes.
    #[serde(rename = "file-change-external")]
    FileChangeExternal,
    /// View → host request: read a file, response carries its content.
    #[serde(rename = "read-file")]
    ReadFile,
    /// View → host request: write a file, response carries bytes written.
    #[serde(rename = "write-file")]
    WriteFile,
    /// Host → view: a watch registration died and won't produce any more
    /// change notifications.
    #[serde(rename = "watch-failed")]
    WatchFailed,
    /// Host → view: opaque theme payload, passed through untouched.
    #[serde(rename = "theme-changed")]
    ThemeChanged,
    /// Host → view: opaque session-state payload, passed through untouched.
    #[serde(rename = "state-restore")]
    StateRestore,
}
impl MessageKind {
    /// The exact wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileUpdate => "file-update",
            Self::SaveRequest => "save-request",
            Self::SaveComplete => "save-complete",
            Self::FileChangeExternal => "file-change-external",
            Self::ReadFile => "read-file",
            Self::WriteFile => "write-file",
            Self::WatchFailed => "watch-failed",
            Self::ThemeChanged => "theme-changed",
            Self::StateRestore => "state-restore",
        }
    }
}
impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(b: &bool) -> bool {
    !b
}

/// A single message on the bridge. Requests carry a `correlation_id`;
/// responses carry the same id with `reply` set (ids are generated per bridge
/// end, so the marker is what stops a peer's request id from colliding with
/// one of our own outstanding requests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reply: bool,
    /// On a reply, the peer-side failure that prevented a real response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
impl Message {
    /// Creates a fire-and-forget message carrying the given payload.
    pub fn event<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, BridgeError> {
        Ok(Self {
            kind,
            payload: Some(serde_json::to_value(payload).map_err(|err| BridgeError::Payload { err })?),
            correlation_id: None,
            reply: false,
            error: None,
        })
    }
    /// Creates a fire-and-forget message with a pre-encoded (possibly opaque)
    /// payload.
    pub fn opaque(kind: MessageKind, payload: Value) -> Self {
        Self {
            kind,
            payload: Some(payload),
            correlation_id: None,
            reply: false,
            error: None,
        }
    }
    /// Decodes this message's payload into the given type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, BridgeError> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
            .map_err(|err| BridgeError::Payload { err })
    }

    pub(crate) fn request(kind: MessageKind, payload: Value, id: u64) -> Self {
        Self {
            kind,
            payload: Some(payload),
            correlation_id: Some(id),
            reply: false,
            error: None,
        }
    }
    pub(crate) fn response(kind: MessageKind, id: u64, payload: Option<Value>) -> Self {
        Self {
            kind,
            payload,
            correlation_id: Some(id),
            reply: true,
            error: None,
        }
    }
    pub(crate) fn error_response(kind: MessageKind, id: u64, message: String) -> Self {
        Self {
            kind,
            payload: None,
            correlation_id: Some(id),
            reply: true,
            error: Some(message),
        }
    }
}

/// Why the host is sending a `file-update`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateReason {
    /// The first content for a newly opened session.
    #[serde(rename = "initial-load")]
    InitialLoad,
    /// A watched path changed outside the engine.
    #[serde(rename = "external-change")]
    ExternalChange,
    /// The on-disk result of one of the engine's own saves.
    #[serde(rename = "save-echo")]
    SaveEcho,
}

/// Payload of a `file-update` message. Exactly one of `content` and `error`
/// is populated: an unreadable file (too large, undecodable) still produces a
/// `file-update` so the view knows why its session can't leave
/// initialisation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileUpdate {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FileContent>,
    pub reason: UpdateReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a `save-request` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaveRequest {
    pub path: PathBuf,
    pub content: FileContent,
}

/// Payload of a `save-complete` message. On failure, `error` is populated and
/// `bytes_written` is zero; the content field still carries what the view
/// asked to save so it can match the completion to the right submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaveComplete {
    pub path: PathBuf,
    pub content: FileContent,
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a `file-change-external` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileChangeExternal {
    pub path: PathBuf,
    pub change_type: ChangeKind,
}

/// Payload of a `read-file` request. The response payload is the file's
/// content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadFile {
    pub path: PathBuf,
}

/// Payload of a `write-file` request. The response payload is the number of
/// bytes written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteFile {
    pub path: PathBuf,
    pub content: FileContent,
}

/// Payload of a `watch-failed` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchFailed {
    pub path: PathBuf,
    pub error: String,
}
