use std::path::Path;

use serde::{Deserialize, Serialize};

/// The full text of a document, as held in an editor buffer or read from the
/// disk. This is always valid UTF-8 (the file operations layer rejects
/// anything else), and equality is byte-exact, which is what the whole
/// synchronisation engine leans on: echoes, dirtiness, and conflicts are all
/// decided by whole-content comparison.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileContent(String);
impl FileContent {
    /// Creates content from anything string-like.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
    /// Creates empty content. This is what a session starts from when its
    /// path doesn't exist on disk yet.
    pub fn empty() -> Self {
        Self(String::new())
    }
    /// The text itself.
    pub fn as_str(&self) -> &str {
        &self.0
    }
    /// The size of this content in bytes (not characters).
    pub fn byte_len(&self) -> u64 {
        self.0.len() as u64
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn into_string(self) -> String {
        self.0
    }
}
impl From<String> for FileContent {
    fn from(text: String) -> Self {
        Self(text)
    }
}
impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        Self(text.to_string())
    }
}

/// Statistics about a piece of content, derived from the bytes present at the
/// moment of derivation. These are computed fresh at every read or write and
/// never cached across calls: the content is authoritative, the metadata is
/// commentary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Size of the content in bytes.
    pub size: u64,
    /// The number of lines (a trailing newline does not produce a phantom
    /// empty final line, and empty content has zero lines).
    pub line_count: usize,
    /// The number of whitespace-separated words.
    pub word_count: usize,
    /// The number of characters (Unicode scalar values, not bytes).
    pub char_count: usize,
    /// Last-modified time in milliseconds since the Unix epoch. For reads
    /// this comes from the filesystem; for writes it's the completion time.
    pub modified_ms: i64,
    /// The file's extension, lowercased, if it has one.
    pub extension: Option<String>,
}
impl FileMetadata {
    /// Derives metadata for the given content as it pertains to the given
    /// path. The modification timestamp is whatever the caller observed it to
    /// be; this function doesn't touch the filesystem.
    pub fn derive(content: &FileContent, path: &Path, modified_ms: i64) -> Self {
        let text = content.as_str();
        Self {
            size: content.byte_len(),
            line_count: text.lines().count(),
            word_count: text.split_whitespace().count(),
            char_count: text.chars().count(),
            modified_ms,
            extension: path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase()),
        }
    }
}

/// The current time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
