use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::config::FileOpsConfig;
use crate::content::{now_ms, FileContent, FileMetadata};
use crate::error::FileOpsError;

/// A predicate over content, applied before a read result is returned or a
/// write is performed. Rejection surfaces as a `Validation` error, which is
/// never retried.
pub type ContentPredicate = Arc<dyn Fn(&FileContent) -> bool + Send + Sync>;

/// Options for a single read.
#[derive(Clone, Default)]
pub struct ReadOptions {
    pub validate: Option<ContentPredicate>,
}

/// Options for a single write.
#[derive(Clone, Default)]
pub struct WriteOptions {
    /// Create missing parent directories first. Off by default: writing into
    /// a directory that doesn't exist is usually a caller bug, except when
    /// saving a brand-new file.
    pub create_dirs: bool,
    pub validate: Option<ContentPredicate>,
}

/// Filesystem metadata for a path, gathered without reading its bytes. The
/// content-derived counts in [`FileMetadata`] are unavailable here by
/// construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathStat {
    pub size: u64,
    pub modified_ms: i64,
    pub is_file: bool,
    pub extension: Option<String>,
}

/// Uniform file I/O for the host side. Every filesystem read and write on the
/// host goes through this type (the autosave queue and the bridge's file
/// handlers included), which is what makes the size limit and validation
/// hooks actually univeral rather than advisory.
///
/// Writes are plain writes: no fsync, no atomic-rename dance. The engine's
/// durability story is "the autosave will run again", not "this write
/// survived a power cut".
pub struct FileOps {
    config: FileOpsConfig,
}

impl FileOps {
    pub fn new(config: FileOpsConfig) -> Self {
        Self { config }
    }

    /// Reads the file at the given path, returning its content and metadata
    /// derived from the bytes read. Files over the configured size limit are
    /// rejected before their bytes are loaded (a file of exactly the limit is
    /// fine); non-UTF-8 content is rejected after.
    pub async fn read(
        &self,
        path: &Path,
        options: &ReadOptions,
    ) -> Result<(FileContent, FileMetadata), FileOpsError> {
        let fs_meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| Self::map_io(path, err))?;
        if fs_meta.len() > self.config.max_size {
            return Err(FileOpsError::TooLarge {
                path: path.to_path_buf(),
                size: fs_meta.len(),
                max_size: self.config.max_size,
            });
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| Self::map_io(path, err))?;
        let text = String::from_utf8(bytes).map_err(|_| FileOpsError::Decode {
            path: path.to_path_buf(),
        })?;
        let content = FileContent::new(text);

        if let Some(validate) = &options.validate {
            if !validate(&content) {
                return Err(FileOpsError::Validation {
                    path: path.to_path_buf(),
                });
            }
        }

        let metadata = FileMetadata::derive(&content, path, modified_ms_of(&fs_meta));
        Ok((content, metadata))
    }

    /// Writes content to the given path, returning the number of bytes
    /// written. Parent directories are created only when the options ask for
    /// it. No fsync is issued.
    pub async fn write(
        &self,
        path: &Path,
        content: &FileContent,
        options: &WriteOptions,
    ) -> Result<u64, FileOpsError> {
        if let Some(validate) = &options.validate {
            if !validate(content) {
                return Err(FileOpsError::Validation {
                    path: path.to_path_buf(),
                });
            }
        }

        if options.create_dirs {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| Self::map_io(path, err))?;
            }
        }

        tokio::fs::write(path, content.as_str().as_bytes())
            .await
            .map_err(|err| Self::map_io(path, err))?;
        debug!(?path, bytes = content.byte_len(), "wrote file");
        Ok(content.byte_len())
    }

    /// Stats the path without reading any content bytes.
    pub async fn stat(&self, path: &Path) -> Result<PathStat, FileOpsError> {
        let fs_meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| Self::map_io(path, err))?;
        Ok(PathStat {
            size: fs_meta.len(),
            modified_ms: modified_ms_of(&fs_meta),
            is_file: fs_meta.is_file(),
            extension: path
                .extension()
                .map(|ext| ext.to_string_lossy().to_lowercase()),
        })
    }

    /// Reads the path and applies the predicate to its content. Purely a
    /// question, never a mutation.
    pub async fn validate(
        &self,
        path: &Path,
        predicate: ContentPredicate,
    ) -> Result<bool, FileOpsError> {
        let (content, _) = self.read(path, &ReadOptions::default()).await?;
        Ok(predicate(&content))
    }

    /// Whether a file currently exists at the path. Used by the autosave
    /// queue to decide whether there's anything to back up.
    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    fn map_io(path: &Path, err: std::io::Error) -> FileOpsError {
        if err.kind() == std::io::ErrorKind::NotFound {
            FileOpsError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            FileOpsError::Io {
                path: path.to_path_buf(),
                err,
            }
        }
    }
}

/// Extracts a millisecond mtime from filesystem metadata, falling back to the
/// current time on platforms or filesystems that can't answer.
fn modified_ms_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_else(now_ms)
}

/// Builds the backup path for an original: `{path}.backup-{timestamp}`, with
/// the timestamp's `:` and `.` replaced so the name is portable. Backups are
/// never removed automatically; retention is the user's business.
pub(crate) fn backup_path_for(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".backup-{stamp}"));
    PathBuf::from(name)
}
