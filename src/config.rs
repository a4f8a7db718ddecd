use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::error::ConfigParseError;

/// File names that can contain the configuration, probed in order.
static TEST_PATHS: [&str; 4] = ["tern.toml", ".tern.toml", "config.toml", ".config.toml"];

// Serde defaults
fn default_autosave_debounce_ms() -> u64 {
    400
}
fn default_max_retries() -> u32 {
    3
}
fn default_flag_internal_writes() -> bool {
    true
}
fn default_tag_expiry_ms() -> u64 {
    5000
}
fn default_event_debounce_ms() -> u64 {
    100
}
fn default_max_size() -> u64 {
    10 * 1024 * 1024
}
fn default_encoding() -> String {
    "utf-8".to_string()
}
fn default_editing_idle_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Configuration for the host-side autosave queue.
#[derive(Clone, Debug, Deserialize)]
pub struct AutosaveConfig {
    /// How long to wait after the last scheduled content before actually
    /// writing, in milliseconds. Rapid schedules within this window supersede
    /// one another and produce a single write.
    #[serde(default = "default_autosave_debounce_ms")]
    pub debounce_ms: u64,
    /// How many times a failed write is retried before the failure is
    /// surfaced. Zero means the first error is terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Whether to copy the current on-disk content to a timestamped backup
    /// file before each write. Backups are never cleaned up automatically.
    #[serde(default)]
    pub backup: bool,
    /// Whether to tag our own writes so the change detector can tell them
    /// apart from external modifications. Turning this off means every
    /// autosave will be re-observed as an external change; only do that if
    /// nothing is watching the written paths.
    #[serde(default = "default_flag_internal_writes")]
    pub flag_internal_writes: bool,
    /// How long an internal-write tag lives before it expires unconsumed, in
    /// milliseconds. If the OS coalesces our write with a later external one
    /// past this bound, the external change will be seen (rather than
    /// suppressed forever), which is the safer failure direction.
    #[serde(default = "default_tag_expiry_ms")]
    pub tag_expiry_ms: u64,
}
impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_autosave_debounce_ms(),
            max_retries: default_max_retries(),
            backup: false,
            flag_internal_writes: default_flag_internal_writes(),
            tag_expiry_ms: default_tag_expiry_ms(),
        }
    }
}

/// Configuration for the filesystem event debouncer.
#[derive(Clone, Debug, Deserialize)]
pub struct DebouncerConfig {
    /// The coalescing window in milliseconds. Repeated events for the same
    /// (kind, path) within this window collapse into one. Zero disables
    /// coalescing entirely and forwards every event as it arrives.
    #[serde(default = "default_event_debounce_ms")]
    pub debounce_ms: u64,
}
impl Default for DebouncerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_event_debounce_ms(),
        }
    }
}

/// Configuration for host-side file operations.
#[derive(Clone, Debug, Deserialize)]
pub struct FileOpsConfig {
    /// The largest file, in bytes, that will be read into memory. A file of
    /// exactly this size is accepted.
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// The text encoding documents are assumed to be in. Only `utf-8` is
    /// supported; the option exists so a config that asks for anything else
    /// fails loudly at startup instead of garbling content later.
    #[serde(default = "default_encoding")]
    pub encoding: String,
}
impl Default for FileOpsConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            encoding: default_encoding(),
        }
    }
}

/// Configuration for view-side edit sessions.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    /// How long after the last keystroke the user is still considered to be
    /// actively editing, in milliseconds. External changes arriving inside
    /// this window are deferred rather than surfaced as conflicts.
    #[serde(default = "default_editing_idle_ms")]
    pub editing_idle_ms: u64,
    /// How long after the last edit before the session requests a save, in
    /// milliseconds.
    #[serde(default = "default_autosave_debounce_ms")]
    pub autosave_debounce_ms: u64,
}
impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            editing_idle_ms: default_editing_idle_ms(),
            autosave_debounce_ms: default_autosave_debounce_ms(),
        }
    }
}

/// Configuration for the host/view message bridge.
#[derive(Clone, Debug, Deserialize)]
pub struct BridgeConfig {
    /// How long a correlated request waits for its response before failing
    /// with a timeout, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}
impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// The full configuration for a Tern engine. This is constructed once at
/// startup (from a file or from defaults) and injected explicitly into the
/// host engine and view runtime; nothing reads it through a global.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub debouncer: DebouncerConfig,
    #[serde(default)]
    pub file_ops: FileOpsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// The directory to write rolling daily log files to. Because retrieving
    /// the default for this can fail, this starts as `None` and is set to the
    /// platform default when the config is validated.
    pub log_directory: Option<PathBuf>,
}

impl Config {
    /// Gets a configuration from the given directory. This will read from
    /// `tern.toml`, `.tern.toml`, `config.toml`, or `.config.toml`, or fall
    /// back to the defaults if none of those files exist.
    pub fn from_dir(dir: &Path) -> Result<Self, ConfigParseError> {
        let config_path = TEST_PATHS.iter().map(|p| dir.join(p)).find(|p| p.exists());
        let mut config = if let Some(path) = config_path {
            // Load the configuration from the file (we use `std::fs` because
            // this happens at program start)
            let contents =
                std::fs::read_to_string(&path).map_err(|err| ConfigParseError::ReadFailed {
                    path: path.clone(),
                    err,
                })?;
            toml::from_str(&contents).map_err(|err| ConfigParseError::ParseFailed {
                path: path.clone(),
                err,
            })?
        } else {
            // Don't bother writing a default config file, that just clutters
            // directories that might only be synchronised once
            Self::default()
        };
        config.validate()?;

        Ok(config)
    }
    /// Validates this configuration, returning an error if it finds an
    /// invalid part. A missing log directory is not an error; it gets the
    /// platform default, created on the spot.
    pub fn validate(&mut self) -> Result<(), ConfigParseError> {
        if self.bridge.request_timeout_ms == 0 {
            return Err(ConfigParseError::ZeroRequestTimeout);
        }
        if !self.file_ops.encoding.eq_ignore_ascii_case("utf-8") {
            return Err(ConfigParseError::UnsupportedEncoding {
                encoding: self.file_ops.encoding.clone(),
            });
        }

        match &self.log_directory {
            // A user-chosen directory must already exist; we won't guess at
            // creating paths the user spelled out themselves
            Some(dir) if !dir.is_dir() => Err(ConfigParseError::InvalidLogDir {
                path: dir.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                self.log_directory = Some(provision_default_log_dir()?);
                Ok(())
            }
        }
    }
}

/// Resolves the platform's per-user data location for our logs and makes
/// sure it exists (`create_dir_all` is idempotent, so no existence probe is
/// needed). Blocking I/O, but this runs once before anything else is up.
fn provision_default_log_dir() -> Result<PathBuf, ConfigParseError> {
    let dirs =
        ProjectDirs::from("org", "tern", "tern").ok_or(ConfigParseError::NoProjectDirs)?;
    let dir = dirs.data_dir().join("logs");
    std::fs::create_dir_all(&dir).map_err(|err| ConfigParseError::CreateDefaultLogDirFailed {
        path: dir.clone(),
        err,
    })?;
    Ok(dir)
}
