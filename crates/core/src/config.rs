//! Run configuration: the optional TOML file and the validated [`SyncConfig`]

use std::path::{Path, PathBuf};

use crate::marker::CheckPolicy;

/// Config file looked up in the working directory when none is given
pub const CONFIG_FILE: &str = "markersync.toml";

/// Remote directory used when neither flag nor config file names one
pub const DEFAULT_REMOTE_DIR: &str = "incoming";

/// Usage errors, detected before the remote host is contacted
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("the remote username must be specified")]
    MissingRemoteUser,

    #[error("the remote server must be specified")]
    MissingRemoteServer,

    #[error("at least one previous state must be specified")]
    MissingPreviousState,

    #[error("at least one next state must be specified when no deletion of the remote file is wanted")]
    MissingNextState,

    #[error("it makes no sense to specify a next state and delete it immediately")]
    NextStateWithDeleteAllStatefiles,

    #[error("it makes no sense to specify a next state and delete the file it belongs to")]
    NextStateWithDeleteRemoteFile,

    #[error("refusing to delete all state files of a file without leaving a next state behind")]
    DeleteAllStatefilesWithoutNextState,

    #[error("--force-state-check and --skip-state-check exclude each other")]
    ConflictingCheckPolicy,

    #[error("invalid state name '{0}': must be non-empty and contain no '/'")]
    InvalidStateName(String),
}

/// Settings read from a TOML file; every field is optional.
///
/// Command line flags take precedence over these values.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub remote_server: Option<String>,
    pub remote_port: Option<u16>,
    pub remote_user: Option<String>,
    pub remote_dir: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub ssh_host_key_file: Option<PathBuf>,
    pub ssh_rsa_id_file: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub start_jitter_secs: Option<u64>,
}

impl FileConfig {
    /// Parse the config file at `path`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load [`CONFIG_FILE`] from `dir`, or the empty config if it does not exist
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed
    pub fn load_default(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Which remote files are removed after a file has been handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletePolicy {
    /// Remove the payload itself
    pub remote_file: bool,
    /// Remove every empty entry named after the payload
    pub all_statefiles: bool,
    /// Remove exactly the previous-state markers that were required
    pub previous_statefiles: bool,
}

/// Everything the orchestrator and the lister need to know about a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub remote_dir: String,
    pub local_dir: PathBuf,
    pub previous_states: Vec<String>,
    pub next_states: Vec<String>,
    pub check_policy: CheckPolicy,
    pub no_fetch: bool,
    pub dry_run: bool,
    pub list_only: bool,
    pub delete: DeletePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
            local_dir: PathBuf::from("."),
            previous_states: Vec::new(),
            next_states: Vec::new(),
            check_policy: CheckPolicy::Normal,
            no_fetch: false,
            dry_run: false,
            list_only: false,
            delete: DeletePolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Reject option combinations that cannot describe a sensible run
    ///
    /// # Errors
    /// Returns the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        for state in self.previous_states.iter().chain(&self.next_states) {
            if state.is_empty() || state.contains('/') {
                return Err(ConfigError::InvalidStateName(state.clone()));
            }
        }

        if self.previous_states.is_empty() && !self.list_only {
            return Err(ConfigError::MissingPreviousState);
        }

        let has_next = !self.next_states.is_empty();
        if !has_next && self.delete.all_statefiles {
            return Err(ConfigError::DeleteAllStatefilesWithoutNextState);
        }
        if !has_next && !self.delete.remote_file && !self.list_only {
            return Err(ConfigError::MissingNextState);
        }
        if has_next && self.delete.all_statefiles {
            return Err(ConfigError::NextStateWithDeleteAllStatefiles);
        }
        if has_next && self.delete.remote_file {
            return Err(ConfigError::NextStateWithDeleteRemoteFile);
        }

        Ok(())
    }

    /// Whether the run is expected to write payloads locally
    #[must_use]
    pub fn fetch_requested(&self) -> bool {
        !self.no_fetch
    }
}
