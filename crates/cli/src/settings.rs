//! Merging command line flags, the config file and built-in defaults
//!
//! A flag wins over the config file, which wins over the default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;

use markersync_core::config::DEFAULT_REMOTE_DIR;
use markersync_core::{CheckPolicy, ConfigError, DeletePolicy, FileConfig, SyncConfig};
use markersync_transport::SshOptions;
use markersync_transport::ssh::expand_home;

use crate::Cli;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_KNOWN_HOSTS: &str = "~/.ssh/known_hosts";
const DEFAULT_IDENTITY: &str = "~/.ssh/id_rsa";

/// Everything a run needs, validated
#[derive(Debug)]
pub struct Settings {
    pub sync: SyncConfig,
    pub ssh: SshOptions,
    pub console_level: LevelFilter,
    pub start_jitter: Duration,
    log_file: Option<PathBuf>,
}

impl Settings {
    /// Load the config file named by `--config` (or the default one) and
    /// merge it with the flags
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for unreadable config files and invalid
    /// option combinations
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::load_default(Path::new("."))?,
        };
        Self::resolve(cli, file)
    }

    /// Merge `cli` over `file`
    ///
    /// # Errors
    /// Returns the first invalid option found
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let user = cli
            .remote_user
            .clone()
            .or(file.remote_user)
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::MissingRemoteUser)?;
        let host = cli
            .remote_server
            .clone()
            .or(file.remote_server)
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingRemoteServer)?;

        let check_policy = match (cli.force_state_check, cli.skip_state_check) {
            (true, true) => return Err(ConfigError::ConflictingCheckPolicy),
            (true, false) => CheckPolicy::Forced,
            (false, true) => CheckPolicy::Skipped,
            (false, false) => CheckPolicy::Normal,
        };

        let sync = SyncConfig {
            remote_dir: cli
                .remote_dir
                .clone()
                .or(file.remote_dir)
                .unwrap_or_else(|| DEFAULT_REMOTE_DIR.to_string()),
            local_dir: cli
                .local_dir
                .as_deref()
                .or(file.local_dir.as_deref())
                .map_or_else(|| PathBuf::from("."), expand_home),
            previous_states: cli.previous_state.clone(),
            next_states: cli.next_state.clone(),
            check_policy,
            no_fetch: cli.no_fetch,
            dry_run: cli.dry_run,
            list_only: cli.list_files,
            delete: DeletePolicy {
                remote_file: cli.delete_remote_file,
                all_statefiles: cli.delete_remote_all_statefiles,
                previous_statefiles: cli.delete_remote_previous_statefiles,
            },
        };
        sync.validate()?;

        let known_hosts = cli
            .ssh_host_key_file
            .clone()
            .or(file.ssh_host_key_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KNOWN_HOSTS));
        let identity = cli
            .ssh_rsa_id_file
            .clone()
            .or(file.ssh_rsa_id_file)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_IDENTITY));
        let timeout_secs = cli
            .timeout
            .or(file.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let port = cli.remote_port.or(file.remote_port).unwrap_or(DEFAULT_PORT);
        let ssh = SshOptions {
            known_hosts_file: Some(expand_home(&known_hosts)),
            identity_file: Some(expand_home(&identity)),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            debug: cli.ssh_debug,
            ..SshOptions::new(host, port, user)
        };

        let console_level = if cli.debug {
            LevelFilter::DEBUG
        } else if cli.verbose || cli.dry_run {
            LevelFilter::INFO
        } else {
            LevelFilter::WARN
        };

        Ok(Self {
            sync,
            ssh,
            console_level,
            start_jitter: Duration::from_secs(
                cli.start_jitter.or(file.start_jitter_secs).unwrap_or(0),
            ),
            log_file: cli.log_file.clone().or(file.log_file),
        })
    }

    /// The audit log file; dry-runs do not write one
    pub fn log_file(&self) -> Option<&Path> {
        if self.sync.dry_run {
            None
        } else {
            self.log_file.as_deref()
        }
    }
}
