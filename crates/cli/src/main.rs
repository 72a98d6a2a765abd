//! markersync: fetch files over SSH when their state markers say so
//!
//! Every remote file `F` may have marker files `F.<STATE>` next to it. A file
//! is fetched when all previous states are present, and afterwards the next
//! states are written as markers holding a digest of the fetched content.

mod debug_log;
mod progress;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, builder::Styles};
use color_eyre::{Report, Result};
use rand::Rng as _;
use tracing::{debug, info};

use markersync_core::{
    ConfigError, Lister, RemoteError, RunOutcome, SyncError, SyncOrchestrator,
};
use markersync_transport::SshTransport;

use crate::settings::Settings;

/// Exit statuses, following sysexits(3) for the fatal cases
const EXIT_NOTHING_FETCHED: u8 = 1;
const EXIT_NOTHING_ADVANCED: u8 = 2;
const EXIT_USAGE: u8 = 64;
const EXIT_UNAVAILABLE: u8 = 69;
const EXIT_SOFTWARE: u8 = 70;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "markersync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Fetch remote files whose state marker files allow it")]
#[command(long_about = r#"
markersync fetches files from a remote directory over SSH, driven by marker
files named <file>.<STATE> that sit next to each file.

A file is fetched when every previous state is present. Afterwards each next
state is created as a marker holding a digest of the fetched content, so the
file is skipped on the next run unless it changes.

Exit status:
  0   success
  1   nothing fetched (or nothing listed with --list-files)
  2   no next state created (with --no-fetch)
  64  invalid options
  69  connection, authentication or timeout failure
  70  any other error

Examples:
  markersync -u import --remote-server sftp.example.com -p TRANSFERED -n FETCHED -l ./in
  markersync -u import --remote-server sftp.example.com --list-files -p TRANSFERED
"#)]
struct Cli {
    /// TOML config file [default: ./markersync.toml if present]
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Remote login name
    #[arg(short = 'u', long, value_name = "USER")]
    remote_user: Option<String>,

    /// Remote SSH server
    #[arg(long, value_name = "HOST")]
    remote_server: Option<String>,

    /// Remote SSH port [default: 22]
    #[arg(long, value_name = "PORT")]
    remote_port: Option<u16>,

    /// Remote directory holding the files and their markers [default: incoming]
    #[arg(short, long, value_name = "DIR")]
    remote_dir: Option<String>,

    /// Local directory receiving fetched files [default: .]
    #[arg(short, long, value_name = "DIR")]
    local_dir: Option<PathBuf>,

    /// State that must be present before a file is fetched (repeatable)
    #[arg(short, long = "previous-state", value_name = "STATE")]
    previous_state: Vec<String>,

    /// State to create after a file was fetched (repeatable)
    #[arg(short, long = "next-state", value_name = "STATE")]
    next_state: Vec<String>,

    /// Known hosts file the server key is checked against [default: ~/.ssh/known_hosts]
    #[arg(long, value_name = "PATH")]
    ssh_host_key_file: Option<PathBuf>,

    /// Private key used to authenticate [default: ~/.ssh/id_rsa]
    #[arg(long, value_name = "PATH")]
    ssh_rsa_id_file: Option<PathBuf>,

    /// Write ssh client diagnostics to the debug log
    #[arg(long)]
    ssh_debug: bool,

    /// Delete the remote file after fetching it
    #[arg(long)]
    delete_remote_file: bool,

    /// Delete every empty state file of a fetched file
    #[arg(long)]
    delete_remote_all_statefiles: bool,

    /// Delete the previous state files of a fetched file
    #[arg(long)]
    delete_remote_previous_statefiles: bool,

    /// Treat empty state files as absent
    #[arg(long, alias = "force-integrity-check")]
    force_state_check: bool,

    /// Accept every existing state file without checking its digest
    #[arg(long, alias = "skip-integrity-check")]
    skip_state_check: bool,

    /// Only print the files having all previous states
    #[arg(long, alias = "list-only")]
    list_files: bool,

    /// Create next states without fetching the files
    #[arg(long)]
    no_fetch: bool,

    /// Log what would be done without changing anything (implies --verbose)
    #[arg(short, long)]
    dry_run: bool,

    /// Log decisions and actions to the console
    #[arg(short, long)]
    verbose: bool,

    /// Log every check to the console (implies --verbose)
    #[arg(long)]
    debug: bool,

    /// Per-operation SSH timeout in seconds [default: 30]
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Append an info-level log to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Wait a random delay of up to this many seconds before starting
    #[arg(long, value_name = "SECS")]
    start_jitter: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporting: {e}");
        return ExitCode::from(EXIT_SOFTWARE);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version also arrive here
            let code = if e.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(report) => report_error(&report),
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::from_cli(&cli)?;
    let _log = debug_log::init(settings.console_level, settings.log_file())?;
    let sync = &settings.sync;

    if !settings.start_jitter.is_zero() {
        let max_ms = u64::try_from(settings.start_jitter.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(rand::rng().random_range(0..=max_ms));
        debug!("Sleeping {delay:?} before starting");
        tokio::time::sleep(delay).await;
    }

    info!(
        "Importing {}@{}:{} -> {}",
        settings.ssh.user,
        settings.ssh.host,
        sync.remote_dir,
        sync.local_dir.display()
    );

    let progress = progress::RunProgress::new();
    progress.connecting(&settings.ssh.user, &settings.ssh.host);
    let transport = SshTransport::connect(settings.ssh.clone()).await?;

    if sync.list_only {
        let names = Lister::new(&transport, &sync.remote_dir)
            .list(&sync.previous_states)
            .await?;
        for name in &names {
            println!("{name}");
        }
        return Ok(if names.is_empty() {
            ExitCode::from(EXIT_NOTHING_FETCHED)
        } else {
            ExitCode::SUCCESS
        });
    }

    let mut orchestrator = SyncOrchestrator::new(&transport, sync);
    let report = orchestrator.run().await?;
    orchestrator.caches().log_summary();
    progress.finish(&report);

    Ok(match report.outcome() {
        RunOutcome::Success => ExitCode::SUCCESS,
        RunOutcome::NothingFetched => ExitCode::from(EXIT_NOTHING_FETCHED),
        RunOutcome::NothingAdvanced => ExitCode::from(EXIT_NOTHING_ADVANCED),
    })
}

/// Print `report` and pick the exit status for it
fn report_error(report: &Report) -> ExitCode {
    if let Some(e) = report.downcast_ref::<ConfigError>() {
        eprintln!("{} {e}", console::style("error:").red().bold());
        eprintln!("\nFor more information, try '--help'.");
        return ExitCode::from(EXIT_USAGE);
    }
    eprintln!("{report:?}");
    ExitCode::from(exit_status(report))
}

fn exit_status(report: &Report) -> u8 {
    let remote = report.downcast_ref::<RemoteError>().or_else(|| {
        match report.downcast_ref::<SyncError>() {
            Some(SyncError::Remote(e)) => Some(e),
            _ => None,
        }
    });
    match remote {
        Some(e) if e.is_fatal() => EXIT_UNAVAILABLE,
        _ => EXIT_SOFTWARE,
    }
}
