//! SSH transport implementation using the system ssh client
//!
//! Uses system SSH for reliability and to leverage the user's existing SSH
//! setup. Every remote operation is a separate batch-mode `ssh` invocation
//! bounded by the configured timeout.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;
use tracing::{debug, info};

use markersync_core::{RemoteError, RemoteStore, WriteMode};

/// Exit status ssh itself uses for connection and authentication failures
const SSH_FAILURE: i32 = 255;

/// Exit statuses of the remote helper snippets
const EXIT_IS_DIRECTORY: i32 = 21;
const EXIT_NOT_FOUND: i32 = 22;
const EXIT_PERMISSION_DENIED: i32 = 23;

/// Buffer size for draining remote output
const READ_CHUNK: usize = 64 * 1024;

/// Connection settings for [`SshTransport`]
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key used for public key authentication
    pub identity_file: Option<PathBuf>,
    /// Known hosts file the server key is checked against
    pub known_hosts_file: Option<PathBuf>,
    /// Upper bound for every single remote operation
    pub timeout: Duration,
    /// Have ssh print its own diagnostics into the debug log
    pub debug: bool,
}

impl SshOptions {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            identity_file: None,
            known_hosts_file: None,
            timeout: Duration::from_secs(30),
            debug: false,
        }
    }
}

/// SSH transport for reading and changing one remote host's files
pub struct SshTransport {
    options: SshOptions,
}

impl SshTransport {
    /// Connect and authenticate to the remote host.
    ///
    /// Unknown host keys are accepted and recorded; a changed host key is
    /// refused by ssh.
    ///
    /// # Errors
    /// Returns [`RemoteError::Auth`] or [`RemoteError::Transport`] if the
    /// session cannot be established
    pub async fn connect(options: SshOptions) -> Result<Self, RemoteError> {
        info!(
            "Connecting to ssh://{}@{}:{}",
            options.user, options.host, options.port
        );

        let transport = Self { options };

        let output = transport.execute("connect", "true", None).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(transport.connect_error(&stderr));
        }

        info!("Connected to {}", transport.ssh_dest());
        Ok(transport)
    }

    /// Build SSH destination string
    fn ssh_dest(&self) -> String {
        format!("{}@{}", self.options.user, self.options.host)
    }

    /// Arguments passed to `ssh` before the remote command
    fn ssh_args(&self) -> Vec<String> {
        let timeout = self.options.timeout.as_secs().max(1);
        let mut args = vec![
            "-p".to_string(),
            self.options.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={timeout}"),
            "-o".to_string(),
            format!("ServerAliveInterval={timeout}"),
            "-o".to_string(),
            "ServerAliveCountMax=1".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(known_hosts) = &self.options.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        if let Some(identity) = &self.options.identity_file {
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if self.options.debug {
            args.push("-v".to_string());
        }
        args.push(self.ssh_dest());
        args
    }

    /// Run `command` on the remote host, feeding `stdin` if given.
    ///
    /// The timeout bounds each wait for progress, not the whole command, so
    /// large files may take as long as they keep streaming.
    async fn execute(
        &self,
        operation: &'static str,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Output, RemoteError> {
        debug!("ssh {operation}: {command}");
        let mut child = Command::new("ssh")
            .args(self.ssh_args())
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Transport(format!("cannot start ssh: {e}")))?;

        let idle = self.options.timeout;
        let failed = |e: std::io::Error| {
            if e.kind() == ErrorKind::TimedOut {
                RemoteError::Timeout {
                    operation,
                    secs: idle.as_secs(),
                }
            } else {
                RemoteError::Transport(format!("ssh {operation} failed: {e}"))
            }
        };

        // Drained concurrently so a chatty ssh -v cannot fill the pipe
        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        });

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let write = async {
                pipe.write_all(data).await?;
                pipe.shutdown().await
            };
            tokio::time::timeout(idle, write)
                .await
                .map_err(|_| failed(ErrorKind::TimedOut.into()))?
                .map_err(failed)?;
        }

        let stdout = match child.stdout.take() {
            Some(mut pipe) => read_idle(&mut pipe, idle).await.map_err(failed)?,
            None => Vec::new(),
        };
        let status = tokio::time::timeout(idle, child.wait())
            .await
            .map_err(|_| failed(ErrorKind::TimedOut.into()))?
            .map_err(failed)?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if self.options.debug && !stderr.is_empty() {
            debug!(
                "ssh {operation} stderr: {}",
                String::from_utf8_lossy(&stderr).trim_end()
            );
        }
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }

    /// Run a remote snippet and map a non-zero exit to a [`RemoteError`]
    async fn checked(
        &self,
        operation: &'static str,
        path: &str,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Output, RemoteError> {
        let output = self.execute(operation, command, stdin).await?;
        match output.status.code() {
            Some(0) => Ok(output),
            code => Err(classify_failure(
                operation,
                path,
                code,
                &String::from_utf8_lossy(&output.stderr),
            )),
        }
    }

    fn connect_error(&self, stderr: &str) -> RemoteError {
        let message = stderr.trim().to_string();
        if message.contains("Permission denied") {
            RemoteError::Auth {
                user: self.options.user.clone(),
                host: self.options.host.clone(),
                message,
            }
        } else {
            RemoteError::Transport(format!(
                "connecting to {}:{} failed: {message}",
                self.options.host, self.options.port
            ))
        }
    }
}

/// Quote `value` for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Read `reader` to the end, failing with [`ErrorKind::TimedOut`] when no
/// data arrives for `idle`
async fn read_idle<R>(reader: &mut R, idle: Duration) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::time::timeout(idle, reader.read(&mut chunk))
            .await
            .map_err(|_| std::io::Error::from(ErrorKind::TimedOut))??;
        if n == 0 {
            return Ok(data);
        }
        data.extend_from_slice(&chunk[..n]);
    }
}

/// Remote command writing stdin to `path`.
///
/// A truncating write goes to a hidden sibling first and is renamed over
/// `path`, so an interrupted transfer never leaves a short file behind.
fn write_command(path: &str, mode: WriteMode) -> String {
    let target = shell_quote(path);
    match mode {
        WriteMode::Append => format!("cat >> {target}"),
        WriteMode::Truncate => {
            let partial = match path.rsplit_once('/') {
                Some((dir, name)) => format!("{dir}/.{name}.partial"),
                None => format!(".{path}.partial"),
            };
            let partial = shell_quote(&partial);
            format!(
                "cat > {partial} && mv -f -- {partial} {target} \
                 || {{ rm -f -- {partial}; exit 1; }}"
            )
        }
    }
}

/// Shell prelude that exits with a distinct status when `path` is not a
/// readable regular file
fn guard_file(path: &str) -> String {
    let p = shell_quote(path);
    format!(
        "if [ -d {p} ]; then exit {EXIT_IS_DIRECTORY}; \
         elif [ ! -e {p} ]; then exit {EXIT_NOT_FOUND}; \
         elif [ ! -r {p} ]; then exit {EXIT_PERMISSION_DENIED}; fi; "
    )
}

fn classify_failure(
    operation: &'static str,
    path: &str,
    code: Option<i32>,
    stderr: &str,
) -> RemoteError {
    let path = path.to_string();
    match code {
        Some(EXIT_IS_DIRECTORY) => RemoteError::IsDirectory { path },
        Some(EXIT_NOT_FOUND) => RemoteError::NotFound { path },
        Some(EXIT_PERMISSION_DENIED) => RemoteError::PermissionDenied { path },
        Some(SSH_FAILURE) | None => RemoteError::Transport(format!(
            "ssh {operation} on {path} failed: {}",
            stderr.trim()
        )),
        Some(_) if stderr.contains("No such file") => RemoteError::NotFound { path },
        Some(_) if stderr.contains("Permission denied") => RemoteError::PermissionDenied { path },
        Some(_) => RemoteError::Failed {
            operation,
            path,
            message: stderr.trim().to_string(),
        },
    }
}

fn parse_size(path: &str, stdout: &[u8]) -> Result<u64, RemoteError> {
    let text = String::from_utf8_lossy(stdout);
    text.trim().parse().map_err(|_| RemoteError::Failed {
        operation: "stat",
        path: path.to_string(),
        message: format!("unexpected size output '{}'", text.trim()),
    })
}

#[async_trait]
impl RemoteStore for SshTransport {
    async fn list_directory(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        let command = format!("ls -1A -- {}", shell_quote(path));
        let output = self.checked("list", path, &command, None).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteError> {
        let command = format!("{}exec cat -- {}", guard_file(path), shell_quote(path));
        let output = self.checked("read", path, &command, None).await?;
        Ok(Bytes::from(output.stdout))
    }

    async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), RemoteError> {
        let command = write_command(path, mode);
        self.checked("write", path, &command, Some(data)).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        let p = shell_quote(path);
        let command = format!(
            "if [ -d {p} ]; then exit {EXIT_IS_DIRECTORY}; \
             elif [ ! -e {p} ]; then exit {EXIT_NOT_FOUND}; fi; rm -- {p}"
        );
        self.checked("delete", path, &command, None).await?;
        Ok(())
    }

    async fn stat_size(&self, path: &str) -> Result<u64, RemoteError> {
        let command = format!("{}wc -c < {}", guard_file(path), shell_quote(path));
        let output = self.checked("stat", path, &command, None).await?;
        parse_size(path, &output.stdout)
    }
}

/// Resolve a leading `~/` against `$HOME`
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    fn transport(options: SshOptions) -> SshTransport {
        SshTransport { options }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf x)"), "'$(rm -rf x)'");
    }

    #[test]
    fn test_ssh_args() {
        let mut options = SshOptions::new("sftp.example.org", 2222, "feeds");
        options.identity_file = Some(PathBuf::from("/keys/id_rsa"));
        options.known_hosts_file = Some(PathBuf::from("/keys/known_hosts"));
        options.timeout = Duration::from_secs(10);
        let args = transport(options).ssh_args();

        assert_eq!(args.first().map(String::as_str), Some("-p"));
        assert_eq!(args.get(1).map(String::as_str), Some("2222"));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/keys/known_hosts".to_string()));
        assert!(args.contains(&"/keys/id_rsa".to_string()));
        assert!(!args.contains(&"-v".to_string()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("feeds@sftp.example.org")
        );
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("read", "in/x", Some(EXIT_IS_DIRECTORY), ""),
            RemoteError::IsDirectory { .. }
        ));
        assert!(matches!(
            classify_failure("read", "in/x", Some(EXIT_NOT_FOUND), ""),
            RemoteError::NotFound { .. }
        ));
        assert!(matches!(
            classify_failure("list", "in", Some(2), "ls: cannot access 'in': No such file or directory"),
            RemoteError::NotFound { .. }
        ));
        let fatal = classify_failure("read", "in/x", Some(SSH_FAILURE), "Connection reset");
        assert!(fatal.is_fatal());
        assert!(!classify_failure("write", "in/x", Some(1), "disk full").is_fatal());
    }

    #[tokio::test]
    async fn test_read_idle_allows_slow_steady_streams() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            for _ in 0..12 {
                tx.write_all(b"chunk").await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        // 12 x 50ms is well past the idle bound, but data keeps arriving
        let data = read_idle(&mut rx, Duration::from_millis(400)).await.unwrap();
        writer.await.unwrap();
        assert_eq!(data.len(), 12 * 5);
    }

    #[tokio::test]
    async fn test_read_idle_times_out_on_stalled_stream() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            tx.write_all(b"partial").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(tx);
        });

        let err = read_idle(&mut rx, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        writer.abort();
    }

    #[test]
    fn test_append_write_command() {
        assert_eq!(
            write_command("in/a.csv.SENT", WriteMode::Append),
            "cat >> 'in/a.csv.SENT'"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_truncating_write_replaces_file_whole() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.csv.SENT");
        std::fs::write(&target, "stale digest").unwrap();
        let path = target.to_str().unwrap();

        let run = |input: &[u8], command: &str| {
            let mut child = std::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdin(Stdio::piped())
                .spawn()
                .unwrap();
            // the failing command may exit before reading its input
            let _ = child.stdin.take().unwrap().write_all(input);
            child.wait().unwrap()
        };

        assert!(run(b"fresh", &write_command(path, WriteMode::Truncate)).success());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "fresh");
        assert!(!dir.path().join(".a.csv.SENT.partial").exists());

        // a failed transfer leaves the old content and no partial file
        let failing = write_command(path, WriteMode::Truncate).replacen("cat >", "false >", 1);
        assert!(!run(b"lost", &failing).success());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "fresh");
        assert!(!dir.path().join(".a.csv.SENT.partial").exists());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("x", b"  40\n").unwrap(), 40);
        assert!(parse_size("x", b"wc: x: Is a directory").is_err());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(
            expand_home(Path::new("/etc/ssh/known_hosts")),
            PathBuf::from("/etc/ssh/known_hosts")
        );
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/.ssh/id_rsa")),
                PathBuf::from(home).join(".ssh/id_rsa")
            );
        }
    }
}
