//! The shell coprocess: a single long-lived `sh` process,
//! spawned once per agent process and torn down on termination, exposing
//! three channels:
//!
//! - fd 1 — captured into the tool result (or forwarded to the host's own
//!   stdout when a call asks for passthrough).
//! - fd 2 — always captured into the tool result.
//! - fd 3 — the **deliverable channel**: dup'd at spawn time directly onto
//!   the host process's real stdout file descriptor, so bytes the agent
//!   writes to `>&3` reach the outside world without passing back through
//!   this process at all.
//!
//! Working directory, exported variables, shell variables, and functions
//! persist across calls because it is the same OS process throughout — that
//! persistence is the entire point of a coprocess instead of a fresh spawn
//! per call.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("shell io error: {0}")]
    Io(#[from] io::Error),
    #[error("shell coprocess exited unexpectedly")]
    Gone,
}

pub type Result<T> = std::result::Result<T, ShellError>;

#[derive(Debug, Clone)]
pub struct ShellResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub stdout_total_bytes: usize,
    pub stderr_total_bytes: usize,
    pub timed_out: bool,
    /// True when passthrough consumed fd 1 directly; `stdout` is then empty
    /// and the caller substitutes the `(passthrough)` marker.
    pub stdout_passed_through: bool,
}

struct Inner {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
}

pub struct ShellCoprocess {
    inner: Mutex<Inner>,
    shell_path: String,
    workdir: PathBuf,
    default_timeout: Duration,
    output_cap: usize,
}

const BOOTSTRAP_TEMPLATE: &str = r#"
while IFS= read -r __quine_delim; do
  IFS= read -r __quine_len
  __quine_cmd=$(dd bs=1 count="$__quine_len" 2>/dev/null)
  read -r __quine_newline
  eval "$__quine_cmd"
  __quine_status=$?
  printf '\n%s:%d\n' "$__quine_delim" "$__quine_status"
  printf '%s\n' "$__quine_delim" >&2
done
"#;

impl ShellCoprocess {
    /// Spawns the coprocess. `host_stdout_fd` is a duplicate of the hosting
    /// process's own stdout (raw fd 1), obtained by the caller with
    /// `libc::dup(1)` *before* calling this, so it survives whatever
    /// stdio redirection this spawn applies to the child's own fd 1/2.
    #[cfg(unix)]
    pub async fn spawn(shell_path: &str, workdir: impl Into<PathBuf>, default_timeout: Duration, output_cap: usize, host_stdout_fd: std::os::unix::io::RawFd) -> Result<Self> {
        use std::os::unix::process::CommandExt;

        let workdir = workdir.into();
        let mut cmd = Command::new(shell_path);
        cmd.arg("-c")
            .arg(BOOTSTRAP_TEMPLATE)
            .current_dir(&workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // SAFETY: pre_exec runs in the forked child before exec, async-signal-safe
        // calls only (setsid + dup2 + close).
        unsafe {
            cmd.pre_exec(move || {
                libc::setsid();
                if libc::dup2(host_stdout_fd, 3) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::close(host_stdout_fd);
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        let stderr = BufReader::new(child.stderr.take().expect("piped stderr"));

        Ok(Self {
            inner: Mutex::new(Inner { child, stdin, stdout, stderr }),
            shell_path: shell_path.to_string(),
            workdir,
            default_timeout,
            output_cap,
        })
    }

    /// Writes the command as a length-prefixed frame (so embedded newlines
    /// in multi-line commands never get mistaken for the delimiter), then
    /// concurrently drains fd 1 and fd 2 until each delimiter appears.
    pub async fn execute(&self, command: &str, per_call_timeout: Option<Duration>, passthrough_stdout: bool) -> Result<ShellResult> {
        let deadline = match per_call_timeout {
            None => self.default_timeout,
            Some(t) if t.is_zero() => self.default_timeout,
            Some(t) => t.min(self.default_timeout),
        };

        let delim = format!("__QUINE_{}__", Uuid::new_v4().simple());
        let run = async {
            let mut inner = self.inner.lock().await;
            inner.stdin.write_all(format!("{delim}\n").as_bytes()).await?;
            inner.stdin.write_all(format!("{}\n", command.len()).as_bytes()).await?;
            inner.stdin.write_all(command.as_bytes()).await?;
            inner.stdin.write_all(b"\n").await?;
            inner.stdin.flush().await?;

            let Inner { stdout, stderr, .. } = &mut *inner;
            let (stdout_res, stderr_res) = tokio::join!(
                drain_until_status(stdout, &delim),
                drain_until_plain(stderr, &delim),
            );
            Ok::<_, ShellError>((stdout_res?, stderr_res?))
        };

        match tokio::time::timeout(deadline, run).await {
            Ok(Ok(((mut stdout_bytes, exit_code), stderr_bytes))) => {
                let stdout_total = stdout_bytes.len();
                let stderr_total = stderr_bytes.len();
                let stdout_passed_through = passthrough_stdout;
                if passthrough_stdout {
                    let mut stdout_sink = tokio::io::stdout();
                    stdout_sink.write_all(&stdout_bytes).await.ok();
                    stdout_sink.flush().await.ok();
                    stdout_bytes.clear();
                }
                let (stdout, stdout_truncated) = if stdout_passed_through {
                    (Vec::new(), false)
                } else {
                    truncate_bytes(stdout_bytes, self.output_cap)
                };
                let (stderr, stderr_truncated) = truncate_bytes(stderr_bytes, self.output_cap);
                Ok(ShellResult {
                    exit_code,
                    stdout,
                    stderr,
                    stdout_truncated,
                    stderr_truncated,
                    stdout_total_bytes: stdout_total,
                    stderr_total_bytes: stderr_total,
                    timed_out: false,
                    stdout_passed_through,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.kill_foreground_and_recycle().await?;
                Ok(ShellResult {
                    exit_code: -1,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    stdout_truncated: false,
                    stderr_truncated: false,
                    stdout_total_bytes: 0,
                    stderr_total_bytes: 0,
                    timed_out: true,
                    stdout_passed_through: false,
                })
            }
        }
    }

    /// Kills the coprocess's process group (the `sh -c` leader, which owns
    /// every descendant a command spawned) and respawns a fresh one.
    #[cfg(unix)]
    async fn kill_foreground_and_recycle(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(pid) = inner.child.id() {
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
        }
        inner.child.kill().await.ok();
        warn!("shell coprocess timed out; recycling");

        let host_stdout_fd = unsafe { libc::dup(1) };
        drop(inner);
        let fresh = Self::spawn(&self.shell_path, self.workdir.clone(), self.default_timeout, self.output_cap, host_stdout_fd).await?;
        let mut fresh_inner = fresh.inner.into_inner();
        let mut inner = self.inner.lock().await;
        std::mem::swap(&mut *inner, &mut fresh_inner);
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.child.kill().await.ok();
    }
}

/// Reads lines from `reader` until the line `"{delim}:{code}"` appears,
/// returning everything before it plus the parsed exit code.
async fn drain_until_status<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R, delim: &str) -> Result<(Vec<u8>, i32)> {
    let prefix = format!("{delim}:");
    let mut collected = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ShellError::Gone);
        }
        if let Some(code_str) = line.strip_prefix(&prefix) {
            let code: i32 = code_str.trim().parse().unwrap_or(-1);
            return Ok((collected, code));
        }
        collected.extend_from_slice(line.as_bytes());
    }
}

/// Reads lines from `reader` until the bare delimiter line appears.
async fn drain_until_plain<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R, delim: &str) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ShellError::Gone);
        }
        if line.trim_end_matches(['\n', '\r']) == delim {
            return Ok(collected);
        }
        collected.extend_from_slice(line.as_bytes());
    }
}

/// Caps a byte stream at `cap` bytes, appending a truncation footer on
/// overflow. `cap == 0` disables truncation.
fn truncate_bytes(mut bytes: Vec<u8>, cap: usize) -> (Vec<u8>, bool) {
    if cap == 0 || bytes.len() <= cap {
        return (bytes, false);
    }
    let total = bytes.len();
    bytes.truncate(cap);
    bytes.extend_from_slice(format!("\n...[Output Truncated, {total} bytes total]").as_bytes());
    (bytes, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── truncation ──

    #[test]
    fn short_output_is_not_truncated() {
        let (out, truncated) = truncate_bytes(b"hello".to_vec(), 100);
        assert_eq!(out, b"hello");
        assert!(!truncated);
    }

    #[test]
    fn long_output_is_capped_with_footer() {
        let input = vec![b'a'; 50];
        let (out, truncated) = truncate_bytes(input, 10);
        assert!(truncated);
        assert!(out.starts_with(&[b'a'; 10]));
        assert!(String::from_utf8_lossy(&out).contains("50 bytes total"));
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let input = vec![b'a'; 50];
        let (out, truncated) = truncate_bytes(input.clone(), 0);
        assert_eq!(out, input);
        assert!(!truncated);
    }

    // ── integration: real coprocess ──

    #[cfg(unix)]
    #[tokio::test]
    async fn preserves_cwd_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let host_stdout_fd = unsafe { libc::dup(1) };
        let shell = ShellCoprocess::spawn("/bin/sh", dir.path(), Duration::from_secs(5), 20_000, host_stdout_fd).await.unwrap();

        let r1 = shell.execute("cd /tmp", None, false).await.unwrap();
        assert_eq!(r1.exit_code, 0);

        let r2 = shell.execute("pwd", None, false).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&r2.stdout).trim(), "/tmp");
        shell.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let dir = tempfile::tempdir().unwrap();
        let host_stdout_fd = unsafe { libc::dup(1) };
        let shell = ShellCoprocess::spawn("/bin/sh", dir.path(), Duration::from_secs(5), 20_000, host_stdout_fd).await.unwrap();

        let r = shell.execute("echo out123; echo err123 >&2", None, false).await.unwrap();
        assert!(String::from_utf8_lossy(&r.stdout).contains("out123"));
        assert!(String::from_utf8_lossy(&r.stderr).contains("err123"));
        shell.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let host_stdout_fd = unsafe { libc::dup(1) };
        let shell = ShellCoprocess::spawn("/bin/sh", dir.path(), Duration::from_secs(5), 20_000, host_stdout_fd).await.unwrap();

        let r = shell.execute("exit 7", None, false).await.unwrap();
        assert_eq!(r.exit_code, 7);
        shell.shutdown().await;
    }
}
