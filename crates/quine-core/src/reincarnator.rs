//! The reincarnator: serializes wisdom + the original
//! mission into the environment, seeks stdin to its resume offset, writes
//! a closing outcome entry, and replaces the process image. This is OS
//! image replacement, not an exception or a coroutine — on success this
//! function never returns to its caller.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use quine_tape::{Outcome, Tape, TerminationMode};
use quine_tools::builtin::exec::Reincarnator as ReincarnatorTrait;
use tracing::error;

use crate::Counters;

#[derive(Debug, thiserror::Error)]
pub enum ReincarnationError {
    #[error("reincarnation would exceed the environment block limit ({needed} bytes > {limit} bytes)")]
    EnvironmentTooLarge { needed: usize, limit: usize },
    #[error("tape write failed before image replacement: {0}")]
    Tape(#[from] quine_tape::TapeError),
    #[error("process image replacement failed: {0}")]
    Exec(io::Error),
}

impl From<ReincarnationError> for io::Error {
    fn from(e: ReincarnationError) -> Self {
        match e {
            ReincarnationError::Exec(inner) => inner,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Everything `reincarnate` needs that isn't already in the process
/// environment: the original mission, the wisdom map, the stdin resume
/// offset, and the tape to close out before the image goes away.
pub struct Reincarnator {
    pub binary: PathBuf,
    pub original_mission: String,
    pub session_id: String,
    pub wisdom: HashMap<String, String>,
    pub stdin_offset_provider: Box<dyn Fn() -> u64 + Send + Sync>,
    pub tape: std::sync::Arc<Tape>,
    pub counters: std::sync::Arc<Counters>,
}

/// Sanitizes a wisdom key into a valid environment-variable suffix:
/// uppercase, non-alphanumeric runs collapsed to a single underscore.
fn sanitize_wisdom_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_was_sep = false;
    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// The OS-imposed environment-block limit, queried via `sysconf(_SC_ARG_MAX)`
/// (the same ceiling shared by argv and the environment on Linux). Falls
/// back to a conservative 128 KiB if the query fails.
#[cfg(unix)]
fn env_block_limit() -> usize {
    let lim = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
    if lim > 0 {
        lim as usize
    } else {
        128 * 1024
    }
}

#[cfg(not(unix))]
fn env_block_limit() -> usize {
    128 * 1024
}

impl Reincarnator {
    fn build_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = std::env::vars().filter(|(k, _)| k != "QUINE_SESSION_ID").collect();
        env.retain(|(k, _)| !matches!(k.as_str(), "QUINE_DEPTH" | "QUINE_PARENT_SESSION" | "QUINE_ORIGINAL_INTENT" | "QUINE_STDIN_OFFSET") && !k.starts_with("QUINE_WISDOM_"));

        env.push(("QUINE_DEPTH".to_string(), "0".to_string()));
        env.push(("QUINE_PARENT_SESSION".to_string(), self.session_id.clone()));
        env.push(("QUINE_ORIGINAL_INTENT".to_string(), self.original_mission.clone()));
        env.push(("QUINE_STDIN_OFFSET".to_string(), (self.stdin_offset_provider)().to_string()));

        for (key, value) in &self.wisdom {
            env.push((format!("QUINE_WISDOM_{}", sanitize_wisdom_key(key)), value.clone()));
        }
        env
    }

    fn env_block_size(env: &[(String, String)]) -> usize {
        // `KEY=value\0` per POSIX environ entry, plus pointer slot; the
        // pointer table is negligible next to the string data at the sizes
        // this matters for, so we approximate with the string bytes alone.
        env.iter().map(|(k, v)| k.len() + 1 + v.len() + 1).sum()
    }

    /// Seeks this process's own stdin to `offset` if it is a seekable file;
    /// a pipe (`ESPIPE`) is left untouched — best effort, since excess
    /// buffered bytes on a non-seekable stdin simply cannot be recovered.
    #[cfg(unix)]
    fn seek_stdin(offset: u64) {
        use std::os::unix::io::RawFd;
        const STDIN_FD: RawFd = 0;
        let result = unsafe { libc::lseek(STDIN_FD, offset as libc::off_t, libc::SEEK_SET) };
        if result < 0 {
            tracing::debug!(offset, "stdin not seekable; leaving untouched (best effort)");
        }
    }

    #[cfg(not(unix))]
    fn seek_stdin(_offset: u64) {}

    fn reincarnate_inner(&self, persona: Option<&str>, reason: Option<&str>) -> Result<(), ReincarnationError> {
        let env = self.build_env();
        let needed = Self::env_block_size(&env);
        let limit = env_block_limit();
        if needed > limit {
            return Err(ReincarnationError::EnvironmentTooLarge { needed, limit });
        }

        let stderr_note = match (persona, reason) {
            (Some(p), Some(r)) => format!("reincarnating as '{p}': {r}"),
            (Some(p), None) => format!("reincarnating as '{p}'"),
            (None, Some(r)) => format!("reincarnating: {r}"),
            (None, None) => "reincarnating".to_string(),
        };

        let outcome = Outcome {
            exit_code: 0,
            duration_ms: 0,
            stderr: stderr_note,
            tokens_in: self.counters.tokens_in(),
            tokens_out: self.counters.tokens_out(),
            turn_count: self.counters.turn_count(),
            termination_mode: TerminationMode::Exit,
        };
        self.tape.append_outcome(outcome)?;

        Self::seek_stdin((self.stdin_offset_provider)());

        let mut cmd = Command::new(&self.binary);
        cmd.arg(&self.original_mission).env_clear().envs(env);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let err = cmd.exec();
            return Err(ReincarnationError::Exec(err));
        }
        #[cfg(not(unix))]
        {
            let err = io::Error::new(io::ErrorKind::Unsupported, "process image replacement requires unix");
            Err(ReincarnationError::Exec(err))
        }
    }
}

impl ReincarnatorTrait for Reincarnator {
    fn reincarnate(&self, persona: Option<&str>, reason: Option<&str>) -> io::Error {
        match self.reincarnate_inner(persona, reason) {
            Ok(()) => unreachable!("successful reincarnation never returns"),
            Err(e) => {
                error!(error = %e, "reincarnation failed; continuing current process");
                e.into()
            }
        }
    }
}
