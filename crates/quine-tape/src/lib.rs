//! The tape: an append-only, per-session JSONL log.
//!
//! One file per session (`<data-dir>/{session-id}.jsonl`). Every entry is a
//! single line `{ "type": "<kind>", "data": <object> }`. The writer flushes
//! and `sync_all`s after every append so a killed process leaves at worst a
//! truncated final line, never a torn earlier one. Readers tolerate that:
//! `Tape::read_entries` stops at the first line it cannot parse instead of
//! erroring out, mirroring a write-ahead log's corruption handling.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TapeError {
    #[error("tape io error: {0}")]
    Io(#[from] io::Error),
    #[error("tape encode/decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt tape line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

pub type Result<T> = std::result::Result<T, TapeError>;

/// `role ∈ {system, user, assistant, tool_result}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// `(id, name, arguments-as-JSON-object)`. The id is provider-assigned and
/// must be echoed back verbatim in the matching tool_result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A message record. Invariant: a message with a non-empty `tool_calls` must
/// be `role = Assistant`; a message with `tool_id` must be `role = ToolResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolInvocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    /// Milliseconds since epoch. Zero means "stamp at append time".
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), tool_calls: None, tool_id: None, timestamp: 0 }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_calls: None, tool_id: None, timestamp: 0 }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        let tool_calls = if tool_calls.is_empty() { None } else { Some(tool_calls) };
        Self { role: Role::Assistant, content: content.into(), tool_calls, tool_id: None, timestamp: 0 }
    }

    pub fn tool_result(tool_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::ToolResult,
            content: content.into(),
            tool_calls: None,
            tool_id: Some(tool_id.into()),
            timestamp: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub session_id: String,
    pub parent_session_id: String,
    pub depth: u32,
    pub model_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub tool_id: String,
    pub content: String,
    pub is_error: bool,
}

/// `termination_mode ∈ {exit, turn_exhaustion, context_overflow, signal, error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMode {
    Exit,
    TurnExhaustion,
    ContextOverflow,
    Signal,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub exit_code: i32,
    pub duration_ms: i64,
    pub stderr: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub turn_count: u32,
    pub termination_mode: TerminationMode,
}

/// A decoded tape line. `data` carries the kind-specific payload.
#[derive(Debug, Clone)]
pub enum TapeEntry {
    Meta(Meta),
    Message(Message),
    ToolResult(ToolResultEntry),
    Outcome(Outcome),
}

#[derive(Serialize, Deserialize)]
struct WireEntry<T> {
    #[serde(rename = "type")]
    kind: String,
    data: T,
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    data: Value,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn write_entry<T: Serialize>(file: &mut File, kind: &str, data: &T) -> Result<()> {
    let wire = WireEntry { kind: kind.to_string(), data };
    let mut line = serde_json::to_vec(&wire)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.sync_all()?;
    Ok(())
}

/// Single-writer append log, one file per session. The internal mutex around
/// the file handle is what the turn loop and any concurrently-running tool
/// dispatch (tool results may be appended from a spawned task) serialize
/// through; there is exactly one `Tape` per process.
pub struct Tape {
    file: Mutex<File>,
    path: PathBuf,
    session_id: String,
    parent_session_id: String,
    depth: u32,
    model_id: String,
}

impl Tape {
    /// Opens (creating if absent) the tape file at `path`. Does not write the
    /// `meta` entry; call [`Tape::append_meta`] once, immediately after.
    pub fn new(
        path: impl Into<PathBuf>,
        session_id: impl Into<String>,
        parent_session_id: impl Into<String>,
        depth: u32,
        model_id: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            session_id: session_id.into(),
            parent_session_id: parent_session_id.into(),
            depth,
            model_id: model_id.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn append_meta(&self) -> Result<()> {
        let meta = Meta {
            session_id: self.session_id.clone(),
            parent_session_id: self.parent_session_id.clone(),
            depth: self.depth,
            model_id: self.model_id.clone(),
            created_at: now_millis(),
        };
        let mut file = self.file.lock().unwrap();
        write_entry(&mut file, "meta", &meta)
    }

    pub fn append_message(&self, mut msg: Message) -> Result<Message> {
        if msg.timestamp == 0 {
            msg.timestamp = now_millis();
        }
        let mut file = self.file.lock().unwrap();
        write_entry(&mut file, "message", &msg)?;
        Ok(msg)
    }

    pub fn append_tool_result(&self, tr: ToolResultEntry) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        write_entry(&mut file, "tool_result", &tr)
    }

    pub fn append_outcome(&self, outcome: Outcome) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        write_entry(&mut file, "outcome", &outcome)
    }

    /// Returns a defensive copy of every entry parsed so far, tolerating a
    /// truncated/corrupt trailing line by stopping before it.
    pub fn read_entries(&self) -> Result<Vec<TapeEntry>> {
        Self::read_entries_at(&self.path)
    }

    pub fn read_entries_at(path: &Path) -> Result<Vec<TapeEntry>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                // A truncated final line (killed mid-write) surfaces as an
                // I/O error reading UTF-8/line boundaries; stop, don't fail.
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let envelope: WireEnvelope = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(_) => break,
            };
            let entry = match envelope.kind.as_str() {
                "meta" => serde_json::from_value(envelope.data).ok().map(TapeEntry::Meta),
                "message" => serde_json::from_value(envelope.data).ok().map(TapeEntry::Message),
                "tool_result" => serde_json::from_value(envelope.data).ok().map(TapeEntry::ToolResult),
                "outcome" => serde_json::from_value(envelope.data).ok().map(TapeEntry::Outcome),
                _ => None,
            };
            match entry {
                Some(e) => entries.push(e),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Reconstructs the message history the provider should see: `message`
    /// entries as-is, `tool_result` entries folded into a synthetic
    /// `Message { role: ToolResult, .. }` in tape order.
    pub fn messages(&self) -> Result<Vec<Message>> {
        Ok(self
            .read_entries()?
            .into_iter()
            .filter_map(|e| match e {
                TapeEntry::Message(m) => Some(m),
                TapeEntry::ToolResult(tr) => Some(Message::tool_result(tr.tool_id, tr.content)),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tape_at(dir: &Path, session: &str) -> Tape {
        Tape::new(dir.join(format!("{session}.jsonl")), session, "", 0, "test-model").unwrap()
    }

    // ── construction & meta ──

    #[test]
    fn new_creates_parent_dir_and_file() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("s1.jsonl");
        let tape = Tape::new(&nested, "s1", "", 0, "m").unwrap();
        tape.append_meta().unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn meta_is_first_entry() {
        let dir = tempdir().unwrap();
        let tape = tape_at(dir.path(), "s1");
        tape.append_meta().unwrap();
        tape.append_message(Message::user("hi")).unwrap();
        let entries = tape.read_entries().unwrap();
        assert!(matches!(entries[0], TapeEntry::Meta(_)));
    }

    // ── message / tool_result round trip ──

    #[test]
    fn message_and_tool_result_appear_in_order() {
        let dir = tempdir().unwrap();
        let tape = tape_at(dir.path(), "s1");
        tape.append_meta().unwrap();
        let calls = vec![ToolInvocation { id: "tc1".into(), name: "sh".into(), arguments: serde_json::json!({}) }];
        tape.append_message(Message::assistant("", calls)).unwrap();
        tape.append_tool_result(ToolResultEntry { tool_id: "tc1".into(), content: "ok".into(), is_error: false })
            .unwrap();

        let msgs = tape.messages().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::Assistant);
        assert_eq!(msgs[1].role, Role::ToolResult);
        assert_eq!(msgs[1].tool_id.as_deref(), Some("tc1"));
    }

    #[test]
    fn zero_timestamp_is_stamped_at_append() {
        let dir = tempdir().unwrap();
        let tape = tape_at(dir.path(), "s1");
        tape.append_meta().unwrap();
        let stamped = tape.append_message(Message::user("hi")).unwrap();
        assert!(stamped.timestamp > 0);
    }

    // ── outcome / terminal state ──

    #[test]
    fn outcome_is_last_entry() {
        let dir = tempdir().unwrap();
        let tape = tape_at(dir.path(), "s1");
        tape.append_meta().unwrap();
        tape.append_message(Message::user("hi")).unwrap();
        tape.append_outcome(Outcome {
            exit_code: 0,
            duration_ms: 5,
            stderr: String::new(),
            tokens_in: 1,
            tokens_out: 2,
            turn_count: 1,
            termination_mode: TerminationMode::Exit,
        })
        .unwrap();
        let entries = tape.read_entries().unwrap();
        assert!(matches!(entries.last().unwrap(), TapeEntry::Outcome(_)));
    }

    // ── corruption tolerance ──

    #[test]
    fn tolerates_truncated_trailing_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        {
            let tape = Tape::new(&path, "s1", "", 0, "m").unwrap();
            tape.append_meta().unwrap();
            tape.append_message(Message::user("hi")).unwrap();
        }
        // Simulate a process kill mid-write: append a non-JSON partial line.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"type\":\"message\",\"data\":{\"role\":\"user\"").unwrap();

        let entries = Tape::read_entries_at(&path).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn read_entries_on_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let entries = Tape::read_entries_at(&dir.path().join("nope.jsonl")).unwrap();
        assert!(entries.is_empty());
    }
}
