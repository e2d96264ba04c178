//! The termination coordinator: races agent volition
//! (the `exit` tool) against physical constraints (turn exhaustion,
//! context overflow, provider errors, OS signals), writes the outcome
//! entry exactly once, and calls process exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use quine_tape::{Outcome, Tape, TerminationMode};
use quine_tools::{ExitDecision, ExitStatus};
use tracing::info;

/// Installs SIGINT/SIGTERM/SIGHUP handlers at startup; the turn loop polls
/// [`TerminationCoordinator::should_stop`] between iterations so an
/// in-flight tool call always finishes before the loop observes the
/// signal. Interrupt and hangup map straight to `signal`; terminate is
/// "best-effort flush then signal" — in this design that is the same
/// path, since the loop's only flush action is the tape's per-append
/// `sync_all`, which has already happened for every entry by the time a
/// signal is observed.
pub struct TerminationCoordinator {
    stop: Arc<AtomicBool>,
    started_at: Instant,
}

impl TerminationCoordinator {
    /// Spawns background tasks listening for SIGINT/SIGTERM/SIGHUP and
    /// returns a coordinator whose `should_stop` flag they set.
    #[cfg(unix)]
    pub fn install() -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        for (kind, name) in [
            (tokio::signal::unix::SignalKind::interrupt(), "SIGINT"),
            (tokio::signal::unix::SignalKind::terminate(), "SIGTERM"),
            (tokio::signal::unix::SignalKind::hangup(), "SIGHUP"),
        ] {
            let stop = stop.clone();
            match tokio::signal::unix::signal(kind) {
                Ok(mut sig) => {
                    tokio::spawn(async move {
                        sig.recv().await;
                        info!(signal = name, "received signal; finalizing at next turn boundary");
                        stop.store(true, Ordering::SeqCst);
                    });
                }
                Err(e) => {
                    tracing::warn!(signal = name, error = %e, "failed to install signal handler");
                }
            }
        }
        Self { stop, started_at: Instant::now() }
    }

    #[cfg(not(unix))]
    pub fn install() -> Self {
        Self { stop: Arc::new(AtomicBool::new(false)), started_at: Instant::now() }
    }

    pub fn should_stop(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Writes the outcome entry and returns the OS exit code the caller
    /// should pass to `std::process::exit`. Does not itself call
    /// `process::exit` so that callers can run any cleanup (shell
    /// coprocess teardown, semaphore release) first: write the outcome
    /// entry, then let the caller call process exit with the code returned.
    pub fn finalize(&self, tape: &Tape, mode: TerminationMode, exit_decision: Option<ExitDecision>, tokens_in: u64, tokens_out: u64, turn_count: u32) -> i32 {
        let duration_ms = self.started_at.elapsed().as_millis() as i64;
        let (exit_code, stderr) = match (&mode, &exit_decision) {
            (TerminationMode::Exit, Some(d)) => (d.status.os_exit_code(), d.stderr.clone().unwrap_or_default()),
            (TerminationMode::Exit, None) => (0, String::new()),
            _ => (1, String::new()),
        };

        let outcome = Outcome { exit_code, duration_ms, stderr: stderr.clone(), tokens_in, tokens_out, turn_count, termination_mode: mode };
        if let Err(e) = tape.append_outcome(outcome) {
            tracing::error!(error = %e, "failed to append outcome entry; tape is incomplete");
        }

        if let Some(d) = &exit_decision {
            if d.status == ExitStatus::Failure {
                if let Some(text) = &d.stderr {
                    eprint!("{text}");
                }
            }
        }

        exit_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quine_tape::TapeEntry;
    use tempfile::tempdir;

    fn tape() -> Tape {
        let dir = tempdir().unwrap();
        let t = Tape::new(dir.path().join("s.jsonl"), "s1", "", 0, "m").unwrap();
        t.append_meta().unwrap();
        std::mem::forget(dir);
        t
    }

    // ── exit code mapping ──

    #[test]
    fn success_exit_maps_to_code_zero() {
        let coordinator = TerminationCoordinator { stop: Arc::new(AtomicBool::new(false)), started_at: Instant::now() };
        let tape = tape();
        let decision = ExitDecision { status: ExitStatus::Success, stderr: None };
        let code = coordinator.finalize(&tape, TerminationMode::Exit, Some(decision), 1, 2, 3);
        assert_eq!(code, 0);
    }

    #[test]
    fn failure_exit_maps_to_code_one() {
        let coordinator = TerminationCoordinator { stop: Arc::new(AtomicBool::new(false)), started_at: Instant::now() };
        let tape = tape();
        let decision = ExitDecision { status: ExitStatus::Failure, stderr: Some("boom".into()) };
        let code = coordinator.finalize(&tape, TerminationMode::Exit, Some(decision), 1, 2, 3);
        assert_eq!(code, 1);
    }

    #[test]
    fn every_non_exit_mode_maps_to_code_one() {
        let coordinator = TerminationCoordinator { stop: Arc::new(AtomicBool::new(false)), started_at: Instant::now() };
        for mode in [TerminationMode::TurnExhaustion, TerminationMode::ContextOverflow, TerminationMode::Signal, TerminationMode::Error] {
            let tape = tape();
            let code = coordinator.finalize(&tape, mode, None, 0, 0, 0);
            assert_eq!(code, 1, "{mode:?} must map to exit code 1");
        }
    }

    // ── outcome is always the terminal tape entry ──

    #[test]
    fn outcome_entry_is_appended_and_carries_counts() {
        let coordinator = TerminationCoordinator { stop: Arc::new(AtomicBool::new(false)), started_at: Instant::now() };
        let tape = tape();
        coordinator.finalize(&tape, TerminationMode::TurnExhaustion, None, 10, 20, 5);
        let entries = tape.read_entries().unwrap();
        match entries.last().unwrap() {
            TapeEntry::Outcome(o) => {
                assert_eq!(o.tokens_in, 10);
                assert_eq!(o.tokens_out, 20);
                assert_eq!(o.turn_count, 5);
                assert_eq!(o.termination_mode, TerminationMode::TurnExhaustion);
            }
            other => panic!("expected outcome, got {other:?}"),
        }
    }
}
