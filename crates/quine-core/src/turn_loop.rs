//! The turn loop: alternates inference and tool dispatch,
//! `awaiting_model -> applying_tools -> awaiting_model -> ... -> terminal`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quine_model::{Message, ModelClient, ProviderError};
use quine_tape::{Tape, TerminationMode, ToolResultEntry};
use quine_tools::{ExitDecision, ExitSignal, ToolCall, ToolRegistry};
use tracing::{info, info_span, instrument, warn, Instrument};

use crate::Counters;

/// The reminder injected when the model replies without invoking any tool.
/// Every turn must invoke at least one tool, down to `exit`; rather than
/// abort the session on one lapse, we nudge the model and keep going —
/// bounded by the ordinary turn-count guard, so a model that never
/// recovers still terminates via `turn_exhaustion` rather than looping
/// forever.
const NO_TOOL_CALL_REMINDER: &str =
    "You did not invoke a tool. Every turn must invoke at least one tool; \
     call `exit` if the mission is complete.";

pub struct LoopResult {
    pub termination_mode: TerminationMode,
    pub exit_decision: Option<ExitDecision>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub turn_count: u32,
}

/// Drives one process's turn loop to completion. `max_turns = 0` means
/// unlimited. `should_stop` is polled between iterations so the
/// termination coordinator can cooperatively end the loop on a signal
/// without interrupting an in-flight tool call. `counters` is shared with
/// the reincarnator and termination coordinator, which both need the
/// live tokens/turn tally — the reincarnator to stamp an outcome entry
/// before replacing the process image mid-loop, the coordinator to do the
/// same on every other terminal path.
#[instrument(skip_all, fields(max_turns))]
pub async fn run(
    tape: &Tape,
    model: &dyn ModelClient,
    tools: &ToolRegistry,
    exit_signal: &Arc<ExitSignal>,
    max_turns: u32,
    should_stop: &AtomicBool,
    counters: &Counters,
) -> LoopResult {
    let schemas = tools.schemas();

    loop {
        if should_stop.load(Ordering::SeqCst) {
            return counters.snapshot(TerminationMode::Signal, None);
        }
        if max_turns > 0 && counters.turn_count() >= max_turns {
            return counters.snapshot(TerminationMode::TurnExhaustion, None);
        }

        // The turn number this iteration is about to produce — `turn_count()`
        // is still the prior turn's tally until `increment_turn()` below runs.
        let turn = counters.turn_count() + 1;
        let span = info_span!("turn_iteration", turn);
        let outcome = run_one_iteration(tape, model, tools, exit_signal, &schemas, counters).instrument(span).await;

        match outcome {
            IterationOutcome::Return(result) => return result,
            IterationOutcome::Continue => {}
        }
    }
}

/// One `awaiting_model -> applying_tools` cycle. Returns `Continue` to keep
/// looping, or `Return` with the terminal `LoopResult` the caller should
/// hand back immediately.
async fn run_one_iteration(
    tape: &Tape,
    model: &dyn ModelClient,
    tools: &ToolRegistry,
    exit_signal: &Arc<ExitSignal>,
    schemas: &[quine_model::ToolSchema],
    counters: &Counters,
) -> IterationOutcome {
    let messages = match tape.messages() {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "failed to read tape for next turn");
            return IterationOutcome::Return(counters.snapshot(TerminationMode::Error, None));
        }
    };

    let (assistant_msg, usage) = match model.generate(&messages, schemas).await {
        Ok(r) => r,
        Err(e) => {
            let mode = classify_provider_failure(&e);
            warn!(error = %e, ?mode, "provider call terminated the turn loop");
            return IterationOutcome::Return(counters.snapshot(mode, None));
        }
    };

    counters.add_usage(usage.input_tokens, usage.output_tokens);
    counters.increment_turn();

    let invocations = assistant_msg.tool_calls.clone().unwrap_or_default();
    if let Err(e) = tape.append_message(assistant_msg) {
        warn!(error = %e, "failed to append assistant message to tape");
        return IterationOutcome::Return(counters.snapshot(TerminationMode::Error, None));
    }

    if invocations.is_empty() {
        info!("assistant turn produced no tool invocation; injecting reminder");
        if tape.append_message(quine_tape::Message::user(NO_TOOL_CALL_REMINDER)).is_err() {
            return IterationOutcome::Return(counters.snapshot(TerminationMode::Error, None));
        }
        return IterationOutcome::Continue;
    }

    let mut exit_requested = false;
    for inv in &invocations {
        let call = ToolCall { id: inv.id.clone(), name: inv.name.clone(), args: inv.arguments.clone() };
        let output = tools.execute(&call).await;
        let entry = ToolResultEntry { tool_id: output.call_id.clone(), content: output.content.clone(), is_error: output.is_error };
        if let Err(e) = tape.append_tool_result(entry) {
            warn!(error = %e, "failed to append tool_result to tape");
            return IterationOutcome::Return(counters.snapshot(TerminationMode::Error, None));
        }
        // A successful `exec` replaces the process image and never
        // returns control here; reaching past `tools.execute` for an
        // `exec` call therefore means reincarnation failed, and its
        // error is already on the tape as an ordinary tool error — the
        // loop continues so the model can see it and retry, per the
        // "continue the current process" contract.
        if call.name == "exit" {
            exit_requested = true;
        }
    }

    if exit_requested {
        if let Some(decision) = exit_signal.take() {
            return IterationOutcome::Return(counters.snapshot(TerminationMode::Exit, Some(decision)));
        }
    }

    IterationOutcome::Continue
}

enum IterationOutcome {
    Return(LoopResult),
    Continue,
}

fn classify_provider_failure(e: &ProviderError) -> TerminationMode {
    if e.is_auth() {
        TerminationMode::Error
    } else if e.is_context_overflow() {
        TerminationMode::ContextOverflow
    } else {
        TerminationMode::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quine_model::{ToolInvocation, ToolSchema, Usage};
    use quine_tools::{ExitStatus, ExitTool, Tool};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct ScriptedModel {
        responses: StdMutex<Vec<Message>>,
        calls: AtomicU32,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Message>) -> Self {
            Self { responses: StdMutex::new(responses), calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn generate(&self, _messages: &[Message], _tools: &[ToolSchema]) -> Result<(Message, Usage), ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok((Message::assistant("idle", vec![]), Usage::default()));
            }
            Ok((responses.remove(0), Usage { input_tokens: 5, output_tokens: 3 }))
        }
        fn context_window(&self) -> u32 {
            100_000
        }
    }

    fn tape() -> Tape {
        let dir = tempdir().unwrap();
        let t = Tape::new(dir.path().join("s.jsonl"), "s1", "", 0, "m").unwrap();
        t.append_meta().unwrap();
        std::mem::forget(dir);
        t
    }

    fn exit_call(status: &str) -> ToolInvocation {
        ToolInvocation { id: "tc1".into(), name: "exit".into(), arguments: json!({"status": status}) }
    }

    // ── termination on exit ──

    #[tokio::test]
    async fn exit_success_short_circuits_with_exit_mode() {
        let tape = tape();
        let mut registry = ToolRegistry::new();
        let signal = ExitSignal::new();
        registry.register(Arc::new(ExitTool::new(signal.clone())));
        let model = ScriptedModel::new(vec![Message::assistant("", vec![exit_call("success")])]);
        let stop = AtomicBool::new(false);

        let result = run(&tape, &model, &registry, &signal, 10, &stop, &Counters::new()).await;
        assert_eq!(result.termination_mode, TerminationMode::Exit);
        assert_eq!(result.exit_decision.unwrap().status, ExitStatus::Success);
        assert_eq!(result.turn_count, 1);
    }

    // ── turn exhaustion ──

    #[tokio::test]
    async fn turn_exhaustion_when_max_turns_reached_without_exit() {
        let tape = tape();
        let registry = ToolRegistry::new();
        let signal = ExitSignal::new();
        // `sh` is unregistered, so each dispatched call becomes an error
        // tool_result, but the loop still counts the turn and continues.
        let model = ScriptedModel::new(vec![
            Message::assistant("", vec![ToolInvocation { id: "a".into(), name: "sh".into(), arguments: json!({}) }]),
            Message::assistant("", vec![ToolInvocation { id: "b".into(), name: "sh".into(), arguments: json!({}) }]),
        ]);
        let stop = AtomicBool::new(false);

        let result = run(&tape, &model, &registry, &signal, 1, &stop, &Counters::new()).await;
        assert_eq!(result.termination_mode, TerminationMode::TurnExhaustion);
        assert_eq!(result.turn_count, 1);
    }

    // ── signal cooperative stop ──

    #[tokio::test]
    async fn pending_signal_flag_stops_before_next_model_call() {
        let tape = tape();
        let registry = ToolRegistry::new();
        let signal = ExitSignal::new();
        let model = ScriptedModel::new(vec![]);
        let stop = AtomicBool::new(true);

        let result = run(&tape, &model, &registry, &signal, 10, &stop, &Counters::new()).await;
        assert_eq!(result.termination_mode, TerminationMode::Signal);
        assert_eq!(result.turn_count, 0);
    }

    // ── no-tool-call reminder ──

    #[tokio::test]
    async fn empty_tool_invocations_injects_reminder_and_continues() {
        let tape = tape();
        let mut registry = ToolRegistry::new();
        let signal = ExitSignal::new();
        registry.register(Arc::new(ExitTool::new(signal.clone())));
        let model = ScriptedModel::new(vec![Message::assistant("thinking out loud", vec![]), Message::assistant("", vec![exit_call("success")])]);
        let stop = AtomicBool::new(false);

        let result = run(&tape, &model, &registry, &signal, 10, &stop, &Counters::new()).await;
        assert_eq!(result.termination_mode, TerminationMode::Exit);
        assert_eq!(result.turn_count, 2);
        let messages = tape.messages().unwrap();
        assert!(messages.iter().any(|m| m.content.contains("did not invoke a tool")));
    }

    // ── context overflow / auth classification ──

    struct FailingModel(ProviderError);
    #[async_trait]
    impl ModelClient for FailingModel {
        async fn generate(&self, _messages: &[Message], _tools: &[ToolSchema]) -> Result<(Message, Usage), ProviderError> {
            Err(match &self.0 {
                ProviderError::Auth(s) => ProviderError::Auth(s.clone()),
                ProviderError::ContextOverflow(s) => ProviderError::ContextOverflow(s.clone()),
                _ => ProviderError::Http { status: 500, body: "x".into() },
            })
        }
        fn context_window(&self) -> u32 {
            1
        }
    }

    #[tokio::test]
    async fn context_overflow_error_terminates_with_that_mode() {
        let tape = tape();
        let registry = ToolRegistry::new();
        let signal = ExitSignal::new();
        let model = FailingModel(ProviderError::ContextOverflow("too long".into()));
        let stop = AtomicBool::new(false);

        let result = run(&tape, &model, &registry, &signal, 10, &stop, &Counters::new()).await;
        assert_eq!(result.termination_mode, TerminationMode::ContextOverflow);
    }

    #[tokio::test]
    async fn auth_error_terminates_with_error_mode() {
        let tape = tape();
        let registry = ToolRegistry::new();
        let signal = ExitSignal::new();
        let model = FailingModel(ProviderError::Auth("denied".into()));
        let stop = AtomicBool::new(false);

        let result = run(&tape, &model, &registry, &signal, 10, &stop, &Counters::new()).await;
        assert_eq!(result.termination_mode, TerminationMode::Error);
    }
}
