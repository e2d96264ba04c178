//! The per-process agent lifecycle engine: the turn
//! loop, the reincarnator, the termination coordinator, and the system
//! prompt builder. Everything leaf-ward of this crate (tape, semaphore,
//! protocol adapters, shell coprocess, tool dispatcher) is a dependency;
//! this crate is where they get wired into one running agent.

pub mod prompt;
pub mod reincarnator;
pub mod termination;
pub mod turn_loop;

#[cfg(any(test, feature = "mock-provider"))]
pub mod mock;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use quine_tape::TerminationMode;
use quine_tools::ExitDecision;

pub use reincarnator::Reincarnator;
pub use termination::TerminationCoordinator;
pub use turn_loop::LoopResult;

/// Live tokens-in/tokens-out/turn-count tally, shared (by reference) between
/// the turn loop, the reincarnator, and the termination coordinator — all
/// three need the running total at the moment their terminal path is
/// taken, not just at the very end of the process.
#[derive(Default)]
pub struct Counters {
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    turn_count: AtomicU32,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_usage(&self, input_tokens: u64, output_tokens: u64) {
        self.tokens_in.fetch_add(input_tokens, Ordering::SeqCst);
        self.tokens_out.fetch_add(output_tokens, Ordering::SeqCst);
    }

    pub fn increment_turn(&self) {
        self.turn_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count.load(Ordering::SeqCst)
    }

    pub fn tokens_in(&self) -> u64 {
        self.tokens_in.load(Ordering::SeqCst)
    }

    pub fn tokens_out(&self) -> u64 {
        self.tokens_out.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, termination_mode: TerminationMode, exit_decision: Option<ExitDecision>) -> LoopResult {
        LoopResult {
            termination_mode,
            exit_decision,
            tokens_in: self.tokens_in(),
            tokens_out: self.tokens_out(),
            turn_count: self.turn_count(),
        }
    }
}
