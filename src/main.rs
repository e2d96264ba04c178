mod cli;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use quine_config::Config;
use quine_core::{Counters, Reincarnator, TerminationCoordinator};
use quine_model::{Provider, ProviderKind as ModelProviderKind};
use quine_semaphore::Semaphore;
use quine_shell::ShellCoprocess;
use quine_tape::{Tape, TapeEntry};
use quine_tools::{ExecTool, ExitSignal, ExitTool, ForkContext, ForkTool, ReadTool, ShTool, StdinShim, ToolRegistry};

const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
const DEFAULT_FORK_WAIT_TIMEOUT_SECS: u64 = 120;
const STREAMING_STDIN_MARKER: &str = "[Streaming input available]";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let mission = cli.mission_string();

    let config = match Config::from_env(&mission) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("quine: {e:#}");
            std::process::exit(2);
        }
    };

    let exit_code = run(cli, config, mission).await?;
    std::process::exit(exit_code);
}

/// `QUINE_LOG` is checked before `RUST_LOG`, mirroring `sven`'s own
/// program-specific alias; either one takes the usual `EnvFilter` directive
/// syntax, including `off` to silence the log sink entirely per §7's
/// "configurable log sink... can be silenced" requirement.
fn init_logging() {
    let directive = std::env::var("QUINE_LOG").ok().or_else(|| std::env::var("RUST_LOG").ok());
    let filter = match directive {
        Some(d) => EnvFilter::try_new(&d).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::new("info"),
    };
    let _ = tracing_subscriber::registry().with(fmt::layer().with_target(false).with_writer(std::io::stderr)).with(filter).try_init();
}

async fn run(cli: Cli, config: Config, mission: String) -> Result<i32> {
    fs::create_dir_all(&config.data_dir).with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let tape_path = config.data_dir.join(format!("{}.jsonl", config.session_id));
    let tape = Arc::new(
        Tape::new(&tape_path, config.session_id.clone(), config.parent_session_id.clone(), config.depth, config.model_id.clone())
            .context("opening tape")?,
    );
    tape.append_meta().context("writing meta entry")?;

    if let Some(context_tape) = &config.context_tape {
        bootstrap_from_context_tape(&tape, context_tape)?;
    } else {
        seed_first_turn(&tape, &cli, &config, &mission)?;
    }

    let binary = std::env::current_exe().context("resolving own executable path")?;

    let host_stdout_fd = unsafe { libc::dup(1) };
    if host_stdout_fd < 0 {
        anyhow::bail!("failed to duplicate stdout for the shell coprocess: {}", std::io::Error::last_os_error());
    }
    let shell = Arc::new(
        ShellCoprocess::spawn(&config.shell, std::env::current_dir()?, Duration::from_secs(config.sh_timeout_secs), config.output_truncate_bytes, host_stdout_fd)
            .await
            .context("spawning shell coprocess")?,
    );
    let semaphore = Arc::new(Semaphore::new(config.data_dir.join("locks"), config.session_id.clone(), config.max_concurrent));
    let stdin_shim = Arc::new(StdinShim::new(config.stdin_offset));
    let exit_signal = ExitSignal::new();
    let counters = Arc::new(Counters::new());

    let reincarnator: Arc<dyn quine_tools::Reincarnator> = Arc::new(Reincarnator {
        binary: binary.clone(),
        original_mission: config.original_mission.clone().unwrap_or_else(|| mission.clone()),
        session_id: config.session_id.clone(),
        wisdom: config.wisdom.clone(),
        stdin_offset_provider: {
            let stdin_shim = stdin_shim.clone();
            Box::new(move || stdin_shim.offset())
        },
        tape: tape.clone(),
        counters: counters.clone(),
    });

    let fork_ctx = ForkContext {
        binary,
        session_id: config.session_id.clone(),
        depth: config.depth,
        max_depth: config.max_depth,
        data_dir: config.data_dir.clone(),
        tape_path: tape_path.clone(),
        default_wait_timeout: Duration::from_secs(DEFAULT_FORK_WAIT_TIMEOUT_SECS),
    };

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ShTool::new(shell.clone(), semaphore)));
    registry.register(Arc::new(ReadTool::new(stdin_shim)));
    registry.register(Arc::new(ForkTool::new(fork_ctx)));
    registry.register(Arc::new(ExecTool::new(reincarnator)));
    registry.register(Arc::new(ExitTool::new(exit_signal.clone())));

    let model_kind = match config.provider {
        quine_config::ProviderKind::Anthropic => ModelProviderKind::Anthropic,
        quine_config::ProviderKind::OpenAi => ModelProviderKind::OpenAi,
    };
    let model = Provider::new(model_kind, config.api_base.clone(), config.api_key.clone(), config.model_id.clone(), DEFAULT_MAX_OUTPUT_TOKENS, config.context_window);

    let termination = TerminationCoordinator::install();
    let stop = termination.should_stop();

    let result = quine_core::turn_loop::run(&tape, &model, &registry, &exit_signal, config.max_turns, &stop, &counters).await;

    shell.shutdown().await;

    Ok(termination.finalize(&tape, result.termination_mode, result.exit_decision, result.tokens_in, result.tokens_out, result.turn_count))
}

/// The first turn of a freshly started process (no prior context tape):
/// a system prompt built from configuration + wisdom, followed by a first
/// user message carrying either the binary-stdin file reference or the
/// streaming-stdin marker.
fn seed_first_turn(tape: &Tape, cli: &Cli, config: &Config, mission: &str) -> Result<()> {
    let system_prompt = quine_core::prompt::build_system_prompt(config.depth, config.max_depth, config.max_turns, &config.model_id, &config.session_id, &config.shell, &config.wisdom, mission);
    tape.append_message(quine_tape::Message::system(system_prompt)).context("writing system prompt")?;

    let material = if cli.binary_stdin {
        let dest = config.data_dir.join(format!("stdin-{}.bin", config.session_id));
        let mut input = Vec::new();
        std::io::Read::read_to_end(&mut std::io::stdin(), &mut input).context("draining stdin for binary mode")?;
        fs::write(&dest, &input).with_context(|| format!("writing binary stdin to {}", dest.display()))?;
        format!("Binary stdin captured at {}", dest.display())
    } else {
        STREAMING_STDIN_MARKER.to_string()
    };

    let first_user = quine_core::prompt::first_user_message(Some(&material));
    tape.append_message(first_user).context("writing first user message")
}

/// A reincarnated or forked process bootstraps its message history from a
/// prior tape instead of building a fresh system prompt: every `message`
/// and `tool_result` entry is replayed verbatim onto the new tape, which
/// already carries its own `meta` entry.
fn bootstrap_from_context_tape(tape: &Tape, context_tape: &Path) -> Result<()> {
    let source = Tape::new(context_tape, "bootstrap", "", 0, "bootstrap").context("opening context tape for bootstrap")?;
    for entry in source.read_entries().context("reading context tape")? {
        match entry {
            TapeEntry::Message(m) => tape.append_message(m)?,
            TapeEntry::ToolResult(r) => tape.append_tool_result(r)?,
            TapeEntry::Meta(_) | TapeEntry::Outcome(_) => {}
        }
    }
    Ok(())
}
