use clap::Parser;

/// quine — a recursive agent: a self-forking LLM process that talks to
/// itself through a persistent shell, a read shim on its own stdin, and
/// the ability to fork or reincarnate itself.
#[derive(Parser, Debug)]
#[command(name = "quine", version, about, long_about = None)]
pub struct Cli {
    /// Drain the whole of stdin to a file up front instead of exposing it
    /// to the `read` tool as a line stream.
    #[arg(short = 'b', long = "binary-stdin")]
    pub binary_stdin: bool,

    /// The mission. Positional words are concatenated with spaces.
    #[arg(required = true)]
    pub mission: Vec<String>,
}

impl Cli {
    pub fn mission_string(&self) -> String {
        self.mission.join(" ")
    }
}
