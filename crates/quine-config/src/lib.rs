//! Configuration: a snapshot computed once at process start from
//! environment variables. This crate owns only the
//! snapshot and its env-var sourcing; out of scope for this mechanical
//! read is everything else a config layer could do — there is no remote
//! registry lookup, no file-based layering.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            other => bail!("QUINE_API_TYPE must be 'openai' or 'anthropic', got '{other}'"),
        }
    }

    fn fallback_key_env(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com",
            ProviderKind::Anthropic => "https://api.anthropic.com",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub model_id: String,
    pub provider: ProviderKind,
    pub api_base: String,
    pub api_key: String,
    pub context_window: Option<u32>,
    pub max_depth: u32,
    /// 0 = unlimited.
    pub max_turns: u32,
    pub session_id: String,
    pub parent_session_id: String,
    pub depth: u32,
    pub data_dir: PathBuf,
    pub shell: String,
    pub sh_timeout_secs: u64,
    pub output_truncate_bytes: usize,
    pub max_concurrent: usize,
    pub original_mission: Option<String>,
    pub stdin_offset: u64,
    pub wisdom: HashMap<String, String>,
    pub context_tape: Option<PathBuf>,
}

const DEFAULT_MAX_DEPTH: u32 = 5;
const DEFAULT_MAX_TURNS: u32 = 20;
const DEFAULT_DATA_DIR: &str = ".quine/";
const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_SH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_OUTPUT_TRUNCATE_BYTES: usize = 20_000;
const DEFAULT_MAX_CONCURRENT: usize = 4;

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        None => Ok(default),
        Some(v) => v.parse::<T>().map_err(|e| anyhow::anyhow!("{name}='{v}' is invalid: {e}")),
    }
}

impl Config {
    /// `mission` is the argv-joined mission string; it only fills
    /// `original_mission` when `QUINE_ORIGINAL_INTENT` (set by a parent
    /// across reincarnation) is absent.
    pub fn from_env(mission: &str) -> Result<Self> {
        let provider = match env_var("QUINE_API_TYPE") {
            Some(v) => ProviderKind::parse(&v)?,
            None => bail!("QUINE_API_TYPE is required (must be 'openai' or 'anthropic')"),
        };

        let model_id = env_var("QUINE_MODEL_ID").context("QUINE_MODEL_ID is required")?;

        let api_base = env_var("QUINE_API_BASE")
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| provider.default_base_url().to_string());

        let api_key = env_var("QUINE_API_KEY")
            .or_else(|| env_var(provider.fallback_key_env()))
            .with_context(|| format!("no API key: set QUINE_API_KEY or {}", provider.fallback_key_env()))?;

        let context_window = match env_var("QUINE_CONTEXT_WINDOW") {
            None => None,
            Some(v) => {
                let n: u32 = v.parse().map_err(|e| anyhow::anyhow!("QUINE_CONTEXT_WINDOW='{v}' is invalid: {e}"))?;
                if n == 0 {
                    None
                } else {
                    Some(n)
                }
            }
        };

        let max_depth = env_parse("QUINE_MAX_DEPTH", DEFAULT_MAX_DEPTH)?;
        let max_turns = env_parse("QUINE_MAX_TURNS", DEFAULT_MAX_TURNS)?;
        let data_dir = PathBuf::from(env_var("QUINE_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
        let shell = env_var("QUINE_SHELL").unwrap_or_else(|| DEFAULT_SHELL.to_string());
        let sh_timeout_secs = env_parse("QUINE_SH_TIMEOUT", DEFAULT_SH_TIMEOUT_SECS)?;
        let output_truncate_bytes = env_parse("QUINE_OUTPUT_TRUNCATE", DEFAULT_OUTPUT_TRUNCATE_BYTES)?;
        let max_concurrent = env_parse("QUINE_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT)?;

        let session_id = env_var("QUINE_SESSION_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let parent_session_id = env_var("QUINE_PARENT_SESSION").unwrap_or_default();
        let depth = env_parse("QUINE_DEPTH", 0u32)?;
        let original_mission = env_var("QUINE_ORIGINAL_INTENT").or_else(|| Some(mission.to_string()));
        let stdin_offset = env_parse("QUINE_STDIN_OFFSET", 0u64)?;
        let context_tape = env_var("QUINE_CONTEXT_TAPE").map(PathBuf::from);

        let mut wisdom = HashMap::new();
        for (k, v) in env::vars() {
            if let Some(key) = k.strip_prefix("QUINE_WISDOM_") {
                wisdom.insert(key.to_string(), v);
            }
        }

        Ok(Config {
            model_id,
            provider,
            api_base,
            api_key,
            context_window,
            max_depth,
            max_turns,
            session_id,
            parent_session_id,
            depth,
            data_dir,
            shell,
            sh_timeout_secs,
            output_truncate_bytes,
            max_concurrent,
            original_mission,
            stdin_offset,
            wisdom,
            context_tape,
        })
    }
}
