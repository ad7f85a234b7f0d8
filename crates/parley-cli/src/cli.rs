//! CLI argument definitions for Parley.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use parley_agent::{DEFAULT_CONFIG_PATH, ParleyConfig};

/// Parley -- chat with a language model through a schema-checked agent.
#[derive(Parser)]
#[command(
    name = "parley",
    version,
    about = "Parley -- schema-checked chat with language models",
    long_about = "A terminal chat client whose replies are validated against a \
                  structured contract before they enter the conversation."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat session.
    Chat(ChatArgs),

    /// List the built-in providers.
    Providers,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ChatArgs {
    /// Provider id (e.g. openai, groq, ollama).  Asked for when omitted.
    #[arg(long, short)]
    pub provider: Option<String>,

    /// Model id override.
    #[arg(long, short)]
    pub model: Option<String>,

    /// Configuration file (TOML, or JSON by extension).  Defaults to
    /// `parley.toml` in the working directory, if present.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Print whole replies instead of streaming them.
    #[arg(long)]
    pub no_stream: bool,

    /// Log at debug level.
    #[arg(long, short)]
    pub verbose: bool,
}

impl ChatArgs {
    /// The configuration file this session reads.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load the configuration.  Only an explicitly named file is expected
    /// to exist.
    pub fn load_config(&self) -> parley_agent::Result<ParleyConfig> {
        match &self.config {
            Some(path) => ParleyConfig::load(path),
            None => ParleyConfig::load_optional(&self.config_path()),
        }
    }
}
