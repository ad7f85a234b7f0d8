//! CLI entry point for Parley.
//!
//! This binary provides the `parley` command with subcommands for chatting
//! with a model and listing the available providers.

mod cli;
mod helpers;
mod repl;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat(args) => repl::cmd_chat(args).await,
        Commands::Providers => {
            helpers::print_providers();
            Ok(())
        }
    }
}
