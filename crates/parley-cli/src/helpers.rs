//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, credential resolution from the
//! environment, and provider selection.

use std::io::{self, BufRead, Write as _};

use anyhow::{Context, Result, bail};
use parley_agent::{Credentials, ParleyConfig, ProviderRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::ChatArgs;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Read a non-empty environment variable, returning `None` if unset or empty.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// The variable holding a provider's API key, e.g. `OPENAI_API_KEY`.
pub fn api_key_var(provider_id: &str) -> String {
    let stem: String = provider_id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{stem}_API_KEY")
}

/// Merge flags, environment and configuration into credentials.
///
/// Precedence for model and base URL: flag, then `PARLEY_MODEL` /
/// `PARLEY_BASE_URL`, then the configuration file.
pub fn resolve_credentials(
    provider_id: &str,
    args: &ChatArgs,
    config: &ParleyConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Credentials {
    let configured = config
        .credentials()
        .filter(|c| c.provider_id.eq_ignore_ascii_case(provider_id.trim()));
    let mut credentials = configured.unwrap_or_else(|| Credentials::new(provider_id.trim()));

    if let Some(model) = args.model.clone().or_else(|| env("PARLEY_MODEL")) {
        credentials = credentials.with_model(model);
    }
    if let Some(url) = env("PARLEY_BASE_URL") {
        credentials = credentials.with_base_url(url);
    }
    if let Some(key) = env(&api_key_var(provider_id)) {
        credentials = credentials.with_api_key(key);
    }
    credentials
}

// ---------------------------------------------------------------------------
// Provider selection
// ---------------------------------------------------------------------------

/// Ask the user which provider to use.
pub fn prompt_provider(registry: &ProviderRegistry, input: &mut impl BufRead) -> Result<String> {
    let choices = registry.provider_ids().join("/");
    loop {
        print!("Choose a provider ({choices}): ");
        io::stdout().flush().ok();

        let mut line = String::new();
        let read = input.read_line(&mut line).context("failed to read provider choice")?;
        if read == 0 {
            bail!("no provider chosen");
        }

        let choice = line.trim().to_lowercase();
        if registry.get(&choice).is_some() {
            info!(provider = %choice, "provider chosen");
            return Ok(choice);
        }
        if !choice.is_empty() {
            println!("Unknown provider `{choice}`.");
        }
    }
}

/// Print the provider table for `parley providers`.
pub fn print_providers() {
    let registry = ProviderRegistry::builtin();
    println!();
    println!("  {:<12} {:<30} {:<10} KEY", "PROVIDER", "DEFAULT MODEL", "MODE");
    for entry in registry.entries() {
        let key = if entry.requires_credential {
            api_key_var(&entry.provider_id)
        } else {
            "-".to_owned()
        };
        println!(
            "  {:<12} {:<30} {:<10} {key}",
            entry.provider_id,
            entry.default_model_id,
            entry.encoding_mode.to_string()
        );
    }
    println!();
}
