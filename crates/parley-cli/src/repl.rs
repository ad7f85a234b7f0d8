//! Subcommand: `parley chat` -- interactive chat loop.
//!
//! Prints the greeting, then reads one line per turn after a `You:` prompt.
//! Replies are streamed into a redrawn `Agent:` line when the backend
//! supports it.  A failed turn is reported and the session continues.

use std::io::{self, BufRead, Write as _};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{info, warn};

use parley_agent::{
    AgentConfig, AgentRuntime, ConversationMemory, GenerationClient, GenerationConfig,
    Payload, ProviderRegistry, RetentionPolicy, SchemaContract,
};

use crate::cli::ChatArgs;
use crate::helpers::{env_non_empty, init_tracing, prompt_provider, resolve_credentials};

/// Run the interactive chat session.
pub async fn cmd_chat(args: ChatArgs) -> Result<()> {
    init_tracing(if args.verbose { "debug" } else { "warn" });
    dotenvy::dotenv().ok();

    let config = args
        .load_config()
        .with_context(|| format!("failed to load {}", args.config_path().display()))?;
    let registry = ProviderRegistry::builtin();

    let provider = match args.provider.clone().or_else(|| config.provider.id.clone()) {
        Some(provider) => provider,
        None => prompt_provider(&registry, &mut io::stdin().lock())?,
    };
    let credentials = resolve_credentials(&provider, &args, &config, env_non_empty);

    let generation = GenerationConfig::from(&config.generation);
    let adapter = registry
        .build_adapter_with_timeout(&credentials, generation.request_timeout)
        .with_context(|| format!("failed to set up provider `{provider}`"))?;
    let client = GenerationClient::new(Arc::new(adapter), generation);

    let memory = ConversationMemory::new(
        Payload::chat(config.agent.greeting.clone()),
        SchemaContract::input(),
        SchemaContract::output(),
        RetentionPolicy::from(&config.memory),
    )
    .context("configured greeting is not a valid reply")?;
    let runtime = AgentRuntime::new(memory, client, AgentConfig::from(&config));

    let stream = config.agent.stream && !args.no_stream && runtime.descriptor().supports_streaming;
    info!(
        provider = %runtime.descriptor().provider_id,
        model = %runtime.descriptor().model_id,
        stream,
        "chat session started"
    );

    println!("Agent: {}", display_text(runtime.greeting()));

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("You: ");
        io::stdout().flush().ok();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                info!("EOF received, exiting");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("  Error reading input: {e}");
                continue;
            }
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if is_exit_command(input) {
            println!("Exiting chat...");
            break;
        }

        let outcome = if stream {
            stream_turn(&runtime, input).await
        } else {
            runtime
                .handle_user_input(input)
                .await
                .map(|reply| println!("Agent: {}", display_text(&reply)))
        };
        if let Err(e) = outcome {
            warn!(error = %e, "turn failed");
            eprintln!("  Error: {e}");
        }
    }

    Ok(())
}

async fn stream_turn(runtime: &AgentRuntime, input: &str) -> parley_agent::Result<()> {
    let mut snapshots = runtime.handle_user_input_streaming(input)?;
    let mut line = AgentLine::default();
    let mut stdout = io::stdout();

    while let Some(snapshot) = snapshots.next().await {
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                line.close(&mut stdout);
                return Err(e);
            }
        };
        let _ = stdout.write_all(line.render(&display_text(&snapshot.payload)).as_bytes());
        stdout.flush().ok();
    }
    line.close(&mut stdout);
    Ok(())
}

/// `/exit` and `/quit`, in any case.
fn is_exit_command(input: &str) -> bool {
    input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit")
}

/// What to show for a reply: its chat message, or the whole payload.
fn display_text(payload: &Payload) -> String {
    match payload.chat_message() {
        Some(text) => text.to_owned(),
        None => payload.to_message_content(),
    }
}

// ---------------------------------------------------------------------------
// Redrawn agent line
// ---------------------------------------------------------------------------

/// Tracks what has been printed for the reply in progress.
#[derive(Debug, Default)]
struct AgentLine {
    printed: Option<String>,
}

impl AgentLine {
    /// Terminal output that turns the current line into `text`.
    ///
    /// Extensions only print the new suffix; anything else clears the line
    /// and redraws it.
    fn render(&mut self, text: &str) -> String {
        let out = match &self.printed {
            None => format!("Agent: {text}"),
            Some(printed) if text.starts_with(printed.as_str()) => text[printed.len()..].to_owned(),
            Some(_) => format!("\r\x1b[2KAgent: {text}"),
        };
        self.printed = Some(text.to_owned());
        out
    }

    /// End the line if anything was printed.
    fn close(&mut self, out: &mut impl io::Write) {
        if self.printed.take().is_some() {
            let _ = writeln!(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exit_commands_ignore_case() {
        assert!(is_exit_command("/exit"));
        assert!(is_exit_command("/QUIT"));
        assert!(!is_exit_command("exit"));
        assert!(!is_exit_command("/exits"));
    }

    #[test]
    fn display_prefers_chat_message() {
        assert_eq!(display_text(&Payload::chat("hi")), "hi");
        let payload = Payload::new().with_field("mood", json!("calm"));
        assert_eq!(display_text(&payload), r#"{"mood":"calm"}"#);
    }

    #[test]
    fn agent_line_prints_suffixes() {
        let mut line = AgentLine::default();
        assert_eq!(line.render("H"), "Agent: H");
        assert_eq!(line.render("Hel"), "el");
        assert_eq!(line.render("Hel"), "");
        assert_eq!(line.render("Help"), "\r\x1b[2KAgent: Help");

        let mut out = Vec::new();
        line.close(&mut out);
        assert_eq!(out, b"\n");
        line.close(&mut out);
        assert_eq!(out, b"\n");
    }
}
