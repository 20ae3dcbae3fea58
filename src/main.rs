// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::{IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use embla_core::{Agent, AgentEvent, RunOptions};
use embla_memory::{ConversationStore, JsonlConversationStore};
use embla_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "embla", about = "A local-first conversational agent runtime", version)]
struct Cli {
    /// The prompt to run.  Reads stdin when omitted and stdin is piped.
    prompt: Vec<String>,

    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session to run in
    #[arg(short, long, default_value = "cli:default")]
    session: String,

    /// Log to stderr (RUST_LOG controls the filter)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the merged configuration and exit
    ShowConfig,
    /// List persisted sessions known to this runtime
    Sessions,
    /// Delete a session's history
    DeleteSession { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(embla_config::load(cli.config.as_deref())?);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml::to_string(config.as_ref()).unwrap_or_default());
                return Ok(());
            }
            Commands::Sessions => {
                let dir = sessions_dir(&config)?;
                if dir.is_dir() {
                    for entry in std::fs::read_dir(&dir)? {
                        let path = entry?.path();
                        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                                println!("{stem}");
                            }
                        }
                    }
                }
                return Ok(());
            }
            Commands::DeleteSession { id } => {
                let agent = build_agent(&config)?;
                agent
                    .delete_session(id)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                println!("deleted {id}");
                return Ok(());
            }
        }
    }

    let prompt = read_prompt(&cli)?;
    if prompt.trim().is_empty() {
        anyhow::bail!("no prompt given; pass it as an argument or pipe it on stdin");
    }

    let agent = build_agent(&config)?;

    // Stream events as they arrive: tokens to stdout, tool activity to
    // stderr so piped output stays clean.
    let (tx, mut rx) = tokio::sync::mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(ev) = rx.recv().await {
            match ev {
                AgentEvent::TextDelta(t) => {
                    let _ = write!(stdout, "{t}");
                    let _ = stdout.flush();
                }
                AgentEvent::RoutingDecision { target, provider, reason, .. } => {
                    tracing::info!(%target, %provider, reason, "routed");
                }
                AgentEvent::ToolCallStarted(call) => {
                    eprintln!("[tool] {} {}", call.name, call.args);
                }
                AgentEvent::ToolCallFinished { tool_name, is_error, .. } => {
                    if is_error {
                        eprintln!("[tool] {tool_name} failed");
                    }
                }
                AgentEvent::Escalated { reason } => {
                    eprintln!("[escalating to remote: {reason}]");
                }
                AgentEvent::Error(msg) => {
                    eprintln!("[error] {msg}");
                }
                _ => {}
            }
        }
    });

    let result = agent
        .run(
            &cli.session,
            &prompt,
            RunOptions { events: Some(tx), ..Default::default() },
        )
        .await;
    let _ = printer.await;

    match result {
        Ok(resp) => {
            // Streaming already printed the content; terminate the line.
            println!();
            tracing::debug!(
                target = %resp.target,
                provider = %resp.provider,
                turns = resp.turns,
                input_tokens = resp.usage.input_tokens,
                output_tokens = resp.usage.output_tokens,
                escalated = resp.escalated,
                "run complete"
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_prompt(cli: &Cli) -> anyhow::Result<String> {
    if !cli.prompt.is_empty() {
        return Ok(cli.prompt.join(" "));
    }
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let mut buf = String::new();
    stdin.read_to_string(&mut buf).context("reading prompt from stdin")?;
    Ok(buf)
}

fn sessions_dir(config: &embla_config::Config) -> anyhow::Result<PathBuf> {
    config
        .store
        .data_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| dirs::data_dir().map(|d| d.join("embla/sessions")))
        .context("no usable data directory for session storage")
}

fn build_agent(config: &Arc<embla_config::Config>) -> anyhow::Result<Agent> {
    let local = embla_model::from_config(&config.local)?;
    let store = JsonlConversationStore::open(sessions_dir(config)?)?;

    let mut agent = Agent::new(local, Arc::clone(config))
        .with_tools(Arc::new(ToolRegistry::new()))
        .with_conversations(Arc::new(store) as Arc<dyn ConversationStore>);

    if let Some(remote_cfg) = &config.remote {
        agent = agent.with_remote(embla_model::from_config(remote_cfg)?);
    }
    Ok(agent)
}
