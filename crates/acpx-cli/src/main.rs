//! acpx: headless command-line client for the Agent Client Protocol.
//!
//! Thin dispatcher over `acpx-session`. Sessions are persistent and named;
//! the heavy lifting (queue ownership, event log, agent connection) lives
//! in the library crates.

mod format;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use acpx_acp::StdioConnectionFactory;
use acpx_core::{config::default_state_dir, detail, AcpxConfig, OutputError, OutputErrorCode};
use acpx_session::{SendOptions, SendOutcome, SessionOrchestrator};
use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::format::{make_formatter, OutputMode};

/// Grace given to a cancelled prompt before the process exits on SIGINT.
const INTERRUPT_GRACE: Duration = Duration::from_millis(2500);

#[derive(Parser)]
#[command(name = "acpx", version, about = "Headless ACP client with persistent sessions")]
struct Cli {
    /// State directory (default: ~/.acpx)
    #[arg(long, global = true, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    output: OutputMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct SessionSelector {
    /// Session id or unique id suffix
    #[arg(long, value_name = "ID")]
    session: Option<String>,

    /// Agent command used to spawn / identify the session's agent
    #[arg(long, value_name = "CMD")]
    agent: Option<String>,

    /// Workspace directory (default: current directory)
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Session name; omit for the default-for-directory session
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Send a prompt to a session, creating it if needed
    Send {
        #[command(flatten)]
        selector: SessionSelector,

        /// Permission mode passed to the permission policy
        #[arg(long, default_value = "default")]
        mode: String,

        /// Non-interactive permission policy: "allow", "deny", or a JSON
        /// map of permission kinds to booleans
        #[arg(long, value_name = "JSON")]
        non_interactive_permissions: Option<String>,

        /// Per-operation deadline in milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Return as soon as the prompt is accepted
        #[arg(long)]
        no_wait: bool,

        /// The prompt text
        #[arg(required = true)]
        message: Vec<String>,
    },
    /// Cancel the active prompt of a session
    Cancel {
        #[command(flatten)]
        selector: SessionSelector,
    },
    /// Show a session's record and queue-owner health
    Status {
        #[command(flatten)]
        selector: SessionSelector,
    },
    /// List sessions, newest first
    Sessions {
        /// Only sessions for this agent command
        #[arg(long, value_name = "CMD")]
        agent: Option<String>,
    },
    /// Change the session mode (live or via a one-shot connection)
    SetMode {
        #[command(flatten)]
        selector: SessionSelector,

        mode_id: String,

        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Change a session config option
    SetConfig {
        #[command(flatten)]
        selector: SessionSelector,

        config_id: String,

        /// JSON value
        value: String,

        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Ensure a session exists for a directory, creating it if needed
    Ensure {
        #[command(flatten)]
        selector: SessionSelector,
    },
    /// Soft-close a session (the record stays on disk)
    Close {
        #[command(flatten)]
        selector: SessionSelector,
    },
}

fn build_config(state_dir: Option<PathBuf>) -> anyhow::Result<AcpxConfig> {
    let state_dir = match state_dir {
        Some(dir) => dir,
        None => default_state_dir().context("cannot determine home directory")?,
    };
    Ok(AcpxConfig::with_state_dir(state_dir))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            let output = err
                .downcast::<OutputError>()
                .unwrap_or_else(|err| OutputError::runtime(format!("{err:#}")));
            eprintln!("acpx: {}", output.message);
            if output.detail_code.as_deref() == Some(detail::INTERRUPTED) {
                return ExitCode::from(130);
            }
            ExitCode::from(output.code.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = build_config(cli.state_dir.clone())?;
    let factory = Arc::new(StdioConnectionFactory);
    let orchestrator = SessionOrchestrator::new(config, factory);
    let formatter = make_formatter(cli.output);

    match cli.command {
        Command::Send {
            selector,
            mode,
            non_interactive_permissions,
            timeout_ms,
            no_wait,
            message,
        } => {
            let record_id = resolve_session(&orchestrator, &selector).await?;
            let non_interactive = non_interactive_permissions
                .map(|raw| parse_json_arg(&raw, "--non-interactive-permissions"))
                .transpose()?;
            let options = SendOptions {
                message: message.join(" "),
                permission_mode: mode,
                non_interactive_permissions: non_interactive,
                timeout_ms,
                wait_for_completion: !no_wait,
            };

            let send = orchestrator.send(&record_id, options, formatter.as_ref());
            tokio::pin!(send);
            let outcome = tokio::select! {
                outcome = &mut send => outcome?,
                _ = tokio::signal::ctrl_c() => {
                    let err = orchestrator.interrupt(&record_id).await;
                    // Give the owner loop a moment to cancel and persist.
                    let _ = tokio::time::timeout(INTERRUPT_GRACE, &mut send).await;
                    formatter.on_error(&err);
                    formatter.flush();
                    return Err(err.into());
                }
            };
            formatter.flush();
            match outcome {
                SendOutcome::Completed(result) => {
                    tracing::debug!(stop_reason = ?result.stop_reason, "prompt completed");
                    Ok(ExitCode::SUCCESS)
                }
                SendOutcome::Enqueued {
                    session_id,
                    request_id,
                } => {
                    println!("enqueued {request_id} on {session_id}");
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
        Command::Cancel { selector } => {
            let record_id = resolve_session(&orchestrator, &selector).await?;
            let cancelled = orchestrator.cancel(&record_id).await?;
            println!("cancelled: {cancelled}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { selector } => {
            let record_id = resolve_session(&orchestrator, &selector).await?;
            let status = orchestrator.status(&record_id, formatter.as_ref()).await?;
            formatter.flush();
            if matches!(cli.output, OutputMode::Text) {
                println!(
                    "session {} owner_healthy={} queue_depth={}",
                    status.record.acpx_record_id, status.owner_healthy, status.queue_depth
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Sessions { agent } => {
            let sessions = match agent {
                Some(agent) => orchestrator.list_sessions_for_agent(&agent)?,
                None => orchestrator.list_sessions()?,
            };
            match cli.output {
                OutputMode::Json => {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                }
                _ => {
                    for record in sessions {
                        println!(
                            "{}\t{}\t{}\t{}{}",
                            record.acpx_record_id,
                            record.agent_command,
                            record.cwd.display(),
                            record.name.as_deref().unwrap_or("-"),
                            if record.closed { "\t(closed)" } else { "" }
                        );
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::SetMode {
            selector,
            mode_id,
            timeout_ms,
        } => {
            let record_id = resolve_session(&orchestrator, &selector).await?;
            orchestrator.set_mode(&record_id, &mode_id, timeout_ms).await?;
            println!("mode set: {mode_id}");
            Ok(ExitCode::SUCCESS)
        }
        Command::SetConfig {
            selector,
            config_id,
            value,
            timeout_ms,
        } => {
            let record_id = resolve_session(&orchestrator, &selector).await?;
            let value = parse_json_arg(&value, "value")?;
            let response = orchestrator
                .set_config_option(&record_id, &config_id, value, timeout_ms)
                .await?;
            println!("{}", serde_json::to_string(&response)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Ensure { selector } => {
            let outcome = ensure_from_selector(&orchestrator, &selector).await?;
            println!(
                "{} {}",
                if outcome.created { "created" } else { "found" },
                outcome.record.acpx_record_id
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Close { selector } => {
            let record_id = resolve_session(&orchestrator, &selector).await?;
            let record = orchestrator.close_session(&record_id).await?;
            println!("closed {}", record.acpx_record_id);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Turn the selector into a concrete record id: an explicit `--session`
/// wins; otherwise the directory walk (creating the session if needed).
async fn resolve_session(
    orchestrator: &SessionOrchestrator,
    selector: &SessionSelector,
) -> anyhow::Result<String> {
    if let Some(session) = &selector.session {
        return Ok(session.clone());
    }
    let outcome = ensure_from_selector(orchestrator, selector).await?;
    Ok(outcome.record.acpx_record_id)
}

async fn ensure_from_selector(
    orchestrator: &SessionOrchestrator,
    selector: &SessionSelector,
) -> anyhow::Result<acpx_session::EnsureOutcome> {
    let agent = selector.agent.clone().ok_or_else(|| {
        OutputError::new(
            OutputErrorCode::Usage,
            "--agent is required when no --session is given",
        )
    })?;
    let cwd = match &selector.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    Ok(orchestrator
        .ensure(&agent, &cwd, selector.name.as_deref())
        .await?)
}

fn parse_json_arg(raw: &str, what: &str) -> anyhow::Result<serde_json::Value> {
    if raw == "allow" || raw == "deny" {
        return Ok(serde_json::Value::String(raw.to_string()));
    }
    serde_json::from_str(raw).map_err(|err| {
        OutputError::new(OutputErrorCode::Usage, format!("{what} is not valid JSON: {err}")).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn json_arg_accepts_shorthand_and_json() {
        assert_eq!(
            parse_json_arg("allow", "x").unwrap(),
            serde_json::Value::String("allow".into())
        );
        assert_eq!(
            parse_json_arg(r#"{"edit":true}"#, "x").unwrap()["edit"],
            serde_json::Value::Bool(true)
        );
        assert!(parse_json_arg("{broken", "x").is_err());
    }

    #[test]
    fn send_parses_full_flag_set() {
        let cli = Cli::parse_from([
            "acpx",
            "--output",
            "json",
            "send",
            "--agent",
            "claude-code-acp",
            "--name",
            "review",
            "--timeout-ms",
            "5000",
            "--no-wait",
            "fix",
            "the",
            "bug",
        ]);
        match cli.command {
            Command::Send {
                selector,
                no_wait,
                timeout_ms,
                message,
                ..
            } => {
                assert_eq!(selector.agent.as_deref(), Some("claude-code-acp"));
                assert_eq!(selector.name.as_deref(), Some("review"));
                assert!(no_wait);
                assert_eq!(timeout_ms, Some(5000));
                assert_eq!(message.join(" "), "fix the bug");
            }
            _ => panic!("expected send"),
        }
    }
}
