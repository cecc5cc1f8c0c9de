#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use turnstile::context::SessionKey;
use turnstile::{SessionCommands, SessionOrchestrator, TurnstileConfig};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `Turnstile` - one reasoning cycle per chat session at a time.
#[derive(Parser, Debug)]
#[command(name = "turnstile")]
#[command(version)]
#[command(about = "Per-session locking and context lifecycle for chat reasoning.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the webhook gateway
    #[command(long_about = "\
Start the webhook gateway.

Accepts inbound chat messages on POST /webhook and runs one reasoning \
cycle per session at a time. Bind address defaults to the values in \
your config file (gateway.host / gateway.port).

Examples:
  turnstile serve                  # use config defaults
  turnstile serve -p 8080          # listen on port 8080
  turnstile serve --host 0.0.0.0   # bind to all interfaces")]
    Serve {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Show effective configuration
    Status,

    /// Inspect or reset stored session state
    Session {
        #[command(subcommand)]
        session_command: SessionCommands,
    },

    /// Manage configuration
    #[command(long_about = "\
Manage Turnstile configuration.

Use 'schema' to dump the full JSON Schema for the config file, which \
documents every available key, type, and default value.

Examples:
  turnstile config schema              # print JSON Schema to stdout
  turnstile config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `turnstile`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(turnstile completions bash)
  turnstile completions zsh > ~/.zfunc/_turnstile")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("TURNSTILE_CONFIG_DIR", config_dir);
    }

    // Completions and the schema stay stdout-only: no config load, no logging.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout().lock();
            return write_shell_completion(*shell, &mut stdout);
        }
        Commands::Config {
            config_command: ConfigCommands::Schema,
        } => {
            let schema = schemars::schema_for!(TurnstileConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let mut config = TurnstileConfig::load_or_init().await?;

    match cli.command {
        Commands::Completions { .. } | Commands::Config { .. } => Ok(()),

        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if config.tenants.is_empty() {
                tracing::warn!(
                    "no tenants configured; every message will get the configuration-issue reply"
                );
            }
            info!(
                "Starting Turnstile gateway on {}:{}",
                config.gateway.host, config.gateway.port
            );
            let orchestrator = Arc::new(SessionOrchestrator::build(&config)?);
            turnstile::gateway::run_gateway(&config.gateway, orchestrator).await
        }

        Commands::Status => {
            print_status(&config);
            Ok(())
        }

        Commands::Session { session_command } => {
            handle_session_command(session_command, &config).await
        }
    }
}

fn print_status(config: &TurnstileConfig) {
    let s = &config.session;
    println!("Turnstile {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Config:      {}", config.config_path.display());
    println!(
        "Store:       {} ({})",
        config.store.backend, config.store.path
    );
    println!("Engine:      {}", config.engine.kind);
    println!("Record sync: {}", config.record_sync.kind);
    println!(
        "Gateway:     {}:{} (signed webhooks: {})",
        config.gateway.host,
        config.gateway.port,
        if config.gateway.webhook_secret.is_some() {
            "on"
        } else {
            "off"
        }
    );
    println!();
    println!("Session:");
    println!("  Lock TTL:          {}s", s.lock_ttl_secs);
    println!("  Step deadline:     {}s", s.step_deadline().as_secs());
    println!("  Active TTL:        {}s", s.active_ttl_secs);
    println!("  Persistent TTL:    {}s", s.persistent_ttl_secs);
    println!("  Max steps/cycle:   {}", s.max_reasoning_steps);
    println!("  Max chained:       {}", s.max_chained_cycles);
    println!();
    let mut tenants: Vec<_> = config.tenants.iter().collect();
    tenants.sort_by(|a, b| a.0.cmp(b.0));
    println!("Tenants ({}):", tenants.len());
    for (id, tenant) in tenants {
        println!("  {id:<12} {}", tenant.name);
    }
}

async fn handle_session_command(command: SessionCommands, config: &TurnstileConfig) -> Result<()> {
    let orchestrator = SessionOrchestrator::build(config)?;
    match command {
        SessionCommands::Show { tenant, contact } => {
            let key = SessionKey::parse(tenant, contact)?;
            let summary = orchestrator.contexts().summary(&key).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        SessionCommands::Clear {
            tenant,
            contact,
            yes,
        } => {
            let key = SessionKey::parse(tenant, contact)?;
            if let Some((holder, ttl)) = orchestrator.locks().holder(&key).await? {
                println!(
                    "Session {key} is locked by {holder} ({}s left); its cycle will be discarded.",
                    ttl.as_secs()
                );
            }
            if !yes && !confirm(&format!("Delete all stored state for session {key}?"))? {
                println!("Aborted.");
                return Ok(());
            }
            let removed = orchestrator.contexts().delete_all(&key).await?;
            println!("Removed {removed} key(s) for session {key}.");
            Ok(())
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, Parser};

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn completions_cli_parses_supported_shells() {
        for shell in ["bash", "fish", "zsh", "powershell", "elvish"] {
            let cli = Cli::try_parse_from(["turnstile", "completions", shell])
                .expect("completions invocation should parse");
            match cli.command {
                Commands::Completions { .. } => {}
                other => panic!("expected completions command, got {other:?}"),
            }
        }
    }

    #[test]
    fn completion_generation_mentions_binary_name() {
        let mut output = Vec::new();
        write_shell_completion(CompletionShell::Bash, &mut output)
            .expect("completion generation should succeed");
        let script = String::from_utf8(output).expect("completion output should be valid utf-8");
        assert!(
            script.contains("turnstile"),
            "completion script should reference binary name"
        );
    }

    #[test]
    fn session_clear_parses_yes_flag() {
        let cli = Cli::try_parse_from(["turnstile", "session", "clear", "74274", "12345", "--yes"])
            .expect("session clear should parse");
        match cli.command {
            Commands::Session {
                session_command:
                    SessionCommands::Clear {
                        tenant,
                        contact,
                        yes,
                    },
            } => {
                assert_eq!((tenant.as_str(), contact.as_str(), yes), ("74274", "12345", true));
            }
            other => panic!("expected session clear, got {other:?}"),
        }
    }

    #[test]
    fn serve_overrides_are_optional() {
        let cli = Cli::try_parse_from(["turnstile", "serve", "-p", "0"]).unwrap();
        match cli.command {
            Commands::Serve { port, host } => {
                assert_eq!(port, Some(0));
                assert!(host.is_none());
            }
            other => panic!("expected serve, got {other:?}"),
        }
    }
}
