//! Portal — run tools through a warm, long-lived local server.
//!
//! Subcommands:
//! - `portal run TOOL [ARGS]...`: invoke a tool through the portal, starting one if needed
//! - `portal serve [ENDPOINT]`: run the portal itself (normally launched by `run`)
//! - `portal stop`: ask the running portal to shut down
//! - `portal status`: report whether a portal is running

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nimbus_portal::{
    PortalClient, PortalConfig, PortalError, PortalServer, PortalStatus, Request, ToolRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit code for failures that are not portal errors (missing config, I/O).
/// Shares the internal-error code so it never reads as a tool's own failure.
const GENERIC_FAILURE: i32 = 3;

/// `portal status` exit code when no portal is running.
const NOT_RUNNING: i32 = 1;

/// Portal — run tools through a warm, long-lived local server.
#[derive(Parser)]
#[command(
    name = "portal",
    version,
    about = "Portal — run tools through a warm, long-lived local server"
)]
struct Cli {
    /// Path to portal.toml config file [default: ./portal.toml or ~/.config/portal/portal.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a tool through the portal and exit with its status
    Run {
        /// Tool name, as configured under [tools.*]
        tool: String,
        /// Arguments passed to the tool unchanged
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Serve tools until idle expiry or a stop request
    Serve {
        /// Endpoint path, overriding the config file
        endpoint: Option<PathBuf>,
    },
    /// Ask the running portal to shut down
    Stop,
    /// Report whether a portal is running
    Status,
}

#[tokio::main]
async fn main() {
    // Initialize tracing with env filter (RUST_LOG controls verbosity).
    // Diagnostics go to stderr; relayed tool output owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("portal: {e:#}");
            failure_code(&e)
        }
    };
    std::process::exit(code);
}

fn failure_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<PortalError>()
        .map(PortalError::exit_code)
        .unwrap_or(GENERIC_FAILURE)
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config_path = resolve_config(cli.config)?;
    let mut config = PortalConfig::load(&config_path).await?;

    match cli.command {
        Commands::Run { tool, args } => {
            run_tool(&config, &config_path, Request::new(tool, args)).await
        }
        Commands::Serve { endpoint } => {
            if let Some(endpoint) = endpoint {
                config.endpoint = endpoint;
            }
            serve(&config).await
        }
        Commands::Stop => {
            client(&config, &config_path)?.stop().await?;
            tracing::info!(endpoint = %config.endpoint.display(), "stop requested");
            Ok(0)
        }
        Commands::Status => {
            let status = client(&config, &config_path)?.status().await;
            println!("{}: {}", config.endpoint.display(), describe(status));
            Ok(if status == PortalStatus::Running { 0 } else { NOT_RUNNING })
        }
    }
}

/// Invoke one tool through the portal, relaying its output to our own streams.
async fn run_tool(config: &PortalConfig, config_path: &Path, request: Request) -> Result<i32> {
    let client = client(config, config_path)?;
    let mut out = std::io::stdout();
    let mut err = std::io::stderr();
    let status = client.run(&request, &mut out, &mut err).await?;
    Ok(status)
}

/// Run the portal in this process until it expires or is stopped.
///
/// SIGINT and SIGTERM cancel the portal so it drains and removes its endpoint.
async fn serve(config: &PortalConfig) -> Result<i32> {
    tracing::info!(
        directory = %std::env::current_dir().unwrap_or_default().display(),
        "portal starting"
    );
    let registry = ToolRegistry::from_config(config);
    let server = PortalServer::from_config(config, registry);
    spawn_signal_handler(server.cancel_token());

    let summary = server.run().await?;
    tracing::info!(served = summary.served, reason = ?summary.reason, "portal exited");
    Ok(0)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
        #[cfg(not(unix))]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = cancel.cancelled() => return,
        }
        tracing::info!("shutting down portal...");
        cancel.cancel();
    });
}

/// Client for `config`, launching this same binary as the portal by default.
fn client(config: &PortalConfig, config_path: &Path) -> Result<PortalClient> {
    let exe = std::env::current_exe().context("cannot locate the portal executable")?;
    let config_path = std::path::absolute(config_path)
        .with_context(|| format!("cannot resolve {}", config_path.display()))?;
    let default_launch = vec![
        exe.display().to_string(),
        "--config".to_string(),
        config_path.display().to_string(),
        "serve".to_string(),
    ];
    Ok(PortalClient::from_config(config, default_launch))
}

fn describe(status: PortalStatus) -> &'static str {
    match status {
        PortalStatus::Absent => "not running",
        PortalStatus::Starting => "starting",
        PortalStatus::Running => "running",
        PortalStatus::Stale => "stale endpoint (portal died)",
    }
}

/// Resolve config file path: explicit flag → ./portal.toml → ~/.config/portal/portal.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("portal.toml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("portal").join("portal.toml");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No portal.toml found. Searched ./portal.toml and ~/.config/portal/portal.toml. \
         Use --config to specify a path."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_keeps_tool_flags() {
        let cli = Cli::parse_from(["portal", "run", "javac", "-d", "out", "--release", "21"]);
        match cli.command {
            Commands::Run { tool, args } => {
                assert_eq!(tool, "javac");
                assert_eq!(args, vec!["-d", "out", "--release", "21"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::parse_from([
            "portal",
            "serve",
            "--config",
            "/etc/portal.toml",
            "/run/p/server.port",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/portal.toml")));
        match cli.command {
            Commands::Serve { endpoint } => {
                assert_eq!(endpoint, Some(PathBuf::from("/run/p/server.port")));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_failure_codes_stay_clear_of_tool_failure() {
        assert_eq!(failure_code(&anyhow::anyhow!("No portal.toml found")), 3);

        let timeout = anyhow::Error::new(PortalError::StartTimeout {
            endpoint: PathBuf::from("/run/p/server.port"),
            attempts: 10,
        });
        assert_eq!(failure_code(&timeout), 4);

        let with_context = anyhow::Error::new(PortalError::InvalidConfig(
            "portal".to_string(),
            "bad".to_string(),
        ))
        .context("loading portal.toml");
        assert_eq!(failure_code(&with_context), 6);
    }

    #[test]
    fn test_resolve_config_prefers_explicit_path() {
        let path = PathBuf::from("/somewhere/portal.toml");
        assert_eq!(resolve_config(Some(path.clone())).unwrap(), path);
    }
}
