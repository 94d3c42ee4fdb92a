use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use credvault::config::load_config;
use credvault::CredentialManager;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "credvault", version, about = "OAuth2 credential lifecycle manager")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, env = "CREDVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Credential identity to operate on
    #[arg(long, global = true, default_value = "default")]
    identity: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the browser authorization flow
    Login,
    /// Ensure the identity is usable, retrying the browser flow if not
    Check {
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
    /// Show authentication status
    Status,
    /// Revoke the credential and delete it locally
    Logout,
    /// List identities with stored credentials
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credvault=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    let manager =
        CredentialManager::from_config(&config).context("Failed to initialize credential manager")?;

    let identity = cli.identity.as_str();

    match cli.command {
        Command::Login => {
            let _cleanup = manager.spawn_state_cleanup(config.refresh.state_cleanup_interval_seconds);
            let client = manager
                .authenticate(identity)
                .await
                .context("Authorization failed")?;
            info!(identity = %identity, expiry = %client.expiry(), "Logged in");
            println!("Authenticated {} (token valid until {})", identity, client.expiry());
        }
        Command::Check { attempts } => {
            let client = manager
                .ensure_authenticated(identity, attempts)
                .await
                .with_context(|| format!("Failed to authenticate after {} attempts", attempts))?;
            println!("Authenticated {} (token valid until {})", identity, client.expiry());
        }
        Command::Status => {
            let status = manager
                .status(identity)
                .context("Failed to read credential status")?;
            println!("{}: {}", identity, status);
            println!("{}", status.message());
        }
        Command::Logout => {
            if manager.revoke(identity).await.context("Failed to revoke credential")? {
                println!("Logged out {}.", identity);
            } else {
                println!("No active session for {}.", identity);
            }
        }
        Command::List => {
            let identities = manager.identities().context("Failed to list identities")?;
            if identities.is_empty() {
                println!("No stored credentials.");
            }
            for identity in identities {
                let status = manager
                    .status(&identity)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| format!("unreadable ({})", e));
                println!("{}\t{}", identity, status);
            }
        }
    }

    Ok(())
}
