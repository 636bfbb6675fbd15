use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::bail;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use workbench::auth::TokenGenerator;
use workbench::config::ServerConfig;
use workbench::server::{AppState, create_router};
use workbench::store::{SqliteStore, Store};
use workbench::types::{OAuthIdentity, OAuthProvider, User};

const ADMIN_TOKEN_FILE: &str = ".admin_token";
const NOT_INITIALIZED: &str =
    "Server not initialized. Run 'workbench admin init' first to create the database and admin token.";

#[cfg(unix)]
fn set_restrictive_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set permissions on {}: {e}", path.display());
    }
}

#[derive(Parser)]
#[command(name = "workbench")]
#[command(about = "Multi-tenant workspace backend for a collaborative IDE", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve {
        /// Host to bind to (overrides workbench.toml)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (overrides workbench.toml)
        #[arg(long, short)]
        port: Option<u16>,

        /// Data directory for the database, object storage and workbench.toml
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Initialize the server (create database and admin token)
    Init {
        /// Data directory for the database and object storage
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Skip interactive prompts
        #[arg(long)]
        non_interactive: bool,
    },
}

fn run_init(data_dir: &Path, non_interactive: bool) -> anyhow::Result<()> {
    fs::create_dir_all(data_dir)?;

    let config = ServerConfig {
        data_dir: data_dir.to_path_buf(),
        ..ServerConfig::default()
    };
    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;

    let token_file = data_dir.join(ADMIN_TOKEN_FILE);

    if store.has_admin_token()? {
        bail!(
            "Server already initialized. Admin token exists at: {}",
            token_file.display()
        );
    }

    let generator = TokenGenerator::new();
    let (raw_token, _) = generator.issue(&store, true, None, None)?;
    fs::write(&token_file, &raw_token)?;

    #[cfg(unix)]
    set_restrictive_permissions(&token_file);

    println!();
    println!("========================================");
    println!("Admin token (save this, it won't be shown again):");
    println!();
    println!("  {raw_token}");
    println!();
    println!("Token also written to: {}", token_file.display());
    println!("========================================");
    println!();

    if !non_interactive {
        provision_first_user_prompt(&store, &generator)?;
    }

    Ok(())
}

fn provision_first_user_prompt(
    store: &SqliteStore,
    generator: &TokenGenerator,
) -> anyhow::Result<()> {
    let provision = inquire::Confirm::new("Would you like to provision a first user?")
        .with_default(false)
        .prompt()?;

    if !provision {
        return Ok(());
    }

    let email = inquire::Text::new("Email:")
        .with_validator(|input: &str| {
            let input = input.trim();
            if input.is_empty() {
                Err("Email cannot be empty".into())
            } else if !input.contains('@') || input.contains(char::is_whitespace) {
                Err("Enter a valid email address".into())
            } else {
                Ok(inquire::validator::Validation::Valid)
            }
        })
        .prompt()?
        .trim()
        .to_lowercase();

    let display_name = inquire::Text::new("Display name (optional):").prompt()?;

    let identity = OAuthIdentity {
        provider: OAuthProvider::Google,
        provider_user_id: email.clone(),
        email,
        display_name: Some(display_name.trim().to_string()).filter(|n| !n.is_empty()),
        avatar_url: None,
    };
    let mut user = User::from_identity(&identity, Utc::now());
    user.last_login_at = None;

    let provisioned = store.provision_user(&user)?;
    let (raw_token, _) = generator.issue(store, false, Some(&provisioned.user.id), None)?;

    println!();
    println!("========================================");
    println!(
        "Provisioned '{}' with workspace {} and token:",
        provisioned.user.primary_email, provisioned.workspace.id
    );
    println!();
    println!("  {raw_token}");
    println!();
    println!("========================================");
    println!();

    Ok(())
}

async fn run_serve(
    host: Option<String>,
    port: Option<u16>,
    data_dir: &Path,
) -> anyhow::Result<()> {
    let mut config = ServerConfig::load(data_dir)?;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let token_file = config.data_dir.join(ADMIN_TOKEN_FILE);
    if !token_file.exists() {
        bail!(NOT_INITIALIZED);
    }

    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;
    if !store.has_admin_token()? {
        bail!(NOT_INITIALIZED);
    }

    info!("Admin token available at {}", token_file.display());

    let state = AppState::new(Arc::new(store), &config)?;
    if state.providers.is_empty() {
        warn!("No OAuth providers configured; browser login is disabled");
    }
    if state.stripe_webhook_secret.is_none() {
        warn!("No billing webhook secret configured; webhooks will be rejected");
    }

    let app = create_router(Arc::new(state));
    let addr = config.socket_addr()?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("workbench=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init {
                data_dir,
                non_interactive,
            } => run_init(&data_dir, non_interactive)?,
        },
        Commands::Serve {
            host,
            port,
            data_dir,
        } => run_serve(host, port, &data_dir).await?,
    }

    Ok(())
}
