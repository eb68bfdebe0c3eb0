//! session-keeper CLI
//!
//! Logs in against the backend, keeps the session on disk between runs and
//! sends authenticated requests through the token-managing pipeline.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_keeper::{ApiRequest, Config, SessionKeeper};

#[derive(Parser)]
#[command(name = "session-keeper")]
#[command(about = "Client-side session and token manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session
    Login {
        /// Account identifier (e-mail or username)
        identifier: String,

        /// Secret; read from SESSION_KEEPER_SECRET or stdin when omitted
        #[arg(long)]
        secret: Option<String>,
    },

    /// End the session and clear stored credentials
    Logout,

    /// Show current session status
    Status,

    /// Show the signed-in user's claims
    Whoami,

    /// Refresh the access token
    Refresh {
        /// Refresh even if the token is not yet due
        #[arg(short, long)]
        force: bool,
    },

    /// Send an authenticated request and print the response body
    Request {
        /// HTTP method, e.g. GET or POST
        method: String,

        /// Path below the configured base URL
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,

        /// Query parameter as key=value (repeatable)
        #[arg(short, long)]
        query: Vec<String>,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        write: bool,
    },
}

fn read_secret() -> Result<String> {
    if let Ok(secret) = std::env::var("SESSION_KEEPER_SECRET") {
        return Ok(secret);
    }
    eprint!("Secret: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read secret from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn build_request(
    method: &str,
    path: String,
    data: Option<String>,
    query: Vec<String>,
) -> Result<ApiRequest> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method '{}'", method))?;
    let mut request = ApiRequest::new(method, path);
    for pair in query {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Query parameter '{}' is not key=value", pair);
        };
        request = request.with_query(key, value);
    }
    if let Some(data) = data {
        let body = serde_json::from_str(&data).context("Request body is not valid JSON")?;
        request = request.with_body(body);
    }
    Ok(request)
}

/// Build the session stack and pick up any stored session.
fn open_keeper(config: &Config) -> Result<SessionKeeper> {
    let keeper = SessionKeeper::from_config(config)?;
    keeper
        .restore()
        .context("Failed to load stored session")?;
    Ok(keeper)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    let config = Config::load_from(&config_path)?;

    match cli.command {
        Commands::Login { identifier, secret } => {
            let keeper = open_keeper(&config)?;
            if keeper.is_authenticated() {
                println!("Already logged in; run `logout` first.");
                return Ok(());
            }
            let secret = match secret {
                Some(secret) => secret,
                None => read_secret()?,
            };
            let session = keeper.login(&identifier, &secret).await?;
            println!(
                "Logged in as {} ({})",
                session.claims.subject, session.claims.role
            );
        }
        Commands::Logout => {
            let keeper = open_keeper(&config)?;
            if !keeper.is_authenticated() {
                println!("Not logged in.");
            } else {
                keeper.logout().await;
                println!("Logged out.");
            }
        }
        Commands::Status => match open_keeper(&config)?.session() {
            Some(session) => {
                let expires = chrono::DateTime::from_timestamp(session.claims.expires_at, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| session.claims.expires_at.to_string());
                println!("Status:  {:?}", session.status);
                println!("Subject: {}", session.claims.subject);
                println!("Role:    {}", session.claims.role);
                println!("Since:   {}", session.created_at.to_rfc3339());
                println!("Expires: {}", expires);
            }
            None => println!("Not logged in."),
        },
        Commands::Whoami => match open_keeper(&config)?.current_user() {
            Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
            None => bail!("Not logged in. Run `session-keeper login <identifier>` first."),
        },
        Commands::Refresh { force } => {
            let keeper = open_keeper(&config)?;
            if force {
                let session = keeper.refresh_now().await?;
                println!("Token refreshed (expires_at={})", session.claims.expires_at);
            } else if keeper.refresh_if_needed().await? {
                println!("Token refreshed.");
            } else {
                println!("Token still valid; nothing to do.");
            }
        }
        Commands::Request {
            method,
            path,
            data,
            query,
        } => {
            let request = build_request(&method, path, data, query)?;
            let keeper = open_keeper(&config)?;
            let response = keeper.request(request).await?;
            tracing::debug!("HTTP {}", response.status);
            let response = response.error_for_status()?;
            println!("{}", response.body);
        }
        Commands::Config { write } => {
            if write {
                config.save_to(&config_path)?;
                println!("Wrote {}", config_path.display());
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}
