//! Driveline CLI - command line front end for the file storage service.
//!
//! Runs the consent flow for end users and stores, fetches, lists and
//! exports the files attached to products and orders.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use driveline_common::{Container, ContainerKind, Subject};
use driveline_files::{open_google_credentials, open_google_drive, FileServiceConfig};
use driveline_index::credentials::redact;

#[derive(Parser)]
#[command(name = "driveline")]
#[command(about = "Driveline - product and order files on Google Drive")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON).
    #[arg(short, long, default_value = "driveline.json")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the consent URL for a user.
    AuthUrl {
        /// User id.
        #[arg(short, long)]
        user: String,

        /// Open the URL in the default browser.
        #[arg(long)]
        open: bool,
    },

    /// Exchange an authorization code for a user's tokens.
    Authorize {
        /// User id.
        #[arg(short, long)]
        user: String,

        /// Code returned to the redirect URL.
        #[arg(short, long)]
        code: String,
    },

    /// Print a valid access token (service identity unless --user is given).
    Token {
        /// User id.
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Forget a user's stored credential.
    Revoke {
        /// User id.
        #[arg(short, long)]
        user: String,
    },

    /// Upload a file into a container.
    Put {
        /// Container kind: "product" or "order".
        #[arg(short, long)]
        kind: ContainerKind,

        /// Container id.
        #[arg(short, long)]
        id: i64,

        /// Local file to upload.
        #[arg(short, long)]
        file: PathBuf,

        /// Filename in the container (default: local file name).
        #[arg(short, long)]
        name: Option<String>,

        /// MIME type (default: application/octet-stream).
        #[arg(short, long)]
        mime: Option<String>,

        /// Uploader id (default: public).
        #[arg(short, long)]
        uploader: Option<String>,
    },

    /// Download a stored file.
    Get {
        /// Remote object id.
        #[arg(short, long)]
        remote_id: String,

        /// Destination path (default: stored filename).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delete a stored file.
    Rm {
        /// Remote object id.
        #[arg(short, long)]
        remote_id: String,
    },

    /// List the files of a container.
    Ls {
        /// Container kind: "product" or "order".
        #[arg(short, long)]
        kind: ContainerKind,

        /// Container id.
        #[arg(short, long)]
        id: i64,
    },

    /// Export all files of a container as a ZIP archive.
    Export {
        /// Container kind: "product" or "order".
        #[arg(short, long)]
        kind: ContainerKind,

        /// Container id.
        #[arg(short, long)]
        id: i64,

        /// Destination archive path.
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::AuthUrl { user, open } => cmd_auth_url(&config, &user, open),

        Commands::Authorize { user, code } => cmd_authorize(&config, &user, &code).await,

        Commands::Token { user } => cmd_token(&config, user.as_deref()).await,

        Commands::Revoke { user } => cmd_revoke(&config, &user).await,

        Commands::Put {
            kind,
            id,
            file,
            name,
            mime,
            uploader,
        } => {
            cmd_put(
                &config,
                Container::new(kind, id),
                &file,
                name.as_deref(),
                mime.as_deref(),
                uploader.as_deref(),
            )
            .await
        }

        Commands::Get { remote_id, out } => cmd_get(&config, &remote_id, out.as_deref()).await,

        Commands::Rm { remote_id } => cmd_rm(&config, &remote_id).await,

        Commands::Ls { kind, id } => cmd_ls(&config, kind, id).await,

        Commands::Export { kind, id, out } => cmd_export(&config, kind, id, &out).await,
    }
}

/// Load the configuration file, falling back to defaults if it is absent.
fn load_config(path: &Path) -> Result<FileServiceConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Configuration file not found, using defaults");
        let mut config = FileServiceConfig::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        return Ok(config);
    }
    FileServiceConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn cmd_auth_url(config: &FileServiceConfig, user: &str, open_browser: bool) -> Result<()> {
    let credentials = open_google_credentials(config).context("Failed to set up OAuth client")?;
    let url = credentials.authorization_url(&Subject::user(user)?)?;

    println!("{}", url);
    if open_browser {
        open::that(&url).context("Failed to open browser")?;
    }
    Ok(())
}

async fn cmd_authorize(config: &FileServiceConfig, user: &str, code: &str) -> Result<()> {
    let credentials = open_google_credentials(config).context("Failed to set up OAuth client")?;
    let subject = Subject::user(user)?;

    let credential = credentials
        .exchange_code(code, &subject)
        .await
        .context("Authorization failed")?;

    println!("Authorized {}", subject);
    println!("  Access token: {}", redact(&credential.access_token));
    println!("  Expires: {}", credential.expires_at());
    println!(
        "  Refresh token: {}",
        if credential.can_refresh() { "stored" } else { "none" }
    );
    Ok(())
}

async fn cmd_token(config: &FileServiceConfig, user: Option<&str>) -> Result<()> {
    let token = match user {
        Some(user) => {
            let credentials = open_google_credentials(config)?;
            credentials.ensure_valid_token(&Subject::user(user)?).await?
        }
        None => {
            let service = open_google_drive(config).await?;
            service
                .credentials()
                .ensure_valid_token(&Subject::Service)
                .await?
        }
    };

    println!("{}", token);
    Ok(())
}

async fn cmd_revoke(config: &FileServiceConfig, user: &str) -> Result<()> {
    let credentials = open_google_credentials(config)?;
    let subject = Subject::user(user)?;

    if credentials.revoke(&subject).await? {
        println!("Credential of {} removed", subject);
    } else {
        println!("No credential stored for {}", subject);
    }
    Ok(())
}

async fn cmd_put(
    config: &FileServiceConfig,
    container: Container,
    file: &Path,
    name: Option<&str>,
    mime: Option<&str>,
    uploader: Option<&str>,
) -> Result<()> {
    let filename = match name {
        Some(name) => name.to_string(),
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .context("Cannot derive a filename; pass --name")?
            .to_string(),
    };
    let content = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let service = open_google_drive(config).await?;
    info!("Uploading {} to {}", filename, container);
    let remote_id = service
        .put(container, &filename, mime, Bytes::from(content), uploader)
        .await?;

    println!("{}", remote_id);
    Ok(())
}

async fn cmd_get(config: &FileServiceConfig, remote_id: &str, out: Option<&Path>) -> Result<()> {
    let service = open_google_drive(config).await?;
    let download = service.download(remote_id).await?;

    let dest = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&download.filename));
    tokio::fs::write(&dest, &download.data)
        .await
        .with_context(|| format!("Failed to write {}", dest.display()))?;

    println!(
        "Saved {} ({}, {} bytes) to {}",
        download.filename,
        download.mime_type,
        download.data.len(),
        dest.display()
    );
    Ok(())
}

async fn cmd_rm(config: &FileServiceConfig, remote_id: &str) -> Result<()> {
    let service = open_google_drive(config).await?;
    service.delete(remote_id).await?;

    println!("Deleted {}", remote_id);
    Ok(())
}

async fn cmd_ls(config: &FileServiceConfig, kind: ContainerKind, id: i64) -> Result<()> {
    let service = open_google_drive(config).await?;
    let objects = service.list_container(kind, id)?;

    println!("{}", serde_json::to_string_pretty(&objects)?);
    Ok(())
}

async fn cmd_export(config: &FileServiceConfig, kind: ContainerKind, id: i64, out: &Path) -> Result<()> {
    let service = open_google_drive(config).await?;
    let archive = service.export_container_zip(kind, id).await?;

    tokio::fs::write(out, &archive)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;

    println!("Exported {} {} to {} ({} bytes)", kind, id, out.display(), archive.len());
    Ok(())
}
