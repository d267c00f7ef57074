use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facefind", about = "facefind face search CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index (or re-index) a photo
    Index {
        /// Identifier of the photo in your library
        photo_id: String,
        /// Image file
        path: PathBuf,
        /// Re-run even if the photo is unchanged
        #[arg(short, long)]
        force: bool,
    },
    /// Find photos of the person in an image
    Search {
        /// Query image
        path: PathBuf,
    },
    /// Quick check for faces in an image
    Preview {
        /// Image file
        path: PathBuf,
    },
    /// Remove a photo's faces from the index
    Remove {
        /// Photo ID to remove
        photo_id: String,
    },
    /// List photos indexed with an older model
    Stale,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.facefind.Search1",
    default_service = "org.facefind.Search1",
    default_path = "/org/facefind/Search1"
)]
trait Search {
    fn index_photo(&self, photo_id: &str, path: &str, force: bool) -> zbus::Result<(u32, bool)>;
    fn search(&self, path: &str) -> zbus::Result<String>;
    fn preview(&self, path: &str) -> zbus::Result<u32>;
    fn remove_photo(&self, photo_id: &str) -> zbus::Result<u32>;
    fn stale_photos(&self) -> zbus::Result<Vec<String>>;
    fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn progress(&self, stage: String) -> zbus::Result<()>;
}

#[derive(Deserialize)]
struct Hit {
    photo_id: String,
    distance: f32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(system = cli.system, "connecting to facefindd");

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = SearchProxy::new(&connection)
        .await
        .context("facefindd is not reachable")?;

    match cli.command {
        Commands::Index { photo_id, path, force } => {
            let path = absolute(&path)?;
            match proxy.index_photo(&photo_id, &path, force).await {
                Ok((_, true)) => println!("{photo_id}: unchanged, skipped"),
                Ok((faces, false)) => println!("{photo_id}: indexed {faces} face(s)"),
                Err(err) => report(err)?,
            }
        }
        Commands::Search { path } => {
            let path = absolute(&path)?;
            let mut stages = proxy.receive_progress().await?;
            let printer = tokio::spawn(async move {
                while let Some(signal) = stages.next().await {
                    if let Ok(args) = signal.args() {
                        eprintln!("… {}", args.stage());
                    }
                }
            });

            let reply = proxy.search(&path).await;
            printer.abort();

            match reply {
                Ok(json) => {
                    let hits: Vec<Hit> = serde_json::from_str(&json).context("malformed search reply")?;
                    if hits.is_empty() {
                        println!("No matches");
                    }
                    for hit in hits {
                        println!("{:<40} {:.4}", hit.photo_id, hit.distance);
                    }
                }
                Err(err) => report(err)?,
            }
        }
        Commands::Preview { path } => {
            let path = absolute(&path)?;
            match proxy.preview(&path).await {
                Ok(0) => println!("No face found"),
                Ok(n) => println!("{n} face(s) found"),
                Err(err) => report(err)?,
            }
        }
        Commands::Remove { photo_id } => {
            let removed = proxy.remove_photo(&photo_id).await?;
            println!("Removed {removed} face(s) for {photo_id}");
        }
        Commands::Stale => {
            let stale = proxy.stale_photos().await?;
            if stale.is_empty() {
                println!("Index is up to date");
            }
            for photo_id in stale {
                println!("{photo_id}");
            }
        }
        Commands::Status => {
            let status = proxy.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status).context("malformed status reply")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

/// The daemon resolves paths itself, so send it an absolute one.
fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).with_context(|| format!("{}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

/// Print input problems (no face, unreadable image) plainly; propagate the rest.
fn report(err: zbus::Error) -> Result<()> {
    tracing::debug!(error = %err, "daemon call failed");
    match zbus::fdo::Error::from(err) {
        zbus::fdo::Error::InvalidArgs(message) => {
            println!("{message}");
            Ok(())
        }
        other => Err(other.into()),
    }
}
