use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "likeness", about = "Likeness face enrollment and recognition CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a face image
    Enroll {
        /// Name of the person in the image
        #[arg(short, long)]
        name: String,
        image: PathBuf,
    },
    /// Add another face image to an existing identity
    Add {
        /// Identity ID
        #[arg(short, long)]
        id: i64,
        image: PathBuf,
    },
    /// Identify the person in a face image
    Recognize { image: PathBuf },
    /// Show an identity and its enrolled signatures
    Show { id: i64 },
    /// Delete an identity and everything enrolled for it
    Delete { id: i64 },
    /// List enrolled identities
    List,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.freedesktop.Likeness1",
    default_service = "org.freedesktop.Likeness1",
    default_path = "/org/freedesktop/Likeness1"
)]
trait Likeness {
    async fn enroll(&self, name: &str, mime: &str, filename: &str, image: &[u8]) -> zbus::Result<String>;
    async fn enroll_identity(
        &self,
        id: i64,
        mime: &str,
        filename: &str,
        image: &[u8],
    ) -> zbus::Result<String>;
    async fn recognize(&self, mime: &str, image: &[u8]) -> zbus::Result<String>;
    async fn get_identity(&self, id: i64) -> zbus::Result<String>;
    async fn delete_identity(&self, id: i64) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

/// An image file read from disk with its detected MIME type.
struct ImageFile {
    bytes: Vec<u8>,
    mime: &'static str,
    filename: String,
}

fn read_image(path: &Path) -> Result<ImageFile> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let mime = mime_of(&bytes).with_context(|| format!("{}: unrecognised image", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(ImageFile {
        bytes,
        mime,
        filename,
    })
}

fn mime_of(bytes: &[u8]) -> Result<&'static str> {
    match image::guess_format(bytes)? {
        image::ImageFormat::Png => Ok("image/png"),
        image::ImageFormat::Jpeg => Ok("image/jpeg"),
        other => bail!("unsupported image format {other:?}; use PNG or JPEG"),
    }
}

/// Re-indent a JSON reply for the terminal.
fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = LikenessProxy::new(&conn)
        .await
        .context("likenessd is not reachable")?;

    match cli.command {
        Commands::Enroll { name, image } => {
            let file = read_image(&image)?;
            tracing::debug!(mime = file.mime, bytes = file.bytes.len(), "sending enrollment");
            print_json(&proxy.enroll(&name, file.mime, &file.filename, &file.bytes).await?)?;
        }
        Commands::Add { id, image } => {
            let file = read_image(&image)?;
            print_json(
                &proxy
                    .enroll_identity(id, file.mime, &file.filename, &file.bytes)
                    .await?,
            )?;
        }
        Commands::Recognize { image } => {
            let file = read_image(&image)?;
            print_json(&proxy.recognize(file.mime, &file.bytes).await?)?;
        }
        Commands::Show { id } => {
            print_json(&proxy.get_identity(id).await?)?;
        }
        Commands::Delete { id } => {
            if proxy.delete_identity(id).await? {
                println!("Deleted identity {id}");
            } else {
                println!("No identity {id}");
            }
        }
        Commands::List => {
            print_json(&proxy.list_identities().await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}
