use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from face images
    Enroll {
        /// Unique identity ID (e.g. employee number)
        #[arg(long)]
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Department
        #[arg(long, default_value = "")]
        department: String,
        /// Face images (JPEG, PNG, ...)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Add face images to an enrolled identity
    AddImages {
        id: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize a face and record attendance
    Recognize { image: PathBuf },
    /// Show today's attendance
    Today,
    /// Show attendance history, newest first
    History {
        /// Only this identity
        #[arg(long)]
        id: Option<String>,
        /// First date, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Last date, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Per-day attendance totals
    Report {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Delete an identity and all of its attendance records
    Delete { id: String },
    /// Show one enrolled identity
    Show { id: String },
    /// List enrolled identities
    List,
    /// Rebuild the daemon's vector index from its database
    Rebuild,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn enroll(
        &self,
        identity_id: &str,
        name: &str,
        department: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::Result<String>;
    async fn add_images(&self, identity_id: &str, images: Vec<Vec<u8>>) -> zbus::Result<String>;
    async fn recognize(&self, image: Vec<u8>) -> zbus::Result<String>;
    async fn today(&self) -> zbus::Result<String>;
    async fn history(
        &self,
        identity_id: &str,
        from: &str,
        to: &str,
        limit: u32,
        offset: u32,
    ) -> zbus::Result<String>;
    async fn daily_aggregate(&self, from: &str, to: &str) -> zbus::Result<String>;
    async fn delete_identity(&self, identity_id: &str) -> zbus::Result<()>;
    async fn get_identity(&self, identity_id: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn rebuild_index(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

fn read_images(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths
        .iter()
        .map(|p| std::fs::read(p).with_context(|| format!("failed to read {}", p.display())))
        .collect()
}

/// Re-indent a JSON reply from the daemon.
fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_recognition(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    match value["outcome"].as_str() {
        Some("recognized") => {
            let mut line = format!(
                "{} ({}) {} at {} [similarity {:.3}]",
                value["name"].as_str().unwrap_or("?"),
                value["identity_id"].as_str().unwrap_or("?"),
                value["status"].as_str().unwrap_or("?"),
                value["at"].as_str().unwrap_or("?"),
                value["similarity"].as_f64().unwrap_or(0.0),
            );
            if let Some(hours) = value["duration_hours"].as_f64() {
                line.push_str(&format!(", {hours:.2} h"));
            }
            if value["duplicate"].as_bool() == Some(true) {
                line.push_str(" (duplicate, ignored)");
            }
            println!("{line}");
        }
        _ => {
            let reason = value["reason"].as_str().unwrap_or("UNKNOWN");
            match value["best_similarity"].as_f64() {
                Some(best) => println!("not recognized: {reason} (best similarity {best:.3})"),
                None => println!("not recognized: {reason}"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    // Enrollment runs the model once per image, so allow it time.
    let conn = builder
        .method_timeout(Duration::from_secs(120))
        .build()
        .await
        .context("failed to connect to D-Bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll {
            id,
            name,
            department,
            images,
        } => {
            let images = read_images(&images)?;
            tracing::debug!(count = images.len(), "sending enrollment images");
            print_json(&proxy.enroll(&id, &name, &department, images).await?)?;
        }
        Commands::AddImages { id, images } => {
            let images = read_images(&images)?;
            print_json(&proxy.add_images(&id, images).await?)?;
        }
        Commands::Recognize { image } => {
            let bytes =
                std::fs::read(&image).with_context(|| format!("failed to read {}", image.display()))?;
            print_recognition(&proxy.recognize(bytes).await?)?;
        }
        Commands::Today => {
            print_json(&proxy.today().await?)?;
        }
        Commands::History {
            id,
            from,
            to,
            limit,
            offset,
        } => {
            let reply = proxy
                .history(
                    id.as_deref().unwrap_or(""),
                    from.as_deref().unwrap_or(""),
                    to.as_deref().unwrap_or(""),
                    limit,
                    offset,
                )
                .await?;
            print_json(&reply)?;
        }
        Commands::Report { from, to } => {
            let reply = proxy
                .daily_aggregate(from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            print_json(&reply)?;
        }
        Commands::Delete { id } => {
            proxy.delete_identity(&id).await?;
            println!("Deleted {id}");
        }
        Commands::Show { id } => {
            print_json(&proxy.get_identity(&id).await?)?;
        }
        Commands::List => {
            print_json(&proxy.list_identities().await?)?;
        }
        Commands::Rebuild => {
            let entries = proxy.rebuild_index().await?;
            println!("Index rebuilt: {entries} entries");
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}
