//! tunnelmesh CLI
//!
//! Thin wrapper around tunnelmesh-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! tunnelmesh info
//!
//! # Show the tunnel a secret maps to
//! tunnelmesh --secret "correct horse" tunnel
//!
//! # Send a message
//! tunnelmesh --secret "correct horse" send --sender alice "hello"
//!
//! # Send a file as media, expiring after an hour
//! tunnelmesh --secret "correct horse" send --sender alice --file cat.png --media-type image/png --ttl 3600
//!
//! # List live messages
//! tunnelmesh --secret "correct horse" list
//!
//! # Exchange logs with another node
//! tunnelmesh --secret "correct horse" export --out mine.json
//! tunnelmesh --secret "correct horse" diff theirs.json
//! tunnelmesh --secret "correct horse" import theirs.json
//!
//! # Check signatures and the local hash chain
//! tunnelmesh --secret "correct horse" verify
//!
//! # Delete everything this node stored for a tunnel
//! tunnelmesh --secret "correct horse" forget --force
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tunnelmesh_core::{
    now_millis, MediaKind, MeshConfig, NewEvent, SignalContent, Timestamp, Tunnel, TunnelStore,
};

/// tunnelmesh - ephemeral tunnel-scoped messaging
#[derive(Parser)]
#[command(name = "tunnelmesh")]
#[command(version = "0.1.0")]
#[command(about = "tunnelmesh - ephemeral tunnel-scoped messaging")]
#[command(
    long_about = "Everyone who knows the same secret shares a tunnel: messages are encrypted, fragmented, signed, and reconciled between nodes by exchanging exported logs."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.tunnelmesh/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Shared secret of the tunnel to work in
    #[arg(short, long, global = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the tunnel the secret maps to
    Tunnel,

    /// Send a message into the tunnel
    Send {
        /// Message text (omit when sending a file)
        text: Option<String>,
        /// Sender id (defaults to the node id when signing with the node identity)
        #[arg(long)]
        sender: Option<String>,
        /// Seconds until the message expires
        #[arg(long)]
        ttl: Option<u64>,
        /// Optional title
        #[arg(long)]
        title: Option<String>,
        /// Send the contents of a file instead of text
        #[arg(long, requires = "media_type")]
        file: Option<PathBuf>,
        /// Media type of the file (e.g. image/png)
        #[arg(long)]
        media_type: Option<String>,
    },

    /// List live messages
    List,

    /// Write the tunnel's log as a JSON document
    Export {
        /// Output file (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Merge an exported log into the tunnel
    Import {
        /// Exported log file, or - for stdin
        path: PathBuf,
    },

    /// Show records of an exported log this node has never seen
    Diff {
        /// Exported log file, or - for stdin
        path: PathBuf,
    },

    /// Check record signatures and the local hash chain
    Verify,

    /// Delete the tunnel's stored log and key ring from this node
    Forget {
        /// Actually delete
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the configuration in effect
    Show,
    /// Write a config.json with default values
    Init {
        /// Overwrite an existing config.json
        #[arg(long)]
        force: bool,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.tunnelmesh/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tunnelmesh")
        .join("data")
}

/// Read an exported log from a file, or stdin for `-`
fn read_document(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read '{}'", path.display()))
    }
}

fn format_time(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Open the node in `data_dir` and enter the tunnel of `secret`
fn open_tunnel(data_dir: &Path, secret: Option<&str>) -> Result<Tunnel> {
    let secret = secret.context("This command needs --secret")?;
    let store = TunnelStore::open_dir(data_dir)?;
    Ok(store.open_tunnel(secret)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let secret = cli.secret.as_deref();
    tracing::debug!(data_dir = %data_dir.display(), "Starting tunnelmesh");

    match cli.command {
        Commands::Info => {
            let store = TunnelStore::open_dir(&data_dir)?;
            let config = store.config();
            let tunnels = store.stored_tunnels()?;

            println!("tunnelmesh v0.1.0");
            println!();
            println!("Node:");
            println!("  ID: {}", store.identity().public_id());
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Key mode: {:?}", config.key_mode);
            println!("Signing: {:?}", config.signing);
            println!("Tunnels: {}", tunnels.len());
            for id in tunnels {
                println!("  {}", id);
            }
            let quarantined = store.quarantined()?;
            if !quarantined.is_empty() {
                println!("Quarantined rows: {}", quarantined.len());
                for key in quarantined {
                    println!("  {}", key);
                }
            }
        }

        // Works without opening the store, so a broken config.json can be replaced.
        Commands::Config { action } => run_config(&data_dir, &action)?,

        Commands::Tunnel => {
            let tunnel = open_tunnel(&data_dir, secret)?;
            let now = now_millis();
            println!("Tunnel: {}", tunnel.id());
            println!("  Records: {}", tunnel.list(now).len());
            if let Some(sender) = tunnel.required_sender() {
                println!("  Sender: {}", sender);
            }
        }

        Commands::Send {
            text,
            sender,
            ttl,
            title,
            file,
            media_type,
        } => {
            let tunnel = open_tunnel(&data_dir, secret)?;
            let sender = match sender {
                Some(sender) => sender,
                None => tunnel
                    .required_sender()
                    .map(str::to_string)
                    .context("--sender is required with shared-key signing")?,
            };

            let now = now_millis();
            let mut event = match (file, text) {
                (Some(path), _) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("Failed to read '{}'", path.display()))?;
                    let kind = MediaKind::from_tag(media_type.as_deref().unwrap_or_default());
                    NewEvent::media(sender, kind, bytes, now)
                }
                (None, Some(text)) => NewEvent::text(sender, &text, now),
                (None, None) => anyhow::bail!("Nothing to send: give a text or --file"),
            };
            if let Some(title) = title {
                event = event.with_title(title);
            }
            if let Some(ttl) = ttl {
                event = event.with_ttl(Duration::from_secs(ttl));
            }

            let outcome = tunnel.send(event)?;
            let record = outcome.record();
            if outcome.is_duplicate() {
                println!("Already sent: {}", record.id);
            } else {
                println!("Sent message");
                println!("  ID: {}", record.id);
            }
            if let Some(expires_at) = record.expires_at {
                println!("  Expires: {}", format_time(expires_at));
            }
        }

        Commands::List => {
            let tunnel = open_tunnel(&data_dir, secret)?;
            let signals = tunnel.list(now_millis());
            if signals.is_empty() {
                println!("No messages.");
            } else {
                println!("Messages ({}):", signals.len());
                println!();
                for signal in &signals {
                    let record = &signal.record;
                    let body = match (&signal.content, signal.text()) {
                        (_, Some(text)) => text.to_string(),
                        (SignalContent::Decrypted(bytes), None) => {
                            format!("<{}, {} bytes>", record.media_kind.as_tag(), bytes.len())
                        }
                        (SignalContent::Corrupted(reason), None) => {
                            format!("<unreadable: {}>", reason)
                        }
                    };
                    let title = record
                        .title
                        .as_deref()
                        .map(|t| format!(" [{}]", t))
                        .unwrap_or_default();
                    println!(
                        "  [{}] {}{}: {}",
                        format_time(record.created_at),
                        record.sender,
                        title,
                        body
                    );
                }
            }
        }

        Commands::Export { out } => {
            let tunnel = open_tunnel(&data_dir, secret)?;
            let document = tunnel.export(now_millis())?;
            match out {
                Some(path) => {
                    std::fs::write(&path, document)
                        .with_context(|| format!("Failed to write '{}'", path.display()))?;
                    println!("Exported {} to {}", tunnel.id(), path.display());
                }
                None => println!("{}", document),
            }
        }

        Commands::Import { path } => {
            let tunnel = open_tunnel(&data_dir, secret)?;
            let document = read_document(&path)?;
            let report = tunnel.import(&document)?;
            if report.is_noop() {
                println!("Already up to date.");
            } else {
                println!("Imported {} new record(s)", report.added.len());
            }
            if report.duplicates > 0 {
                println!("  Duplicates skipped: {}", report.duplicates);
            }
        }

        Commands::Diff { path } => {
            let tunnel = open_tunnel(&data_dir, secret)?;
            let document = read_document(&path)?;
            let missing = tunnel.diff(&document)?;
            if missing.is_empty() {
                println!("Nothing new.");
            } else {
                println!("Unseen records ({}):", missing.len());
                for record in missing {
                    println!(
                        "  {} from {} at {}",
                        record.id,
                        record.sender,
                        format_time(record.created_at)
                    );
                }
            }
        }

        Commands::Verify => {
            let tunnel = open_tunnel(&data_dir, secret)?;
            let report = tunnel.verify();
            println!("Records checked: {}", report.records);
            for id in &report.invalid_signatures {
                println!("  Invalid signature: {}", id);
            }
            if let Some(error) = &report.chain_error {
                println!("  Chain: {}", error);
            }
            report.ensure_ok()?;
            println!("OK");
        }

        Commands::Forget { force } => {
            let secret = secret.context("This command needs --secret")?;
            if !force {
                println!("WARNING: This deletes every stored message of the tunnel on this node.");
                println!("Other nodes keep their copies.");
                println!();
                println!("Use --force to confirm.");
                return Ok(());
            }
            let store = TunnelStore::open_dir(&data_dir)?;
            if store.forget_tunnel(secret)? {
                println!("Forgot tunnel");
            } else {
                println!("Nothing stored for this tunnel.");
            }
        }
    }

    Ok(())
}

fn run_config(data_dir: &Path, action: &ConfigAction) -> Result<()> {
    let path = data_dir.join(MeshConfig::FILE_NAME);
    match action {
        ConfigAction::Show => {
            let config = MeshConfig::load_or_default(data_dir)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("Failed to create '{}'", data_dir.display()))?;
            MeshConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
