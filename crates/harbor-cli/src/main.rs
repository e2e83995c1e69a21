//! FileHarbor CLI
//!
//! `harbor serve` runs the server; the remaining subcommands drive a library
//! through the client engine.

mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use harbor_client::{ClientConfig, HarborClient};
use harbor_server::{Server, ServerConfig};
use progress::{format_bytes, TransferBar};
use std::path::PathBuf;
use std::sync::Arc;

/// FileHarbor - secure library-scoped file transfer
#[derive(Parser)]
#[command(name = "harbor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Client configuration file (ignored by `serve`)
    #[arg(short, long, default_value = "client.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve {
        /// Server configuration file
        #[arg(required = true)]
        config: PathBuf,
    },

    /// Upload a file
    Put {
        /// Local file
        #[arg(required = true)]
        local: PathBuf,
        /// Remote path (defaults to the local file name)
        remote: Option<String>,
    },

    /// Download a file
    Get {
        /// Remote path
        #[arg(required = true)]
        remote: String,
        /// Local destination (defaults to the remote file name)
        local: Option<PathBuf>,
    },

    /// List a remote directory
    Ls {
        /// Remote directory
        #[arg(default_value = "")]
        path: String,
        /// Descend into subdirectories
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// Delete a remote file
    Rm {
        /// Remote path
        #[arg(required = true)]
        path: String,
    },

    /// Rename within the library
    Mv {
        /// Existing remote path
        #[arg(required = true)]
        from: String,
        /// New remote path
        #[arg(required = true)]
        to: String,
    },

    /// Create a remote directory
    Mkdir {
        /// Remote directory
        #[arg(required = true)]
        path: String,
    },

    /// Remove a remote directory
    Rmdir {
        /// Remote directory
        #[arg(required = true)]
        path: String,
        /// Remove contents too
        #[arg(short, long)]
        recursive: bool,
    },

    /// Show size, mtime, and digest of a remote path
    Stat {
        /// Remote path
        #[arg(required = true)]
        path: String,
    },

    /// Full-file digest of a remote path
    Sum {
        /// Remote path
        #[arg(required = true)]
        path: String,
    },

    /// Check whether a remote path exists
    Exists {
        /// Remote path
        #[arg(required = true)]
        path: String,
    },

    /// Recursive listing with per-file digests
    Manifest {
        /// Remote directory
        #[arg(default_value = "")]
        path: String,
    },

    /// Measure round-trip latency
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| (if cli.verbose { "debug" } else { "info" }).into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve { config } => serve(config).await,
        command => {
            let config = ClientConfig::load(&cli.config)
                .with_context(|| format!("loading client config {}", cli.config.display()))?;
            run_client_command(config, command).await
        }
    }
}

/// Start the server; exit code 0 on graceful shutdown, nonzero on fatal
/// startup errors.
async fn serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = ServerConfig::load(&config_path)
        .with_context(|| format!("loading server config {}", config_path.display()))?;

    let server = Server::bind(config).await.context("starting server")?;
    server.run_until_signal().await.context("serving")?;
    Ok(())
}

async fn run_client_command(config: ClientConfig, command: Commands) -> anyhow::Result<()> {
    let client = HarborClient::new(config);

    match command {
        Commands::Put { local, remote } => {
            let remote = match remote {
                Some(remote) => remote,
                None => local
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("local path has no file name")?,
            };

            let bar = Arc::new(TransferBar::new(&remote));
            let observer = Arc::clone(&bar);
            let client = client.on_progress(move |event| observer.observe(&event));

            match client.upload(&local, &remote).await {
                Ok(outcome) => {
                    bar.finish_with_message(format!(
                        "{} {} ({}) in {:.1}s",
                        style("Uploaded").green(),
                        remote,
                        format_bytes(outcome.bytes),
                        outcome.elapsed.as_secs_f64()
                    ));
                    Ok(())
                }
                Err(err) => {
                    bar.abandon();
                    Err(err.into())
                }
            }
        }

        Commands::Get { remote, local } => {
            let local = match local {
                Some(local) => local,
                None => PathBuf::from(
                    remote
                        .rsplit('/')
                        .next()
                        .context("remote path has no file name")?,
                ),
            };

            let bar = Arc::new(TransferBar::new(&remote));
            let observer = Arc::clone(&bar);
            let client = client.on_progress(move |event| observer.observe(&event));

            match client.download(&remote, &local).await {
                Ok(outcome) => {
                    bar.finish_with_message(format!(
                        "{} {} ({}) in {:.1}s",
                        style("Downloaded").green(),
                        local.display(),
                        format_bytes(outcome.bytes),
                        outcome.elapsed.as_secs_f64()
                    ));
                    Ok(())
                }
                Err(err) => {
                    bar.abandon();
                    Err(err.into())
                }
            }
        }

        Commands::Ls { path, recursive } => {
            let entries = client.list(&path, recursive).await?;
            for entry in entries {
                let kind = match entry.kind {
                    harbor_proto::message::EntryKind::Dir => style("dir ").blue(),
                    harbor_proto::message::EntryKind::File => style("file").dim(),
                };
                println!("{kind}  {:>10}  {}", format_bytes(entry.size), entry.path);
            }
            Ok(())
        }

        Commands::Rm { path } => {
            client.delete(&path).await?;
            println!("{} {path}", style("Deleted").green());
            Ok(())
        }

        Commands::Mv { from, to } => {
            client.rename(&from, &to).await?;
            println!("{} {from} -> {to}", style("Renamed").green());
            Ok(())
        }

        Commands::Mkdir { path } => {
            client.mkdir(&path).await?;
            println!("{} {path}", style("Created").green());
            Ok(())
        }

        Commands::Rmdir { path, recursive } => {
            client.rmdir(&path, recursive).await?;
            println!("{} {path}", style("Removed").green());
            Ok(())
        }

        Commands::Stat { path } => {
            let stat = client.stat(&path).await?;
            println!("path:   {path}");
            println!("kind:   {:?}", stat.kind);
            println!("size:   {} ({})", stat.size, format_bytes(stat.size));
            println!("mtime:  {}", stat.mtime);
            if !stat.digest.is_empty() {
                println!("sha256: {}", stat.digest);
            }
            Ok(())
        }

        Commands::Sum { path } => {
            let sum = client.checksum(&path).await?;
            println!("{}  {path}", sum.digest);
            Ok(())
        }

        Commands::Exists { path } => {
            let exists = client.exists(&path).await?;
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Manifest { path } => {
            let entries = client.manifest(&path).await?;
            for entry in entries {
                println!("{}  {:>10}  {}", entry.digest, entry.size, entry.path);
            }
            Ok(())
        }

        Commands::Ping => {
            let latency = client.ping().await?;
            println!("pong in {:.2}ms", latency.as_secs_f64() * 1000.0);
            Ok(())
        }

        Commands::Serve { .. } => unreachable!("serve is handled before client dispatch"),
    }
}
