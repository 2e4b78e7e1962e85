//! avalanche - command-line client for Avalanche cache servers

use anyhow::{bail, Context, Result};
use avalanche_network::Client;
use avalanche_protocol::Key;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "avalanche")]
#[command(about = "Query and populate an Avalanche cache server")]
struct Args {
    /// Server address (host:port)
    #[arg(short, long, env = "AVALANCHE_SERVER", default_value = "127.0.0.1:40001")]
    server: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the server answers
    Ping,
    /// Show blob count and total size
    Stats,
    /// List every key the server holds
    Keys,
    /// Report whether a blob exists and its size
    Have { key: Key },
    /// Download a blob to a file or stdout
    Get {
        key: Key,
        /// Destination file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a blob from a file or stdin
    Put {
        key: Key,
        /// Source file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Refresh the access time of blobs
    Touch {
        #[arg(required = true)]
        keys: Vec<Key>,
    },
    /// Remove blobs
    Evict {
        #[arg(required = true)]
        keys: Vec<Key>,
    },
}

async fn resolve(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("Unable to resolve {}", server))?
        .next()
        .with_context(|| format!("No address for {}", server))
}

async fn execute(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Ping => {
            if !client.ping().await {
                bail!("{} did not answer", client.address());
            }
            println!("{} is alive", client.address());
        }
        Command::Stats => {
            let stats = client.stats().await?;
            println!("blobs: {}", stats.blob_count);
            println!("bytes: {}", stats.memory_usage);
        }
        Command::Keys => {
            for key in client.keys().await? {
                println!("{}", key);
            }
        }
        Command::Have { key } => match client.stat(&key).await? {
            Some(size) => println!("{} {}", key, size),
            None => bail!("{} not found", key),
        },
        Command::Get { key, output } => {
            let mut stream = match client.get(&key).await? {
                Some(stream) => stream,
                None => bail!("{} not found", key),
            };
            let copied = match output {
                Some(path) => {
                    let mut file = File::create(&path)
                        .await
                        .with_context(|| format!("Unable to create {}", path.display()))?;
                    stream.copy_to(&mut file).await?
                }
                None => stream.copy_to(&mut io::stdout()).await?,
            };
            debug!("Received {} bytes for {}", copied, key);
        }
        Command::Put { key, input } => {
            let mut upload = match client.put(&key).await? {
                Some(upload) => upload,
                None => bail!("{} is already stored", key),
            };
            let sent = match input {
                Some(path) => {
                    let mut file = File::open(&path)
                        .await
                        .with_context(|| format!("Unable to open {}", path.display()))?;
                    upload.write_from(&mut file).await?
                }
                None => upload.write_from(&mut io::stdin()).await?,
            };
            if !upload.close().await? {
                bail!("Server refused {}", key);
            }
            println!("{} {}", key, sent);
        }
        Command::Touch { keys } => {
            if !client.touch(&keys).await? {
                bail!("Not every key was present");
            }
        }
        Command::Evict { keys } => {
            if !client.evict(&keys).await? {
                bail!("Not every key was present");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    let address = resolve(&args.server).await?;
    debug!("Using server {}", address);

    let client = Client::new(address);
    let result = execute(&client, args.command).await;
    client.disconnect();
    result
}
