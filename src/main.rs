//! tunnelroom - a relay room for peer-to-peer tunnels
//!
//! Peers connect with their ed25519 identity, announce themselves and open
//! tunnels to each other through the room.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use room_control::{DuplicatePolicy, Room, RoomConfig};
use room_proto::{KeyPair, PrivacyMode};
use room_transport::TcpRoomListener;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// tunnelroom - relay tunnels between peers
#[derive(Parser, Debug)]
#[command(name = "tunnelroom")]
#[command(about = "tunnelroom - relay tunnels between peers")]
#[command(version = env!("GIT_TAG"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the room
    #[command(long_about = r#"
Run a room server. Settings come from the YAML config file when one is
given; command line flags and environment variables override it.

EXAMPLES:
  # Open room with default settings and a generated key
  tunnelroom serve

  # Community room from a config file, reachable as room.example.com
  tunnelroom serve --config room.yaml --domain room.example.com

ENVIRONMENT VARIABLES:
  TUNNELROOM_CONFIG        Config file path
  TUNNELROOM_LISTEN        Peer listen address
  TUNNELROOM_HTTP          HTTP listen address
  TUNNELROOM_DOMAIN        Public domain of the room
  TUNNELROOM_KEY_FILE      Path of the room's secret key
  TUNNELROOM_PRIVACY_MODE  open | community | restricted
    "#)]
    Serve {
        /// YAML config file
        #[arg(short, long, env = "TUNNELROOM_CONFIG")]
        config: Option<PathBuf>,

        /// Address peers connect to (e.g., 0.0.0.0:8008)
        #[arg(long, env = "TUNNELROOM_LISTEN")]
        listen: Option<SocketAddr>,

        /// Address of the HTTP endpoints (e.g., 0.0.0.0:3000)
        #[arg(long, env = "TUNNELROOM_HTTP")]
        http: Option<SocketAddr>,

        /// Public domain used in multiserver addresses
        #[arg(long, env = "TUNNELROOM_DOMAIN")]
        domain: Option<String>,

        /// Base of alias URLs handed to peers
        #[arg(long, env = "TUNNELROOM_ALIAS_BASE_URL")]
        alias_base_url: Option<String>,

        /// File holding the room's secret key, created if missing
        #[arg(long, env = "TUNNELROOM_KEY_FILE")]
        key_file: Option<PathBuf>,

        /// Privacy mode: open, community or restricted
        #[arg(long, env = "TUNNELROOM_PRIVACY_MODE")]
        privacy_mode: Option<PrivacyMode>,

        /// What to do with a second connection from a connected peer: reject or replace-oldest
        #[arg(long, env = "TUNNELROOM_DUPLICATE_POLICY")]
        duplicate_policy: Option<DuplicatePolicy>,
    },

    /// Print a fresh identity and its secret seed
    Keygen,

    /// Print a commented config file template
    Config,
}

/// Setup logging with the specified log level. `RUST_LOG` wins when set.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Load the room key from `path`, generating and saving one if the file is missing
fn load_or_create_keys(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file {}", path.display()))?;
        let keys = KeyPair::from_base64_seed(&encoded)
            .with_context(|| format!("Invalid key in {}", path.display()))?;
        info!(path = %path.display(), "Loaded room key");
        return Ok(keys);
    }

    let keys = KeyPair::generate();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create key file {}", path.display()))?;
    writeln!(file, "{}", keys.to_base64_seed())
        .with_context(|| format!("Failed to write key file {}", path.display()))?;

    info!(path = %path.display(), "Generated new room key");
    Ok(keys)
}

#[allow(clippy::too_many_arguments)]
fn build_config(
    config: Option<PathBuf>,
    listen: Option<SocketAddr>,
    http: Option<SocketAddr>,
    domain: Option<String>,
    alias_base_url: Option<String>,
    key_file: Option<PathBuf>,
    privacy_mode: Option<PrivacyMode>,
    duplicate_policy: Option<DuplicatePolicy>,
) -> Result<RoomConfig> {
    let mut room_config = match config {
        Some(path) => RoomConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RoomConfig::default(),
    };

    if let Some(listen) = listen {
        room_config.listen_addr = listen;
    }
    if let Some(http) = http {
        room_config.http_addr = http;
    }
    if let Some(domain) = domain {
        room_config.domain = domain;
    }
    if let Some(alias_base_url) = alias_base_url {
        room_config.alias_base_url = alias_base_url;
    }
    if let Some(key_file) = key_file {
        room_config.key_file = key_file;
    }
    if let Some(privacy_mode) = privacy_mode {
        room_config.privacy_mode = privacy_mode;
    }
    if let Some(duplicate_policy) = duplicate_policy {
        room_config.duplicate_policy = duplicate_policy;
    }

    room_config
        .validate()
        .context("Invalid room configuration")?;
    Ok(room_config)
}

async fn serve(config: RoomConfig) -> Result<()> {
    let keys = load_or_create_keys(&config.key_file)?;
    let listen_addr = config.listen_addr;
    let http_addr = config.http_addr;

    let room = Room::new(config, keys).context("Failed to create room")?;
    info!("Room identity: {}", room.id());
    info!("Multiserver address: {}", room.multiserver_address());

    let listener = TcpRoomListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    let shutdown = CancellationToken::new();
    let room_task = tokio::spawn(room.clone().serve(listener, shutdown.clone()));
    let http_task = tokio::spawn(room_http::serve(room.clone(), http_addr, shutdown.clone()));

    // Sign-in sessions nobody answered are dropped periodically
    let purge_room = room.clone();
    let purge_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(room_control::bridge::SIGN_IN_TTL);
        loop {
            tokio::select! {
                _ = purge_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let purged = purge_room.bridge().purge_expired();
                    if purged > 0 {
                        info!(purged, "Dropped expired sign-in sessions");
                    }
                }
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Shutting down...");
    shutdown.cancel();

    if let Err(e) = room_task.await {
        error!("Room task panicked: {}", e);
    }
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("HTTP endpoints stopped with error: {}", e),
        Err(e) => error!("HTTP task panicked: {}", e),
    }

    info!("tunnelroom stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            config,
            listen,
            http,
            domain,
            alias_base_url,
            key_file,
            privacy_mode,
            duplicate_policy,
        } => {
            info!(
                "tunnelroom {} ({}) built {}",
                env!("GIT_TAG"),
                env!("GIT_HASH"),
                env!("BUILD_TIME")
            );
            let config = build_config(
                config,
                listen,
                http,
                domain,
                alias_base_url,
                key_file,
                privacy_mode,
                duplicate_policy,
            )?;
            serve(config).await
        }
        Commands::Keygen => {
            let keys = KeyPair::generate();
            println!("identity: {}", keys.identity());
            println!("seed:     {}", keys.to_base64_seed());
            Ok(())
        }
        Commands::Config => {
            print!("{}", RoomConfig::template());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "tunnelroom-{}-{}-{}",
            name,
            std::process::id(),
            nanos
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_key_file_created_once_and_reloaded() {
        let dir = scratch_dir("keys");
        let path = dir.join("nested").join("room.key");

        let created = load_or_create_keys(&path).unwrap();
        let loaded = load_or_create_keys(&path).unwrap();
        assert_eq!(created.identity(), loaded.identity());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_key_file_is_rejected() {
        let dir = scratch_dir("bad-key");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("room.key");
        std::fs::write(&path, "not a seed\n").unwrap();

        assert!(load_or_create_keys(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not a seed\n");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
