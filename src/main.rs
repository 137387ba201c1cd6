//! Server binary: load configuration, apply CLI overrides, run

use clap::Parser;
use ftpd_rs::config::{self, ListenerConfig, TlsMode};
use ftpd_rs::logger::{LogSplitter, StderrSink};
use ftpd_rs::{ConfigStore, Server};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Multi-user FTP/FTPS server with a TLS administration channel
#[derive(Debug, Parser)]
#[command(name = "ftpd-rs", version)]
struct Cli {
    /// Configuration directory (defaults to the platform config dir)
    #[arg(long, env = "FTPD_RS_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Address for a single FTP listener, overriding the configuration
    #[arg(long)]
    address: Option<IpAddr>,

    /// Port for a single FTP listener, overriding the configuration
    #[arg(long)]
    port: Option<u16>,

    /// Refuse plaintext logins on the overridden listener
    #[arg(long)]
    require_tls: bool,

    /// Administration listener port
    #[arg(long)]
    admin_port: Option<u16>,

    /// Welcome banner text (`%v` expands to the server version)
    #[arg(long)]
    banner: Option<String>,

    /// Write the effective options to the configuration files and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    LogSplitter::global().subscribe(Arc::new(StderrSink));

    let cli = Cli::parse();
    let dir = cli.config_dir.clone().unwrap_or_else(config::config_dir);

    let mut loaded = match config::load_all(&dir).await {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("cannot load configuration from {}: {e}", dir.display());
            return ExitCode::FAILURE;
        }
    };

    // CLI overrides mirror the persisted options.
    if cli.address.is_some() || cli.port.is_some() {
        loaded.listeners = vec![ListenerConfig {
            address: cli.address.unwrap_or_else(|| IpAddr::from([0, 0, 0, 0])),
            port: cli.port.unwrap_or(21),
            tls: TlsMode::Explicit {
                require_tls: cli.require_tls,
            },
        }];
    }
    if let Some(port) = cli.admin_port {
        loaded.admin.port = port;
    }
    if let Some(banner) = cli.banner.clone() {
        loaded.settings.banner = banner;
    }

    if let Err(e) = loaded.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    if cli.write_config {
        return match config::save_all(&dir, &loaded).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("cannot write configuration: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if loaded.listeners.is_empty() {
        error!("no FTP listeners configured; use --port or edit settings.xml");
        return ExitCode::FAILURE;
    }

    let store = Arc::new(ConfigStore::new(loaded));
    let server = Arc::new(Server::new(store, dir));
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
