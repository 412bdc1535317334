use anyhow::{Result, bail};
use clap::Parser;
use saturn::{AuthConfig, Config, Socks5Server, UserPass};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 proxy server", long_about = None)]
struct Args {
    /// Listener address, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    // Check for auth and grab it if present
    match (args.username, args.password) {
        (Some(username), Some(password)) => {
            info!("Authentication enabled");
            // Command-line credentials take precedence over a config file
            // userpass entry
            config
                .auth
                .retain(|entry| !matches!(entry, AuthConfig::UserPass { .. }));
            if args.config.is_none() {
                config.auth.clear();
            }
            config.auth.insert(
                0,
                AuthConfig::UserPass {
                    users: vec![UserPass { username, password }],
                },
            );
        }
        (None, None) => (),
        _ => bail!("[ERR] must provide both username and password (or neither)"),
    }

    // Instantiate server
    let mut server = Socks5Server::from_config(&config)?;

    // Run it
    info!("Starting SOCKS5 proxy: {}", server.listen_addr);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
