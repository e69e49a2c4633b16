//! Shadow Relay command line tool
//!
//! This binary is the command-line interface for the relay node.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use shadow_relay::common::{init_logger, Result};
use shadow_relay::config::{ConfigOverrides, RelayConfig};
use shadow_relay::{HandlerOptions, HandlerRegistry, Server, APP_NAME, VERSION};

/// Shadowsocks-style relay node
///
/// Settings are layered: defaults, then the JSON configuration file, then
/// `SHADOW_RELAY_*` environment variables, then these flags.
#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Load configuration from a JSON file
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    /// Listen address for TCP and UDP (default 0.0.0.0:8388)
    #[arg(short, long)]
    listen: Option<String>,

    /// Handler name
    #[arg(long)]
    handler: Option<String>,

    /// Cipher method (aes-128-gcm, aes-192-gcm, aes-256-gcm, chacha20-ietf-poly1305, none)
    #[arg(short, long)]
    method: Option<String>,

    /// Password the master key is derived from
    #[arg(short, long)]
    password: Option<String>,

    /// Raw master key, used instead of the password
    #[arg(long)]
    key: Option<String>,

    /// Read deadline for the protocol prefix and target address, 0 disables it
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Extra dial attempts per target
    #[arg(long)]
    retries: Option<u32>,

    /// Enable the UDP relay (true/false)
    #[arg(long)]
    udp: Option<bool>,

    /// Relay buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Bypass rules (host, host:port, *.suffix, CIDR), comma separated
    #[arg(long, value_delimiter = ',')]
    bypass: Option<Vec<String>>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Print the effective configuration with secrets masked and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            listen: self.listen,
            handler: self.handler,
            method: self.method,
            password: self.password,
            key: self.key,
            read_timeout_ms: self.read_timeout_ms,
            retries: self.retries,
            udp: self.udp,
            buffer_size: self.buffer_size,
            bypass: self.bypass,
            log_level: self.log_level,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    let print_config = args.print_config;
    let mut config = RelayConfig::load(args.config_file.take().as_deref())?;
    config.apply(args.overrides());

    if print_config {
        println!("{}", config.to_redacted_json()?);
        return Ok(());
    }

    init_logger(&config.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);

    config.validate()?;
    info!("Configuration loaded successfully");

    let handler = HandlerRegistry::with_defaults()
        .build(&config.handler, HandlerOptions::new(config.clone()))?;

    info!("Handler: {}", config.handler);
    info!("Cipher method: {}", config.method);
    if !config.bypass.is_empty() {
        info!(
            "Bypass rules: {} ({})",
            config.bypass.join(", "),
            if config.bypass_whitelist { "whitelist" } else { "blacklist" }
        );
    }

    let udp_buffer_size = config.udp.then(|| config.udp_buffer_size());
    let server = Server::bind(config.listen_addr()?, handler, udp_buffer_size).await?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    info!("Relay ready, press Ctrl+C to stop");
    server.run().await?;

    info!("{} stopped", APP_NAME);
    Ok(())
}
