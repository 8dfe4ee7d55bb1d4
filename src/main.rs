//! tgfilestream - command line companion for the file server
//!
//! Usage:
//!   tgfilestream link --chat-id <id> --message-id <id> --name <file>
//!   tgfilestream inspect <token>
//!   tgfilestream check-config
//!   tgfilestream init --token-secret <secret>

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tgfilestream::{
    config::Config,
    locator::{LocatorCodec, ResourceIdentity},
    logging, server,
};
use tracing::{error, info};

const CONFIG_FILE_ENV: &str = "CFG_FILE";

#[derive(Parser)]
#[command(name = "tgfilestream")]
#[command(version)]
#[command(about = "Stream files from Telegram messages over HTTP")]
struct Cli {
    /// Configuration file path (defaults to $CFG_FILE, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the public link of a message's file
    Link {
        /// Chat the message was posted in
        #[arg(long, allow_hyphen_values = true)]
        chat_id: i64,

        /// Message id within the chat
        #[arg(long)]
        message_id: i64,

        /// The chat is a group
        #[arg(long)]
        group: bool,

        /// The chat is a channel
        #[arg(long)]
        channel: bool,

        /// File name as served by the server
        #[arg(long)]
        name: String,
    },

    /// Decode a token and show the message it addresses
    Inspect {
        /// Token from a public link
        token: String,
    },

    /// Load and validate the configuration
    CheckConfig,

    /// Write a default configuration file
    Init {
        /// Secret used to seal tokens
        #[arg(long)]
        token_secret: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    if let Err(e) = logging::init(level) {
        eprintln!("{}", e);
    }

    let config_path = resolve_config_path(cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Link {
            chat_id,
            message_id,
            group,
            channel,
            name,
        } => {
            let identity = ResourceIdentity {
                chat_id,
                message_id,
                is_group: group,
                is_channel: channel,
            };
            cmd_link(config_path, &identity, &name)
        }

        Commands::Inspect { token } => cmd_inspect(config_path, &token),

        Commands::CheckConfig => cmd_check_config(config_path),

        Commands::Init {
            token_secret,
            force,
        } => cmd_init(config_path, token_secret, force),
    }
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    Config::load_or_env(config_path)
        .with_context(|| format!("Cannot load configuration from {:?}", config_path))
}

fn cmd_link(config_path: &Path, identity: &ResourceIdentity, name: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let codec = LocatorCodec::new(&config.security.token_secret)?;
    let token = codec.encode(identity)?;

    println!(
        "{}",
        server::public_link(&config.server.link_prefix(), &token, name)
    );
    Ok(())
}

fn cmd_inspect(config_path: &Path, token: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let codec = LocatorCodec::new(&config.security.token_secret)?;
    let identity = codec
        .decode(token)
        .with_context(|| format!("Token {} does not decode", logging::redact_token(token)))?;

    println!("Message:    {}", identity);
    println!("Chat id:    {}", identity.chat_id);
    println!("Message id: {}", identity.message_id);
    println!("Group:      {}", identity.is_group);
    println!("Channel:    {}", identity.is_channel);
    Ok(())
}

fn cmd_check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    let source = if config_path.is_file() {
        format!("{:?}", config_path)
    } else {
        "environment only".to_string()
    };
    let max_file_size = match config.server.max_file_size {
        Some(size) => format!("{} MB", size / 1024 / 1024),
        None => "unlimited".to_string(),
    };

    println!("tgfilestream configuration");
    println!("==========================");
    println!();
    println!("Source: {}", source);
    println!("Listen: {}:{}", config.server.host, config.server.port);
    println!("Link prefix: {}", config.server.link_prefix());
    println!("Requests per client: {}", config.server.request_limit);
    println!("Max file size: {}", max_file_size);
    println!(
        "Forwarded headers: {}",
        if config.server.trust_forwarded_headers { "trusted" } else { "ignored" }
    );
    println!(
        "Index page: {}",
        if config.server.show_index { "shown" } else { "hidden" }
    );
    println!(
        "Delete endpoint: {}",
        if config.security.delete_key.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!(
        "Connections per partition: {}",
        config.pool.connections_per_partition
    );
    println!(
        "Chunk size: {} KB (block {} B, max {} KB)",
        config.transfer.chunk_size / 1024,
        config.transfer.block_size,
        config.transfer.max_chunk_size / 1024
    );
    println!("Pipeline depth: {}", config.transfer.pipeline_depth);
    println!("Log level: {}", config.logging.level);
    Ok(())
}

fn cmd_init(config_path: &Path, token_secret: String, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{:?} already exists (use --force to overwrite)",
            config_path
        );
    }

    let mut config = Config::default();
    config.security.token_secret = token_secret;
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {:?}", parent))?;
    }
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return expand_tilde(&path);
    }
    if let Some(path) = std::env::var_os(CONFIG_FILE_ENV).filter(|v| !v.is_empty()) {
        return expand_tilde(Path::new(&path));
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tgfilestream")
        .join("config.json")
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
