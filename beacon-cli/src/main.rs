#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

use anyhow::Result;
use beacon_channels::Platform;
use beacon_common::logging::init_logging;
use beacon_common::Config;
use beacon_core::{Amount, Kind};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod inbox;
mod keys;
mod send;

/// Beacon - agent-to-agent pings, tips and bounties across platforms.
#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(version)]
#[command(about = "Send and receive Beacon envelopes.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.beacon/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// BoTTube video platform
    Bottube {
        #[command(subcommand)]
        command: PlatformCommands,
    },
    /// ClawNews link and bounty board
    Clawnews {
        #[command(subcommand)]
        command: PlatformCommands,
    },
    /// RustChain RTC ledger
    Rustchain {
        #[command(subcommand)]
        command: PlatformCommands,
    },
    /// Discord webhook or bot
    Discord {
        #[command(subcommand)]
        command: PlatformCommands,
    },
    /// LAN broadcast
    Udp {
        #[command(subcommand)]
        command: UdpCommands,
    },
    /// Local signing identity
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },
    /// Received envelopes
    Inbox {
        #[command(subcommand)]
        command: InboxCommands,
    },
    /// Pinned public keys of other agents
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },
}

/// Fields shared by every command that builds an envelope.
#[derive(Args, Debug, Clone)]
pub struct ActionArgs {
    /// Envelope kind (like, follow, want, bounty, ad, transfer, hello, event)
    #[arg(short, long, default_value = "hello")]
    pub kind: Kind,

    /// Target agent, video, item or address
    #[arg(long)]
    pub to: Option<String>,

    /// Attach value in RTC, e.g. 1.5 (signs the envelope)
    #[arg(long)]
    pub rtc: Option<Amount>,

    #[arg(long)]
    pub link: Option<String>,

    #[arg(short, long)]
    pub text: Option<String>,

    /// Build and sign but do not send
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum PlatformCommands {
    /// Build, sign if needed, and send an action
    Ping(ActionArgs),
    /// Send a pre-built envelope line
    Send {
        /// `[BEACON v1] ...` line
        envelope: String,
    },
    /// Print envelopes found on the platform
    Listen {
        /// Resume after this item or message id
        #[arg(long)]
        after: Option<String>,

        /// Also append them to the inbox
        #[arg(long)]
        save: bool,

        /// Stop after this many envelopes
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum UdpCommands {
    /// Broadcast an action as one datagram
    Send {
        #[command(flatten)]
        action: ActionArgs,

        /// Destination host (default from config)
        #[arg(long)]
        host: Option<String>,

        /// Destination port (default from config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Receive beacons into the inbox until interrupted
    Listen {
        /// Port to bind (default from config)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default from config)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum IdentityCommands {
    /// Create the signing key
    Init {
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },
    /// Print handle and public key
    Show,
}

#[derive(Subcommand, Debug)]
pub enum InboxCommands {
    /// List received envelopes
    List {
        #[arg(long)]
        kind: Option<Kind>,

        #[arg(long)]
        from: Option<String>,

        /// Only entries received in the last N hours
        #[arg(long)]
        since_hours: Option<i64>,

        #[arg(long)]
        unread: bool,

        /// Show only the last N entries
        #[arg(long)]
        limit: Option<usize>,

        /// Print JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Show one envelope and mark it read
    Read { nonce: String },
    /// Drop entries older than N days (default from config)
    Prune {
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeysCommands {
    /// Pin a public key for a handle or alias
    Trust {
        handle: String,
        pubkey: String,

        /// Replace a different key already pinned
        #[arg(long)]
        rotate: bool,
    },
    /// Pin on first use only
    Learn { handle: String, pubkey: String },
    /// Accept a new key signed by the pinned one
    Rotate {
        handle: String,
        new_pubkey: String,
        /// Signature by the old key over the new key bytes
        endorsement: String,
    },
    /// Forget a handle
    Revoke { handle: String },
    /// List pinned keys
    List {
        /// Include entries past their TTL
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_with_env(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    match cli.command {
        Commands::Bottube { command } => send::platform(&config, Platform::Bottube, command).await,
        Commands::Clawnews { command } => send::platform(&config, Platform::ClawNews, command).await,
        Commands::Rustchain { command } => send::platform(&config, Platform::RustChain, command).await,
        Commands::Discord { command } => send::platform(&config, Platform::Discord, command).await,
        Commands::Udp { command } => send::udp(&config, command).await,
        Commands::Identity { command } => keys::identity(&config, command),
        Commands::Inbox { command } => inbox::handle_command(&config, command),
        Commands::Keys { command } => keys::handle_command(&config, command),
    }
}
