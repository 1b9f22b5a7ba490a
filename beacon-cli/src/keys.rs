//! Identity and known-key commands.

use crate::{IdentityCommands, KeysCommands};
use anyhow::{bail, Result};
use beacon_common::Config;
use beacon_core::known_keys::{KnownKeys, TrustOutcome};
use beacon_core::signer::KEY_FILE;
use beacon_core::Keypair;

pub fn identity(config: &Config, command: IdentityCommands) -> Result<()> {
    let path = config.data_dir().join(KEY_FILE);
    match command {
        IdentityCommands::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "an identity already exists at {} (use --force to replace it)",
                    path.display()
                );
            }
            let keypair = Keypair::generate();
            keypair.save(&path)?;
            println!("Created identity {}", keypair.handle());
            println!("Public key: {}", keypair.public_hex());
            println!("Key file:   {}", path.display());
            Ok(())
        }
        IdentityCommands::Show => {
            let keypair = Keypair::load(&path)?;
            println!("Handle:     {}", keypair.handle());
            println!("Public key: {}", keypair.public_hex());
            println!("Key file:   {}", path.display());
            Ok(())
        }
    }
}

fn report(handle: &str, outcome: TrustOutcome) -> Result<()> {
    match outcome {
        TrustOutcome::Added => println!("Pinned {handle}"),
        TrustOutcome::Refreshed => println!("{handle} already pinned, refreshed"),
        TrustOutcome::Rotated => println!("Rotated key for {handle}"),
        TrustOutcome::Conflict => {
            bail!("{handle} is pinned to a different key; pass --rotate or use `keys rotate`")
        }
    }
    Ok(())
}

pub fn handle_command(config: &Config, command: KeysCommands) -> Result<()> {
    let keys = KnownKeys::new(&config.data_dir());
    match command {
        KeysCommands::Trust {
            handle,
            pubkey,
            rotate,
        } => report(&handle, keys.trust(&handle, &pubkey, rotate)?),

        KeysCommands::Learn { handle, pubkey } => report(&handle, keys.learn(&handle, &pubkey)?),

        KeysCommands::Rotate {
            handle,
            new_pubkey,
            endorsement,
        } => report(&handle, keys.rotate(&handle, &new_pubkey, &endorsement)?),

        KeysCommands::Revoke { handle } => {
            if keys.revoke(&handle)? {
                println!("Revoked {handle}");
            } else {
                println!("{handle} was not pinned");
            }
            Ok(())
        }

        KeysCommands::List { all } => {
            let entries = keys.list(all)?;
            if entries.is_empty() {
                println!("No pinned keys.");
                return Ok(());
            }
            for (handle, key) in entries {
                println!(
                    "{handle:24} {}  last seen {}  rotations {}",
                    key.pubkey_hex,
                    key.last_seen.format("%Y-%m-%d"),
                    key.rotation_count
                );
            }
            Ok(())
        }
    }
}
