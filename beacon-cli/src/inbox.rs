//! Inbox commands.

use crate::InboxCommands;
use anyhow::{bail, Result};
use beacon_common::Config;
use beacon_core::inbox::{Inbox, InboxEntry, InboxFilter};
use beacon_core::known_keys::KnownKeys;
use chrono::{Duration, Utc};

const MAX_RETENTION_DAYS: i64 = 36_500;

fn open(config: &Config) -> Inbox {
    let data_dir = config.data_dir();
    Inbox::new(&data_dir).with_known_keys(KnownKeys::new(&data_dir))
}

fn verified_label(entry: &InboxEntry) -> &'static str {
    match entry.verified {
        Some(true) => "signed",
        Some(false) => "BAD-SIG",
        None => "-",
    }
}

pub fn handle_command(config: &Config, command: InboxCommands) -> Result<()> {
    let inbox = open(config);
    match command {
        InboxCommands::List {
            kind,
            from,
            since_hours,
            unread,
            limit,
            json,
        } => {
            let filter = InboxFilter {
                kind,
                from,
                since: since_hours.map(|h| Utc::now() - Duration::hours(h)),
                unread_only: unread,
                limit,
            };
            let entries = inbox.read(&filter)?;
            if json {
                for entry in &entries {
                    println!("{}", serde_json::to_string(entry)?);
                }
                return Ok(());
            }
            if entries.is_empty() {
                println!("Inbox is empty.");
                return Ok(());
            }
            for entry in &entries {
                let envelope = &entry.record.envelope;
                println!(
                    "{} {} {:8} {:24} {:8} {}",
                    if entry.is_read { " " } else { "*" },
                    entry.record.received_at.format("%Y-%m-%d %H:%M"),
                    envelope.kind,
                    envelope.from,
                    verified_label(entry),
                    envelope.nonce.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }

        InboxCommands::Read { nonce } => {
            let Some(entry) = inbox.get_by_nonce(&nonce)? else {
                bail!("no envelope with nonce {nonce}");
            };
            println!("{}", serde_json::to_string_pretty(&entry)?);
            inbox.mark_read(&nonce)?;
            Ok(())
        }

        InboxCommands::Prune { days } => {
            let days = days
                .unwrap_or_else(|| i64::try_from(config.inbox.retention_days).unwrap_or(MAX_RETENTION_DAYS))
                .clamp(0, MAX_RETENTION_DAYS);
            let cutoff = Utc::now() - Duration::days(days);
            let removed = inbox.prune(cutoff)?;
            println!("Removed {removed} entries older than {days} days.");
            Ok(())
        }
    }
}
