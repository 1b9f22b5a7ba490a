//! Platform and UDP commands: ping, send, listen.

use crate::{ActionArgs, PlatformCommands, UdpCommands};
use anyhow::{bail, Context, Result};
use beacon_channels::{
    ActionRequest, Cursor, DispatchReport, Dispatcher, MeshListener, Platform, UdpTransport,
};
use beacon_common::Config;
use beacon_core::inbox::{Inbox, InboxRecord};
use beacon_core::known_keys::KnownKeys;
use beacon_core::Envelope;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Queue between the mesh listener and stdout.
const FORWARD_CAPACITY: usize = 256;

fn request(platform: Platform, args: &ActionArgs) -> ActionRequest {
    ActionRequest {
        platform,
        kind: args.kind,
        to: args.to.clone(),
        amount: args.rtc,
        link: args.link.clone(),
        text: args.text.clone(),
    }
}

fn print_report(report: &DispatchReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

async fn ping(dispatcher: &Dispatcher, platform: Platform, args: &ActionArgs) -> Result<()> {
    let request = request(platform, args);
    if args.dry_run {
        let envelope = dispatcher.preview(&request)?;
        println!("{}", envelope.encode());
        return Ok(());
    }
    let report = dispatcher.dispatch(request).await?;
    print_report(&report)
}

pub async fn platform(config: &Config, platform: Platform, command: PlatformCommands) -> Result<()> {
    let dispatcher = Dispatcher::from_config(config)?;

    match command {
        PlatformCommands::Ping(args) => ping(&dispatcher, platform, &args).await,

        PlatformCommands::Send { envelope } => {
            let envelope = Envelope::decode(&envelope)?;
            let report = dispatcher.submit(platform, envelope).await?;
            print_report(&report)
        }

        PlatformCommands::Listen { after, save, limit } => {
            let transport = dispatcher.transport(platform)?;
            let Some(mut stream) = transport.listen(Cursor(after)) else {
                bail!("{platform} cannot be read with the current configuration");
            };
            let inbox = save.then(|| Inbox::new(&config.data_dir()));
            let mut seen = 0usize;

            loop {
                let item = tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    item = stream.next() => item,
                };
                match item {
                    None => break,
                    Some(Ok(incoming)) => {
                        println!("{}\t{}", incoming.source, incoming.envelope.encode());
                        if let Some(inbox) = &inbox {
                            let record = InboxRecord::new(incoming.envelope, incoming.source, platform.as_str());
                            if !inbox.append_if_new(&record)? {
                                tracing::debug!(source = %record.source_address, "Already in inbox");
                            }
                        }
                        seen += 1;
                        if limit.is_some_and(|limit| seen >= limit) {
                            break;
                        }
                    }
                    Some(Err(e)) if e.is_auth() => return Err(e.into()),
                    Some(Err(e)) => tracing::warn!(error = %e, "Poll failed, will retry"),
                }
            }
            Ok(())
        }
    }
}

pub async fn udp(config: &Config, command: UdpCommands) -> Result<()> {
    match command {
        UdpCommands::Send { action, host, port } => {
            let mut udp = UdpTransport::new(&config.udp);
            if host.is_some() || port.is_some() {
                udp = udp.to(
                    host.unwrap_or_else(|| config.udp.host.clone()),
                    port.unwrap_or(config.udp.port),
                );
            }
            let dispatcher = Dispatcher::from_config(config)?.with_transport(Platform::Udp, Arc::new(udp));
            ping(&dispatcher, Platform::Udp, &action).await
        }

        UdpCommands::Listen { port, bind } => {
            let data_dir = config.data_dir();
            let addr = format!(
                "{}:{}",
                bind.unwrap_or_else(|| config.udp.bind_host.clone()),
                port.unwrap_or(config.udp.port)
            );
            let ttl = chrono::Duration::seconds(
                i64::try_from(config.udp.ttl).context("udp.ttl is too large")?,
            );
            let max_skew = chrono::Duration::seconds(
                i64::try_from(config.udp.max_skew_s).context("udp.max_skew_s is too large")?,
            );
            let (tx, mut rx) = mpsc::channel::<InboxRecord>(FORWARD_CAPACITY);

            let listener = MeshListener::new(addr, Inbox::new(&data_dir), ttl)
                .with_known_keys(KnownKeys::new(&data_dir))
                .with_max_skew(max_skew)
                .with_forward(tx)
                .bind()
                .await?;
            println!("Listening on {}", listener.local_addr());

            let printer = tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    println!("{}\t{}", record.source_address, record.envelope.encode());
                }
            });

            let stats = listener
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
            let _ = printer.await;
            println!(
                "received={} accepted={} duplicates={} dropped={}",
                stats.received, stats.accepted, stats.duplicates, stats.dropped
            );
            Ok(())
        }
    }
}
