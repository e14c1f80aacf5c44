use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use hearth_client::{HttpBackend, run_realtime};
use hearth_sync::config::SyncConfig;
use hearth_sync::{RoomSession, RoomStatus, RoomView, SyncContext};
use hearth_types::models::{PresenceEntry, RoomKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=info,hearth_client=info,hearth_sync=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Config
    let url = std::env::var("HEARTH_URL").unwrap_or_else(|_| "http://127.0.0.1:8090".into());
    let email = std::env::var("HEARTH_EMAIL").context("HEARTH_EMAIL must be set")?;
    let password = std::env::var("HEARTH_PASSWORD").context("HEARTH_PASSWORD must be set")?;
    let room_id = std::env::var("HEARTH_ROOM").context("HEARTH_ROOM must be set")?;
    let kind: RoomKind = std::env::var("HEARTH_ROOM_KIND")
        .unwrap_or_else(|_| "campfire".into())
        .parse()
        .map_err(anyhow::Error::msg)?;
    let config = SyncConfig::from_env()?;

    let backend = Arc::new(HttpBackend::new(url.clone()));
    let user = backend
        .login(&email, &password)
        .await
        .with_context(|| format!("login to {} failed", url))?;
    info!("Hearth client connected to {} as {}", url, user.display_name());

    let ctx = SyncContext::new(backend.clone(), config.clone());
    let _background = ctx.start();
    let transport = tokio::spawn(run_realtime(
        backend.clone(),
        ctx.realtime.clone(),
        config.clone(),
    ));

    let room = RoomSession::open(&ctx, kind, &room_id);
    let mut view_rx = room.subscribe();
    let mut presence_rx = room.presence();
    let mut connection_rx = ctx.realtime.monitor().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown = HashSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if let Err(e) = room.send(line) {
                            warn!("Message not sent: {}", e);
                        }
                    }
                    None => break,
                }
            }

            Ok(()) = view_rx.changed() => {
                let view = view_rx.borrow_and_update().clone();
                render(&view, &mut shown);
                match view.status {
                    RoomStatus::NotFound => {
                        println!("-- room {} not found", room_id);
                        break;
                    }
                    RoomStatus::SessionEnded => {
                        println!("-- session ended, sign in again");
                        break;
                    }
                    RoomStatus::Loading | RoomStatus::Ready => {}
                }
            }

            Ok(()) = connection_rx.changed() => {
                println!("-- {}", *connection_rx.borrow_and_update());
            }

            Some(roster) = next_roster(&mut presence_rx) => {
                let names: Vec<&str> = roster.iter().map(|p| p.display_name.as_str()).collect();
                println!("-- here: {}", names.join(", "));
            }
        }
    }

    transport.abort();
    Ok(())
}

/// Print messages that appeared since the last view and note the ones that left.
fn render(view: &RoomView, shown: &mut HashSet<String>) {
    let current: HashSet<String> = view
        .messages
        .iter()
        .filter(|m| !m.is_optimistic())
        .map(|m| m.id.clone())
        .collect();

    for message in &view.messages {
        if message.is_optimistic() || shown.contains(&message.id) {
            continue;
        }
        println!(
            "[{}] {}: {}",
            message.created_at.format("%H:%M:%S"),
            message.author_display_name,
            message.body
        );
    }

    let gone = shown.difference(&current).count();
    if gone > 0 {
        println!("-- {} message(s) burned out", gone);
    }
    *shown = current;
}

async fn next_roster(
    rx: &mut Option<watch::Receiver<Vec<PresenceEntry>>>,
) -> Option<Vec<PresenceEntry>> {
    match rx {
        Some(rx) => {
            rx.changed().await.ok()?;
            Some(rx.borrow_and_update().clone())
        }
        None => std::future::pending().await,
    }
}
