//! Line-oriented demo peer.
//!
//! ```text
//! sync_peer <listen-addr> <document-id> <secret> [ws://peer ...]
//! ```
//!
//! Each line read from stdin is appended to the document. `:save` writes a
//! snapshot, `:text` prints the document and `:quit` leaves the session.
//!
//! Environment: `TEXT_SYNC_CONFIG` (JSON config file), `TEXT_SYNC_DATA`
//! (snapshot directory, default `.text_sync`), `TEXT_SYNC_USER` (display name)
//! and `RUST_LOG`.

use anyhow::{bail, Context};
use std::sync::Arc;
use text_sync::transport::WebSocketTransport;
use text_sync::{
    DocumentSession, FileSnapshotStore, LocalIdentity, SessionConfig, SessionEvent,
    SessionOptions,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        bail!("usage: sync_peer <listen-addr> <document-id> <secret> [ws://peer ...]");
    }
    let (listen, document_id, secret, peers) = (&args[0], &args[1], &args[2], &args[3..]);

    let config = match std::env::var("TEXT_SYNC_CONFIG") {
        Ok(path) => SessionConfig::from_json_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        Err(_) => SessionConfig::default(),
    };
    let data_dir = std::env::var("TEXT_SYNC_DATA").unwrap_or_else(|_| ".text_sync".to_string());
    let user = std::env::var("TEXT_SYNC_USER").unwrap_or_else(|_| "anonymous".to_string());

    let snapshots = FileSnapshotStore::new(&data_dir)
        .with_context(|| format!("opening snapshot directory {data_dir}"))?;
    let (transport, events) = WebSocketTransport::bind(listen)
        .await
        .with_context(|| format!("listening on {listen}"))?;

    let options = SessionOptions::new(
        document_id.as_str(),
        secret.as_str(),
        LocalIdentity::new(user.clone(), user),
    )
    .with_config(config);
    let session = DocumentSession::open(options, transport, events, Arc::new(snapshots))?;
    println!("listening on {}", session.local_address());

    for peer in peers {
        session.connect(peer.as_str())?;
    }

    let mut session_events = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    ":quit" => break,
                    ":save" => match session.save().await {
                        Ok(()) => println!("saved"),
                        Err(e) => eprintln!("save failed: {e}"),
                    },
                    ":text" => print!("{}", session.text().await?),
                    _ => {
                        let end = session.text().await?.chars().count();
                        session.insert(end, format!("{line}\n")).await?;
                    }
                }
            }
            event = session_events.recv() => {
                match event {
                    Ok(SessionEvent::RemoteChanges(_)) => {
                        println!("--- remote edit ---");
                        print!("{}", session.text().await?);
                    }
                    Ok(SessionEvent::PeerState { peer, state }) => {
                        println!("peer {peer}: {state:?}");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await?;
    Ok(())
}
