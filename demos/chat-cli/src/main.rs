//! Line-based chat client.
//!
//! Run with: cargo run -p chat-cli-demo -- --self-id alice --peer-id bob
//!
//! Plain lines are sent to the peer. Commands:
//! - `/to <id> <text>` sends to someone else
//! - `/find <db> <collection> [filter json]` prints the matching rows
//! - `/insert <db> <collection> <document json>`
//! - `/quit`

use anyhow::{Context, bail};
use clap::Parser;
use relaylink_session::{ChannelListener, Record, Session, SessionConfig, StoreRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TO_USAGE: &str = "usage: /to <id> <text>";

#[derive(Parser)]
#[command(name = "chat-cli")]
#[command(about = "Chat with a peer over a relaylink session")]
struct Cli {
    /// Peer host
    #[arg(long, env = "RELAYLINK_HOST")]
    host: Option<String>,

    /// Peer port
    #[arg(short, long, env = "RELAYLINK_PORT")]
    port: Option<u16>,

    /// Identity to announce
    #[arg(short, long)]
    self_id: String,

    /// Default recipient for plain lines
    #[arg(short = 'r', long)]
    peer_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let session = Session::new(SessionConfig::from_env());
    let (listener, mut messages) = ChannelListener::new();
    session.set_listener(listener);

    session
        .connect(
            cli.host.as_deref(),
            cli.port,
            &cli.self_id,
            cli.peer_id.as_deref(),
        )
        .await?;

    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            println!("<{}> {}", message.sender_id, message.content());
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        if let Err(e) = handle_line(&session, cli.peer_id.as_deref(), line).await {
            eprintln!("error: {e:#}");
        }
        if !session.is_active() {
            eprintln!("connection lost");
            break;
        }
    }

    session.close().await;
    Ok(())
}

async fn handle_line(session: &Session, peer_id: Option<&str>, line: &str) -> anyhow::Result<()> {
    let Some(command) = line.strip_prefix('/') else {
        let Some(peer_id) = peer_id else {
            bail!("no default recipient, {TO_USAGE}");
        };
        session.send(line, peer_id).await?;
        return Ok(());
    };

    if let Some(rest) = command.strip_prefix("to ") {
        let (recipient, text) = direct_message(rest)?;
        session.send(text, recipient).await?;
        return Ok(());
    }

    let mut parts = command.splitn(4, ' ');
    match parts.next() {
        Some("find") => {
            let (db, collection) = target(&mut parts)?;
            let filter = parts.next().map(parse_record).transpose()?.unwrap_or_default();
            let rows = session
                .query(StoreRequest::find(db, collection, filter))
                .await?
                .unwrap_or_default();
            for row in &rows {
                println!("{}", serde_json::to_string(row)?);
            }
            println!("({} rows)", rows.len());
        }
        Some("insert") => {
            let (db, collection) = target(&mut parts)?;
            let document = parse_record(parts.next().context("missing document")?)?;
            session
                .query(StoreRequest::insert(db, collection, document))
                .await?;
        }
        Some("to") => bail!("{TO_USAGE}"),
        Some(other) => bail!("unknown command /{other}"),
        None => bail!("empty command"),
    }
    Ok(())
}

/// Split the `<id> <text>` that follows `/to`.
fn direct_message(rest: &str) -> anyhow::Result<(&str, &str)> {
    rest.trim_start().split_once(' ').context(TO_USAGE)
}

fn target<'a>(parts: &mut impl Iterator<Item = &'a str>) -> anyhow::Result<(&'a str, &'a str)> {
    match (parts.next(), parts.next()) {
        (Some(db), Some(collection)) => Ok((db, collection)),
        _ => bail!("usage: /<op> <db> <collection> [json]"),
    }
}

fn parse_record(text: &str) -> anyhow::Result<Record> {
    serde_json::from_str(text).with_context(|| format!("invalid JSON object: {text}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_message_keeps_recipient_intact() {
        assert_eq!(direct_message("tomas hi there").unwrap(), ("tomas", "hi there"));
        assert_eq!(direct_message("toto hi").unwrap(), ("toto", "hi"));
        assert_eq!(direct_message("  bob hello").unwrap(), ("bob", "hello"));
        assert!(direct_message("bob").is_err());
    }

    #[test]
    fn test_parse_record_requires_object() {
        assert_eq!(parse_record(r#"{"age": 34}"#).unwrap()["age"], 34);
        assert!(parse_record("[1, 2]").is_err());
    }
}
