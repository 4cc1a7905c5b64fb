//! Line-oriented terminal front end.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iroh::NodeId;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::{info, warn};

use crate::{
    mesh::{
        history::MessageHistory, parse_room_id, room_id, ChatMessage, IrohTransport,
        MeshConfig, PeerEvent, PeerManager, ProtocolMessage,
    },
    utils::short_id,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Nickname shown to the other members of the room.
    #[arg(long, short)]
    pub nickname: String,

    /// Log debug output to stderr.
    #[arg(long, short)]
    pub verbose: bool,

    /// Print every event as a JSON line instead of a transcript.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a new room and print its id.
    Create,
    /// Join the room with the given id.
    Join {
        /// 64-character hex id printed by `create`.
        room_id: String,
    },
}

/// Logs go to stderr; `RUST_LOG` overrides the default filter.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,chatter_lib={level}")));
    let _ = fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    // Reject a malformed room id before touching the network.
    let room = match &cli.command {
        Command::Create => None,
        Command::Join { room_id } => Some(parse_room_id(room_id)?),
    };

    let config = MeshConfig::default();
    let transport = IrohTransport::bind(None, &config.alpn)
        .await
        .context("failed to bind endpoint")?;
    let manager = PeerManager::with_config(cli.nickname.clone(), transport, config);
    let mut events = manager.subscribe();
    let mut console = Console::new(cli.json);

    match room {
        None => {
            let id = manager.create().await?;
            console
                .notice(&format!("room created, share this id: {}", room_id(&id)))
                .await?;
        }
        Some(room) => manager.join(room).await?,
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            event = events.recv() => match event {
                Some(Ok(event)) => console.render(&manager, event).await?,
                Some(Err(err)) => {
                    warn!("event stream failed: {err:#}");
                    break;
                }
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !console.handle_line(&manager, line.trim()).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    info!("leaving room");
    manager.close().await;
    Ok(())
}

/// What the user sees: a transcript deduplicated by message id, and the
/// nicknames needed to label departures.
struct Console {
    json: bool,
    transcript: MessageHistory,
    names: HashMap<NodeId, String>,
}

impl Console {
    fn new(json: bool) -> Self {
        Self {
            json,
            transcript: MessageHistory::default(),
            names: HashMap::new(),
        }
    }

    /// Returns false when the user asked to leave.
    async fn handle_line(&mut self, manager: &PeerManager, line: &str) -> Result<bool> {
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };
        match command {
            "" => {}
            "/quit" => {
                self.notice("leaving room").await?;
                return Ok(false);
            }
            "/nick" if !arg.is_empty() => {
                manager.set_nickname(arg).await?;
                self.notice(&format!("you are now {arg}")).await?;
            }
            "/sync" => manager.request_sync(None).await?,
            "/peers" => {
                let peers = manager.peers();
                if peers.is_empty() {
                    self.notice("nobody else is here").await?;
                }
                for peer in peers {
                    let state = if peer.connected { "connected" } else { "known" };
                    self.notice(&format!(
                        "{} ({}) {state}",
                        peer.nickname,
                        short_id(&peer.node_id)
                    ))
                    .await?;
                }
            }
            _ if command.starts_with('/') => {
                self.notice("commands: /nick NAME, /sync, /peers, /quit")
                    .await?;
            }
            _ => {
                let message = manager.send_chat_message(line).await?;
                manager.add_to_history(message.clone());
                self.show_message(message).await?;
            }
        }
        Ok(true)
    }

    async fn render(&mut self, manager: &PeerManager, event: PeerEvent) -> io::Result<()> {
        if self.json {
            // Keep the transcript in step so history reaches later joiners.
            if let PeerEvent::Message {
                message: ProtocolMessage::Chat(message),
            } = &event
            {
                manager.add_to_history(message.clone());
            }
            let line = serde_json::to_string(&event).map_err(io::Error::other)?;
            return write_stdout(&line).await;
        }

        match event {
            PeerEvent::Connected => {
                self.notice(&format!("connected as {}", manager.nickname()))
                    .await
            }
            PeerEvent::Message { message } => match message {
                ProtocolMessage::Chat(message) => {
                    manager.add_to_history(message.clone());
                    self.show_message(message).await
                }
                ProtocolMessage::Nickname { node_id, nickname } => {
                    let old = self.names.insert(node_id, nickname.clone());
                    let old = old.unwrap_or_else(|| short_id(&node_id));
                    self.notice(&format!("{old} is now known as {nickname}"))
                        .await
                }
                _ => Ok(()),
            },
            PeerEvent::PeerJoined { peer } => {
                self.names.insert(peer.node_id, peer.nickname.clone());
                self.notice(&format!(
                    "{} ({}) joined",
                    peer.nickname,
                    short_id(&peer.node_id)
                ))
                .await
            }
            PeerEvent::PeerLeft { node_id } => {
                let name = self
                    .names
                    .remove(&node_id)
                    .unwrap_or_else(|| short_id(&node_id));
                self.notice(&format!("{name} left")).await
            }
            PeerEvent::SyncData { messages, peers } => {
                for peer in &peers {
                    self.names.insert(peer.node_id, peer.nickname.clone());
                }
                for message in self.transcript.merge(messages) {
                    self.print_message(&message).await?;
                }
                self.notice(&format!("{} other member(s) in the room", peers.len()))
                    .await
            }
            PeerEvent::Error { message } => write_stderr(&format!("!!! {message}")).await,
        }
    }

    async fn show_message(&mut self, message: ChatMessage) -> io::Result<()> {
        if self.json {
            let line = serde_json::to_string(&message).map_err(io::Error::other)?;
            return write_stdout(&line).await;
        }
        if self.transcript.push(message.clone()) {
            self.print_message(&message).await?;
        }
        Ok(())
    }

    async fn print_message(&self, message: &ChatMessage) -> io::Result<()> {
        write_stdout(&format!("<{}> {}", message.nickname, message.text)).await
    }

    async fn notice(&self, text: &str) -> io::Result<()> {
        if self.json {
            return Ok(());
        }
        write_stdout(&format!("*** {text}")).await
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_with_nickname() {
        let cli = Cli::try_parse_from(["chatter", "--nickname", "alice", "join", "abc"]).unwrap();
        assert_eq!(cli.nickname, "alice");
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Command::Join { room_id } if room_id == "abc"));
    }

    #[test]
    fn nickname_is_required() {
        assert!(Cli::try_parse_from(["chatter", "create"]).is_err());
        let cli = Cli::try_parse_from(["chatter", "-n", "bob", "-v", "--json", "create"]).unwrap();
        assert!(cli.verbose && cli.json);
        assert!(matches!(cli.command, Command::Create));
    }
}
