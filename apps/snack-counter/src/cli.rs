use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::protocol::{ClientMessage, ServerMessage, SessionMode};

#[derive(Parser, Debug)]
#[command(name = "snack-counter")]
#[command(about = "Snack counter session server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Speak the wire protocol against a running server
    Probe {
        /// Server URL (e.g., ws://localhost:4000)
        #[arg(short, long, default_value = "ws://localhost:4000")]
        url: String,

        #[command(subcommand)]
        command: ProbeCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProbeCommands {
    /// Attach as mama and print the current queue snapshot
    Queue,

    /// Register a throwaway guest and print the assigned position
    Register {
        #[arg(long, default_value = "cheerful")]
        mood: String,

        /// "text" or "voice"
        #[arg(long, default_value = "text")]
        mode: String,
    },
}

pub async fn run_probe(url: String, command: ProbeCommands) -> Result<()> {
    match command {
        ProbeCommands::Queue => {
            let mut socket = connect(&url, "mama").await?;
            // The snapshot is pushed right after attach.
            let message = await_message(&mut socket, |message| {
                matches!(message, ServerMessage::QueueUpdate { .. })
            })
            .await?;
            if let ServerMessage::QueueUpdate { queue } = message {
                println!("{}", serde_json::to_string_pretty(&queue)?);
            }
        }
        ProbeCommands::Register { mood, mode } => {
            let mode = match mode.as_str() {
                "voice" => SessionMode::Voice,
                _ => SessionMode::Text,
            };
            let mut socket = connect(&url, "guest").await?;
            let register = ClientMessage::RegisterIntent {
                durable_id: format!("probe-{}", crate::protocol::generate_handle()),
                mood: Some(mood),
                mode,
                room_tag: None,
            };
            socket
                .send(Message::Text(serde_json::to_string(&register)?.into()))
                .await?;

            let message = await_message(&mut socket, |message| {
                matches!(message, ServerMessage::QueuePosition { .. })
            })
            .await?;
            if let ServerMessage::QueuePosition { position, size } = message {
                println!("position {position} of {size}");
            }
        }
    }
    Ok(())
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str, role: &str) -> Result<WsStream> {
    let ws_url = format!("{}/ws?role={}", url.trim_end_matches('/'), role);
    debug!("Connecting to {}", ws_url);

    let (stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            return Err(anyhow::anyhow!("Connection failed: {}", err));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "Connection timeout - is the server running?"
            ));
        }
    };
    Ok(stream)
}

async fn await_message<F>(socket: &mut WsStream, matches: F) -> Result<ServerMessage>
where
    F: Fn(&ServerMessage) -> bool,
{
    let wait = timeout(Duration::from_secs(5), async {
        while let Some(frame) = socket.next().await {
            if let Message::Text(text) = frame? {
                let message: ServerMessage = serde_json::from_str(&text)?;
                if matches(&message) {
                    return Ok::<_, anyhow::Error>(message);
                }
            }
        }
        Err(anyhow::anyhow!("Connection closed unexpectedly"))
    })
    .await;

    match wait {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("Timeout waiting for server response")),
    }
}
