use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::protocol::SignalingMessage;
use crate::transfer::{MessageSink, TransferCodec};

#[derive(Parser, Debug)]
#[command(name = "driftwood")]
#[command(about = "Local-network file drop host and pairing client")]
pub struct Cli {
    /// With no subcommand, runs as the host endpoint.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a host, answer its verification challenge, and optionally
    /// send a file over the signaling link
    Pair {
        /// Host URL (e.g., ws://192.168.1.20:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Answer with this code instead of prompting on stdin
        #[arg(short, long)]
        code: Option<i32>,

        /// File to send once verified
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct WsSink {
    writer: Mutex<WsWriter>,
}

#[async_trait::async_trait]
impl MessageSink for WsSink {
    async fn send_text(&self, text: String) -> Result<()> {
        self.writer
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await?;
        Ok(())
    }
}

impl WsSink {
    async fn send_message(&self, message: &SignalingMessage) -> Result<()> {
        self.send_text(serde_json::to_string(message)?).await
    }
}

pub async fn run_pair_client(url: String, code: Option<i32>, file: Option<PathBuf>) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            return Err(anyhow::anyhow!("Connection to {} failed: {}", ws_url, e));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "Connection timeout - is the host running at {}?",
                ws_url
            ));
        }
    };
    let (write, mut read) = ws_stream.split();
    let sink = WsSink {
        writer: Mutex::new(write),
    };

    while let Some(msg) = read.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                return Err(anyhow::anyhow!(
                    "host closed the link: {}",
                    frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "no reason given".to_string())
                ));
            }
            _ => continue,
        };
        let message: SignalingMessage = serde_json::from_str(&text)?;

        match message.kind.as_str() {
            "connected" => debug!("link established"),
            "verification_challenge" => {
                let options = message.options.unwrap_or_default();
                println!("Codes offered by the host: {options:?}");
                let answer = match code {
                    Some(code) => code,
                    None => prompt_for_code().await?,
                };
                sink.send_message(&SignalingMessage::verification_response(answer))
                    .await?;
            }
            "verification_result" => {
                if message.success != Some(true) {
                    return Err(anyhow::anyhow!("verification failed"));
                }
                println!("Verified.");
                let Some(path) = file.as_ref() else {
                    return Ok(());
                };
                send_file(&sink, path).await?;
                return Ok(());
            }
            other => debug!("ignoring message type {}", other),
        }
    }

    Err(anyhow::anyhow!("link closed before verification finished"))
}

async fn prompt_for_code() -> Result<i32> {
    println!("Enter the code displayed on the host:");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("stdin closed"))?;
    Ok(line.trim().parse()?)
}

async fn send_file(sink: &WsSink, path: &PathBuf) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("file path has no name: {}", path.display()))?;
    let bytes = tokio::fs::read(path).await?;

    // Send-only use of the codec; inbound transfer events never fire here.
    let (events, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    let codec = TransferCodec::new(events);
    let file_id = codec.send_file(name, &bytes, sink).await?;
    println!("Sent {} ({} bytes, transfer {})", name, bytes.len(), file_id);
    Ok(())
}
