//! Terminal chat over a Phoenix channel.
//!
//! Joins a topic, prints everything broadcast on it, and pushes each line
//! read from stdin as a `new_msg`.
//!
//! # Running the demo
//!
//! ```bash
//! cargo run --package chat-demo -- ws://localhost:4000/socket --topic room:lobby
//! ```

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments.
#[derive(Parser, Debug)]
struct Args {
    /// Server endpoint; `http(s)` schemes are normalized to `ws(s)`.
    #[arg(default_value = "ws://localhost:4000/socket")]
    endpoint: String,

    /// Topic to join.
    #[arg(long, default_value = "room:lobby")]
    topic: String,

    /// Optional auth token sent as a connect param.
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut builder = ember::socket(&args.endpoint);
    if let Some(token) = &args.token {
        let mut params = serde_json::Map::new();
        params.insert("token".to_owned(), json!(token));
        builder = builder.params(params);
    }
    let socket = builder.build();

    socket.on_open(|| info!("socket open"));
    socket.on_close(|code, reason| info!(code, reason = ?reason, "socket closed"));
    socket.connect();

    let room = socket.channel(args.topic.clone(), json!({}));
    room.on("new_msg", |msg| {
        let payload = msg.payload_value();
        let body = payload.get("body").and_then(|b| b.as_str()).unwrap_or("<empty>");
        println!("<< {body}");
    });

    let topic = args.topic.clone();
    room.join(None)
        .receive("ok", move |_| info!(topic = %topic, "joined"))
        .receive("error", |msg| warn!(reason = %msg.payload_value(), "join refused"))
        .receive("timeout", |_| warn!("join timed out; retrying on backoff"));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let body = line.trim();
        if body.is_empty() {
            continue;
        }
        room.push("new_msg", json!({ "body": body }), None)
            .receive("error", |msg| warn!(reason = %msg.payload_value(), "message rejected"))
            .receive("timeout", |_| warn!("message was not acknowledged"));
    }

    socket.disconnect(None, Some("goodbye"));
    Ok(())
}
