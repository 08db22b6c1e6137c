use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use lib_session::transport::json_codec::{DecodedFrame, JsonCodec};
use lib_session::{ClassOfService, Domain};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Scripted client session against a running server_provider", long_about = None)]
struct Args {
    /// Provider websocket endpoint
    #[clap(long, default_value = "ws://127.0.0.1:14002/ws")]
    url: String,

    /// Login user name
    #[clap(long, default_value = "alice")]
    user: String,

    /// Items to request on the configured service
    #[clap(long, value_delimiter = ',', default_value = "TRI.N,IBM.N,AAPL.O")]
    items: Vec<String>,

    /// Service id to request items on
    #[clap(long, default_value_t = 1)]
    service_id: u16,

    /// Seconds to wait for each reply before giving up
    #[clap(long, default_value_t = 10)]
    wait_seconds: u64,
}

#[derive(Default)]
struct Download {
    parts: u32,
    bytes: usize,
    lines: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("connecting to {}", args.url))?;
    let (mut write, mut read) = ws_stream.split();

    let mut requests = vec![
        json!({"kind": "request", "domain": "login", "streamId": 1, "name": args.user}),
        json!({"kind": "request", "domain": "directory", "streamId": 2, "filter": 0x3F, "serviceId": args.service_id}),
        json!({"kind": "request", "domain": "dictionary", "streamId": 3, "name": "RWFFld", "filter": 0xF}),
        json!({"kind": "request", "domain": "dictionary", "streamId": 4, "name": "RWFEnum", "filter": 0xF}),
        json!({"kind": "request", "domain": "tunnel", "streamId": 5, "name": "orders", "classOfService": ClassOfService::default()}),
        // Expected rejections: unknown domain and an item on a foreign service.
        json!({"kind": "request", "domain": "symbolList", "streamId": 6}),
        json!({"kind": "request", "domain": "item", "streamId": 7, "name": "BAD.X", "serviceId": args.service_id.wrapping_add(1)}),
    ];
    for (i, item) in args.items.iter().enumerate() {
        requests.push(json!({
            "kind": "request",
            "domain": "item",
            "streamId": 10 + i,
            "name": item,
            "serviceId": args.service_id,
        }));
    }

    let expected = requests.len();
    for request in &requests {
        write.send(Message::Text(request.to_string().into())).await?;
    }
    println!("Sent {} requests.", expected);

    let mut answered = 0;
    let mut downloads: HashMap<i32, Download> = HashMap::new();
    while answered < expected {
        let next = timeout(Duration::from_secs(args.wait_seconds), read.next())
            .await
            .context("timed out waiting for the provider")?;
        let bytes: Bytes = match next {
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => bail!("provider closed the connection after {} answers", answered),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        match JsonCodec::decode_frame(&bytes)? {
            DecodedFrame::Refresh { domain, stream_id, name, .. } => {
                println!("REFRESH {:>10} stream {:>3} '{}'", domain, stream_id, name);
                answered += 1;
            }
            DecodedFrame::Status { domain, stream_id, stream_state, code, text, .. } => {
                let label = domain.map(|d| d.as_str()).unwrap_or("?");
                println!("STATUS  {:>10} stream {:>3} {:?}/{:?}: {}", label, stream_id, stream_state, code, text);
                answered += 1;
            }
            DecodedFrame::RefreshPart { domain, stream_id, refresh_complete, body, .. } => {
                let download = downloads.entry(stream_id).or_default();
                download.parts += 1;
                download.bytes += body.len();
                download.lines += body.iter().filter(|b| **b == b'\n').count();
                if refresh_complete {
                    println!(
                        "REFRESH {:>10} stream {:>3} complete: {} parts, {} bytes, {} entries",
                        domain, stream_id, download.parts, download.bytes, download.lines
                    );
                    answered += 1;
                }
            }
        }
    }

    // Close everything we opened; the provider answers closes silently.
    for request in &requests {
        let (Some(domain), Some(stream_id)) = (request["domain"].as_str(), request["streamId"].as_i64()) else {
            continue;
        };
        if Domain::from_label(domain).is_some() {
            let close = json!({"kind": "close", "domain": domain, "streamId": stream_id});
            write.send(Message::Text(close.to_string().into())).await?;
        }
    }
    write.send(Message::Close(None)).await?;
    println!("Session finished: {} answers.", answered);
    Ok(())
}
