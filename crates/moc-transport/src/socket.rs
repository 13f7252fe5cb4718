//! Message-socket surface: one JSON object per line over a plain TCP
//! connection, request/reply. The original request/reply message socket is
//! a ZeroMQ REQ/REP pair; that dependency isn't part of the stack this
//! workspace otherwise pulls in, so the same request/reply contract — one
//! envelope in, one envelope out, correlation id echoed — is carried over a
//! bare `tokio::net::TcpListener` instead. The wire contract (§6) is what's
//! specified, not the socket library.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::operations::{dispatch, Coordinator};

#[derive(Debug, Deserialize)]
struct Envelope {
    correlation_id: String,
    op: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Reply {
    correlation_id: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

pub async fn serve(coordinator: Coordinator, port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "message-socket surface starting");
    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, coordinator).await {
                warn!(peer = %peer, error = %e, "message-socket connection ended with error");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, coordinator: Coordinator) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => {
                let correlation_id = envelope.correlation_id.clone();
                match dispatch(&coordinator, &envelope.op, envelope.params).await {
                    Ok(result) => Reply {
                        correlation_id,
                        ok: true,
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => Reply {
                        correlation_id,
                        ok: false,
                        result: None,
                        error: Some(serde_json::json!({ "code": e.error_code(), "message": e.to_string() })),
                    },
                }
            }
            Err(e) => Reply {
                correlation_id: "unknown".to_string(),
                ok: false,
                result: None,
                error: Some(serde_json::json!({ "code": "BAD_ENVELOPE", "message": e.to_string() })),
            },
        };
        let mut out = serde_json::to_vec(&reply).unwrap_or_default();
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    Ok(())
}
