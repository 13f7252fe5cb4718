//! Binary-RPC surface: the same `{op, params}` envelope as `socket`, but
//! framed as a 4-byte big-endian length prefix followed by the JSON payload
//! instead of a newline, so a single malformed payload can't desynchronize
//! the stream the way an embedded newline would on the line-delimited
//! surface. Distinct framing, identical operation contract (§6).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::operations::{dispatch, Coordinator};

const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

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
    info!(addr = %addr, "binary-RPC surface starting");
    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, coordinator).await {
                warn!(peer = %peer, error = %e, "binary-RPC connection ended with error");
            }
        });
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream, coordinator: Coordinator) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;

        let reply = match serde_json::from_slice::<Envelope>(&body) {
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

        let payload = serde_json::to_vec(&reply).unwrap_or_default();
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stream.write_all(&payload).await?;
    }
}
