//! Localhost IPC listener serving `svclocal list` and readiness probes.
//! One JSON request per line, one JSON response per line.

use anyhow::{Context as _, Result};
use svclocal_common::ipc::{IpcRequest, IpcResponse};
use svclocal_proxy::{Stability, StatusBoard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn serve(
    port: u16,
    board: StatusBoard,
    stability: Stability,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind ipc listener on 127.0.0.1:{port}"))?;
    info!(port, "ipc listener ready");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("ipc accept failed: {e}");
                        continue;
                    }
                };

                let board = board.clone();
                let stability = stability.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, board, stability).await {
                        debug!("ipc connection ended: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    board: StatusBoard,
    stability: Stability,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(IpcRequest::List) => IpcResponse::Services {
                services: board.snapshot(),
            },
            Ok(IpcRequest::Stable) => IpcResponse::Stable {
                stable: stability.is_stable(),
            },
            Ok(IpcRequest::Ping) => IpcResponse::Pong,
            Err(e) => IpcResponse::Error {
                message: format!("invalid request: {e}"),
            },
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }
}
