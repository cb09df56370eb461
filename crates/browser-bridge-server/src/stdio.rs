//! Newline-delimited JSON-RPC over a byte stream (stdin/stdout).

use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc,
    task::JoinHandle,
};

use crate::mcp::{JsonRpcResponse, McpServer, PARSE_ERROR};

/// Responses still being produced after the input ended.
pub struct PendingWrites {
    writer: JoinHandle<()>,
}

impl PendingWrites {
    /// Wait until every in-flight request has been answered and flushed.
    pub async fn finish(self) {
        let _ = self.writer.await;
    }
}

/// Serve requests read from `reader` until it reaches end of input.
///
/// Requests run concurrently; each response is written as soon as it is
/// ready. Returns once the input is exhausted or unreadable; answers to
/// requests still in flight keep flowing through the returned
/// [`PendingWrites`]. A line that is not UTF-8 is answered with a parse
/// error and skipped.
pub async fn serve<R, W>(server: Arc<McpServer>, reader: R, writer: W) -> PendingWrites
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some(response) = rx.recv().await {
            let json = match serde_json::to_string(&response) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize response: {e}");
                    continue;
                }
            };
            let written = async {
                writer.write_all(json.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            };
            if let Err(e) = written.await {
                tracing::error!("Failed to write response: {e}");
                break;
            }
        }
    });

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Failed to read client input: {e}");
                break;
            }
        }
        let line = match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Dropping non-UTF-8 input line: {e}");
                let _ = tx.send(JsonRpcResponse::failure(
                    serde_json::Value::Null,
                    PARSE_ERROR,
                    format!("Parse error: {e}"),
                ));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let server = Arc::clone(&server);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = server.handle_line(&line).await {
                let _ = tx.send(response);
            }
        });
    }
    tracing::info!("Client input closed");

    PendingWrites { writer }
}
