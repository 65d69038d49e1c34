use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::context::ToolContext;
use crate::mcp_server::JsonRpcHandler;
use crate::utils::truncate_chars;

/// Stdio transport for the MCP server. Each request runs on its own task; a single
/// writer task owns stdout so responses never interleave.
pub struct StdioTransport {
    handler: Arc<JsonRpcHandler>,
    session_id: String,
}

impl StdioTransport {
    pub fn new(handler: Arc<JsonRpcHandler>) -> Self {
        Self {
            handler,
            session_id: format!("stdio-{}", Uuid::new_v4()),
        }
    }

    /// External session id shared by every request on this process.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run the stdio transport, reading from stdin and writing to stdout
    pub async fn run(&self) -> io::Result<()> {
        info!(session_id = %self.session_id, "Starting stdio transport");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serves newline-delimited JSON-RPC from `input` until EOF, then waits for
    /// in-flight requests to finish writing.
    pub async fn serve<R, W>(&self, input: R, output: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Value>();
        let writer = tokio::spawn(write_responses(rx, output));

        let ctx = ToolContext::for_session(self.session_id.clone());
        let mut reader = BufReader::new(input);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("EOF reached on stdin");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error reading from stdin: {}", e);
                    break;
                }
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed) {
                Ok(request) => {
                    let handler = Arc::clone(&self.handler);
                    let ctx = ctx.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(response) = handler.handle_request(request, &ctx).await {
                            if tx.send(response).is_err() {
                                debug!("Response dropped; writer has stopped");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(
                        "Failed to parse JSON-RPC request: {} ({})",
                        e,
                        truncate_chars(trimmed, 200)
                    );
                    let parse_error = json!({
                        "jsonrpc": "2.0",
                        "error": {
                            "code": -32700,
                            "message": "Parse error",
                            "data": e.to_string()
                        },
                        "id": null
                    });
                    if tx.send(parse_error).is_err() {
                        break;
                    }
                }
            }
        }

        drop(tx);
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

async fn write_responses<W>(mut rx: mpsc::UnboundedReceiver<Value>, mut output: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let response_str = serde_json::to_string(&response)?;
        output.write_all(response_str.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
        debug!("Sent response: {}", truncate_chars(&response_str, 500));
    }
    Ok(())
}
