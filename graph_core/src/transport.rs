use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::mcp_server::JsonRpcHandler;

/// How long requests still running at EOF may take before they are aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stdio transport for the MCP server.
///
/// Every outbound message, responses and server notifications alike, goes
/// through one channel drained by a single writer, so lines never interleave.
/// Requests are handled concurrently; a call blocked on interactive sign-in
/// does not hold up `ping` or `tools/list`.
pub struct StdioTransport {
    handler: Arc<JsonRpcHandler>,
    outbound_tx: UnboundedSender<Value>,
    outbound_rx: UnboundedReceiver<Value>,
    shutdown_grace: Duration,
}

impl StdioTransport {
    pub fn new(handler: JsonRpcHandler) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self::with_channel(handler, outbound_tx, outbound_rx)
    }

    /// Uses a channel created up front so other components (the device prompt
    /// sink) can push notifications to the client.
    pub fn with_channel(
        handler: JsonRpcHandler,
        outbound_tx: UnboundedSender<Value>,
        outbound_rx: UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            outbound_tx,
            outbound_rx,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Run the stdio transport, reading from stdin and writing to stdout
    pub async fn run(self) -> io::Result<()> {
        self.run_with(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Runs over arbitrary streams until the input closes. Requests still in
    /// flight then get `shutdown_grace` to finish; a device sign-in waiting on
    /// a client that went away is aborted rather than kept alive.
    pub async fn run_with<R, W>(self, input: R, output: W) -> io::Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!("Starting stdio transport");
        let Self {
            handler,
            outbound_tx,
            outbound_rx,
            shutdown_grace,
        } = self;

        let writer = tokio::spawn(write_loop(output, outbound_rx));

        let mut reader = AsyncBufReader::new(input);
        let mut line = String::new();
        let mut in_flight = Vec::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("EOF reached on stdin");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let handler = handler.clone();
                    let tx = outbound_tx.clone();
                    let message = trimmed.to_string();
                    in_flight.push(tokio::spawn(async move {
                        process_line(&handler, &message, &tx).await;
                    }));
                    in_flight.retain(|h| !h.is_finished());
                }
                Err(e) => {
                    error!("Error reading from stdin: {}", e);
                    break;
                }
            }
        }

        let drain = async {
            for task in in_flight.iter_mut() {
                if let Err(e) = task.await {
                    error!("Request task failed: {}", e);
                }
            }
        };
        if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
            let pending = in_flight.iter().filter(|t| !t.is_finished()).count();
            warn!(pending, "Input closed, aborting unfinished requests");
            for task in &in_flight {
                task.abort();
            }
        }
        // Null never appears as a real message; it tells the writer to stop.
        let _ = outbound_tx.send(Value::Null);

        match writer.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

async fn process_line(handler: &JsonRpcHandler, line: &str, tx: &UnboundedSender<Value>) {
    debug!("Processing line: {}", line);

    let response = match serde_json::from_str::<Value>(line) {
        Ok(request) => handler.handle_request(request).await,
        Err(e) => {
            error!("Failed to parse JSON-RPC request: {}", e);
            Some(serde_json::json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": -32700,
                    "message": "Parse error",
                    "data": e.to_string()
                },
                "id": null
            }))
        }
    };

    if let Some(response) = response {
        if tx.send(response).is_err() {
            error!("Outbound channel closed, dropping response");
        }
    }
}

async fn write_loop<W>(mut output: W, mut rx: UnboundedReceiver<Value>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if message.is_null() {
            break;
        }
        let line = serde_json::to_string(&message)?;
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
        debug!("Sent message: {}", line);
    }
    Ok(())
}
