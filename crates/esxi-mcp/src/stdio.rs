//! Newline-delimited JSON-RPC over stdin/stdout.
//!
//! Each request is served on its own task so a long `wait_for_updates`
//! never blocks a later `notifications/cancelled`. A single writer task
//! owns the output stream.

use crate::protocol::RpcResponse;
use crate::server::McpServer;

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub async fn serve_stdio(server: Arc<McpServer>) -> io::Result<()> {
    log::info!("Serving MCP over stdio");
    serve(server, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Serve until `reader` reaches end of input and every response is written.
pub async fn serve<R, W>(server: Arc<McpServer>, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = Arc::new(server.gate().session());
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_string(&response)?;
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<(), io::Error>(())
    });

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let (server, session, tx) = (server.clone(), session.clone(), tx.clone());
        tokio::spawn(async move {
            if let Some(response) = server.handle_message(&line, &session).await {
                if tx.send(response).is_err() {
                    log::warn!("Output closed; dropping response");
                }
            }
        });
    }
    log::info!("Input closed; finishing outstanding requests");
    drop(tx);
    writer_task.await.map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyGate;
    use esxi_vsphere::testing::FakeHypervisor;
    use esxi_vsphere::types::CoordinationConfig;
    use esxi_vsphere::{InfraService, PlacementDefaults};
    use serde_json::{json, Value};
    use tokio::io::AsyncReadExt;

    async fn server() -> Arc<McpServer> {
        let fake = Arc::new(FakeHypervisor::standalone_host());
        let service = InfraService::connect(fake, CoordinationConfig::default(), &PlacementDefaults::default())
            .await
            .unwrap();
        Arc::new(McpServer::new(Arc::new(service), ApiKeyGate::new(None)))
    }

    #[tokio::test]
    async fn answers_every_request_line() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            "\n",
            "{oops\n",
        );
        let (out, mut client) = tokio::io::duplex(64 * 1024);

        serve(server().await, input.as_bytes(), out).await.unwrap();

        let mut written = String::new();
        client.read_to_string(&mut written).await.unwrap();
        let mut responses: Vec<Value> = written.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        responses.sort_by_key(|r| r["id"].as_i64().unwrap_or(-1));

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[1]["result"]["serverInfo"]["name"], "VMware-MCP-Server");
        assert_eq!(responses[2]["result"], json!({}));
    }
}
