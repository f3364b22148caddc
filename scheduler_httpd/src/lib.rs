//! Optional HTTP dashboard. Out of scope for the scheduler's core decision
//! engine (spec.md names it only as an external collaborator reached by the
//! contract the core exposes), so this is deliberately thin: one read-only
//! `GET /status` endpoint reporting the same registry-size snapshot the
//! timer service already logs, served without pulling in a web framework
//! the rest of this workspace has no other use for.
use scheduler_core::net::EngineHandle;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Accepts connections on `addr` forever, answering every request (method
/// and path are ignored beyond logging) with the current engine snapshot as
/// JSON. Never touches the node/cluster registries directly — everything it
/// reports comes from `EngineHandle::snapshot`.
pub async fn serve(addr: SocketAddr, handle: EngineHandle) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http dashboard listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_request(stream, &handle).await {
                tracing::debug!(%peer, error = %e, "dashboard connection failed");
            }
        });
    }
}

async fn handle_request(mut stream: TcpStream, handle: &EngineHandle) -> std::io::Result<()> {
    // Requests are tiny (no body); a bounded read is enough to drain the
    // request line and headers before replying.
    let mut buf = vec![0u8; 8192];
    let _ = stream.read(&mut buf).await?;

    let snapshot = handle.snapshot().await;
    let body = serde_json::to_vec(&snapshot).unwrap_or_else(|_| b"{}".to_vec());
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}
