use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpListener;

use crate::dispatch::{dispatch, Platform};
use crate::protocol::envelope::{Request, Response};
use crate::protocol::framing::{FrameOutcome, FrameReader};
use crate::protocol::write_response;

/// Runs the control-plane accept loop: one task per connection, each reading
/// framed request lines and writing framed response lines until the peer
/// disconnects, times out, or is rate-limit-closed.
pub async fn run_control_plane(bind_addr: &str, platform: Arc<Platform>) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("control plane listening on {}", listener.local_addr()?);
    serve(listener, platform).await
}

/// Accepts connections off an already-bound listener. Split out from
/// `run_control_plane` so tests can bind an ephemeral port, read back its
/// address, then start serving.
pub async fn serve(listener: TcpListener, platform: Arc<Platform>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let platform = platform.clone();
        tokio::spawn(async move {
            log::debug!("accepted connection from {peer}");
            if let Err(err) = handle_connection(stream, platform).await {
                log::debug!("connection {peer} closed: {err}");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, platform: Arc<Platform>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(read_half));

    loop {
        match frames.next_frame().await {
            FrameOutcome::Frame(bytes) => {
                let response = match serde_json::from_slice::<Request>(&bytes) {
                    Ok(request) => dispatch(&platform, request).await,
                    Err(e) => malformed_request_response(&e),
                };
                write_response(&mut write_half, &response).await?;
            }
            FrameOutcome::Dropped => continue,
            FrameOutcome::Eof | FrameOutcome::TimedOut => return Ok(()),
        }
    }
}

fn malformed_request_response(err: &serde_json::Error) -> Response {
    use crate::error::PlatformError;
    Response::error("UNKNOWN", None, &PlatformError::Validation(format!("malformed request: {err}")))
}
