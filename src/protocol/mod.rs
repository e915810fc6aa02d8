pub mod envelope;
pub mod framing;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::protocol::envelope::Response;

/// Writes one response envelope as a newline-terminated JSON line. Best
/// effort: a failed write is logged by the caller, which then tears the
/// connection down at the next opportunity rather than here.
pub async fn write_response<W>(writer: &mut W, response: &Response) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response).expect("Response always serializes");
    line.push(b'\n');
    writer.write_all(&line).await
}

/// Generates a high-entropy opaque token (session tokens, client/report
/// secrets). Never embeds identity, matching the identity store's invariant.
pub fn random_token() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
