//! Cancellation watcher: the peer giving up shows as its request body ending early.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Resolves once the peer's inbound stream yields anything: a byte, end-of-stream or an error.
pub async fn client_closed<R>(conn: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut probe = [0u8; 1];
    let _ = conn.read(&mut probe).await;
}
