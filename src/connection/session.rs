//! Session role: drives one established connection
//!
//! Reads are decoded and reported as messages, queued writes go out in
//! order. The socket is split so a write stalled on a peer that stopped
//! reading never holds up reads or cancellation. The session ends when the
//! peer closes, a read fails, or the manager cancels it.

use crate::transport::TransportStream;
use bytes::Bytes;
use spp_link_shared::codec::ChunkDecoder;
use spp_link_shared::PeerAddress;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Run the read/write loop until the connection ends.
///
/// Returns the reason the session ended, or `None` when it was cancelled.
pub(crate) async fn run_session<S, F>(
    stream: S,
    peer: &PeerAddress,
    read_buffer_size: usize,
    mut outbound: mpsc::Receiver<Bytes>,
    mut cancel: oneshot::Receiver<()>,
    mut on_message: F,
) -> Option<String>
where
    S: TransportStream,
    F: FnMut(String),
{
    let mut buf = vec![0u8; read_buffer_size.max(1)];
    let mut decoder = ChunkDecoder::new();
    let (mut reader, mut writer) = tokio::io::split(stream);
    info!("[SESSION] Started with {}", peer);

    let ended = {
        let writes = drain_outbound(&mut writer, &mut outbound, peer);
        tokio::pin!(writes);

        loop {
            tokio::select! {
                _ = &mut cancel => {
                    debug!("[SESSION] Closing connection to {}", peer);
                    break None;
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Some("connection closed by peer".to_string()),
                    Ok(n) => {
                        trace!("[SESSION] {} bytes from {}", n, peer);
                        if let Some(text) = decoder.decode(&buf[..n]) {
                            on_message(text);
                        }
                    }
                    Err(e) => break Some(format!("read failed: {}", e)),
                },
                _ = &mut writes => {}
            }
        }
    };

    if ended.is_some() {
        if let Some(text) = decoder.finish() {
            on_message(text);
        }
    }

    let mut stream = reader.unsplit(writer);
    if let Err(e) = TransportStream::shutdown(&mut stream).await {
        debug!("[SESSION] Shutdown of {} failed: {}", peer, e);
    }
    if let Some(reason) = &ended {
        info!("[SESSION] Ended with {}: {}", peer, reason);
    }
    ended
}

/// Write queued payloads in order. Never completes: once the queue closes
/// the session keeps reading until it ends some other way.
async fn drain_outbound<S: TransportStream>(
    writer: &mut WriteHalf<S>,
    outbound: &mut mpsc::Receiver<Bytes>,
    peer: &PeerAddress,
) {
    while let Some(payload) = outbound.recv().await {
        // A failed write is not terminal; the read side notices a dead link
        if let Err(e) = write_payload(writer, &payload).await {
            warn!("[SESSION] Write of {} bytes to {} failed: {}", payload.len(), peer, e);
        }
    }
    std::future::pending::<()>().await
}

async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.flush().await
}
