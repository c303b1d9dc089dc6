//! Public listener accept loop and the bidirectional splice between a user
//! TCP connection and a stream opened on the owning client's session.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, warn};

use tunnel_core::envelope::{ControlEnvelope, ForwardedProto};
use tunnel_core::identity::Identity;
use tunnel_core::keepalive;
use tunnel_core::transport::MuxSession;

/// Bound on the drain grace period after the response-body copy finishes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 8 * 1024;

/// Spawn the accept loop for one public listener, forwarding every accepted
/// user connection onto `session`. `shutdown` is the owning registry item's
/// cancellation signal: the task holds its own `Arc<TcpListener>` clone, so
/// an `accept()` error is not a reliable way to learn the client
/// disconnected (nothing else ever closes the fd out from under it) and the
/// loop must be told directly to stop.
pub fn spawn_accept_loop(
    listener: Arc<TcpListener>,
    owner: Identity,
    session: Arc<MuxSession>,
    shutdown: Arc<Notify>,
) {
    tokio::spawn(async move {
        let local_addr = match listener.local_addr() {
            Ok(a) => a.to_string(),
            Err(_) => return,
        };
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!(%owner, listener = %local_addr, "listener shut down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            keepalive::enable(&stream);
                            debug!(%owner, listener = %local_addr, peer = %peer, "accepted public connection");
                            let session = session.clone();
                            let local_addr = local_addr.clone();
                            tokio::spawn(async move {
                                if let Err(e) = splice(stream, &session, &local_addr).await {
                                    warn!(%owner, error = %e, "splice ended with error");
                                }
                            });
                        }
                        Err(e) if is_shutdown_error(&e) => {
                            debug!(%owner, listener = %local_addr, "listener closed");
                            break;
                        }
                        Err(e) => {
                            warn!(%owner, listener = %local_addr, error = %e, "accept failed, continuing");
                        }
                    }
                }
            }
        }
    });
}

fn is_shutdown_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotConnected | std::io::ErrorKind::Other
    ) && e.to_string().contains("closed")
}

async fn splice(
    user: tokio::net::TcpStream,
    session: &MuxSession,
    local_addr: &str,
) -> tunnel_core::error::TunnelResult<()> {
    let envelope = ControlEnvelope::proxy(ForwardedProto::Tcp, local_addr.to_string());
    let (mut send_stream, mut recv_stream) = session.open_proxy_stream(&envelope).await?;

    let (mut user_read, mut user_write) = user.into_split();

    let upload = tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match user_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            send_stream.reserve_capacity(n);
            match futures_capacity(&mut send_stream).await {
                Ok(()) => {}
                Err(_) => break,
            }
            if send_stream
                .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                .is_err()
            {
                break;
            }
        }
        let _ = send_stream.send_data(Bytes::new(), true);
    });

    loop {
        match recv_stream.data().await {
            Some(Ok(chunk)) => {
                let _ = recv_stream.flow_control().release_capacity(chunk.len());
                if user_write.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                if !is_teardown_noise(&e) {
                    warn!(error = %e, "stream read error during splice");
                }
                break;
            }
            None => break,
        }
    }

    let _ = tokio::time::timeout(DRAIN_TIMEOUT, upload).await;
    Ok(())
}

/// Wait for the stream to have at least some send capacity available.
async fn futures_capacity(stream: &mut h2::SendStream<Bytes>) -> Result<(), h2::Error> {
    match std::future::poll_fn(|cx| stream.poll_capacity(cx)).await {
        Some(Ok(_)) => Ok(()),
        Some(Err(e)) => Err(e),
        None => Ok(()),
    }
}

fn is_teardown_noise(e: &h2::Error) -> bool {
    let msg = e.to_string();
    msg.contains("CANCEL") || msg.contains("context canceled")
}
