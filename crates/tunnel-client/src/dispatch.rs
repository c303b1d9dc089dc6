//! Per-stream dispatch on the client side: answer the server's handshake
//! request with the configured tunnel map, and splice proxy streams to the
//! matching local target.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use tunnel_core::envelope::HandshakeBody;
use tunnel_core::error::TunnelResult;
use tunnel_core::transport::IncomingStream;

const CHUNK_SIZE: usize = 8 * 1024;

/// Answer the server's `CONNECT` handshake request with the client's JSON
/// tunnel map.
pub async fn respond_to_handshake(
    mut responder: h2::server::SendResponse<Bytes>,
    body: &HandshakeBody,
) -> TunnelResult<()> {
    let encoded = body.encode()?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .body(())
        .expect("static response has no invalid parts");
    let mut send_stream = responder.send_response(response, false)?;
    send_stream.send_data(Bytes::from(encoded), true)?;
    Ok(())
}

/// Handle one proxied stream: dial the local target named by the envelope's
/// `forwarded_host`, answer with a response, and splice bytes both ways.
pub async fn handle_proxy_stream(
    envelope: tunnel_core::envelope::ControlEnvelope,
    mut body: h2::RecvStream,
    mut responder: h2::server::SendResponse<Bytes>,
    local_targets: Arc<HashMap<String, SocketAddr>>,
) {
    let target = match tunnel_core::addr::host_only(&envelope.forwarded_host)
        .ok()
        .and_then(|host| local_targets.get(&host))
    {
        Some(addr) => *addr,
        None => {
            reject(responder, StatusCode::BAD_REQUEST);
            return;
        }
    };

    let local = match TcpStream::connect(target).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%target, error = %e, "failed to dial local target");
            reject(responder, StatusCode::BAD_GATEWAY);
            return;
        }
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .body(())
        .expect("static response has no invalid parts");
    let mut send_stream = match responder.send_response(response, false) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to send proxy response headers");
            return;
        }
    };

    let (mut local_read, mut local_write) = local.into_split();

    let upload = tokio::spawn(async move {
        loop {
            match body.data().await {
                Some(Ok(chunk)) => {
                    let _ = body.flow_control().release_capacity(chunk.len());
                    if local_write.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    if !is_teardown_noise(&e) {
                        warn!(error = %e, "error reading proxy request body");
                    }
                    break;
                }
                None => break,
            }
        }
    });

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match local_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        send_stream.reserve_capacity(n);
        if wait_for_capacity(&mut send_stream).await.is_err() {
            break;
        }
        if send_stream
            .send_data(Bytes::copy_from_slice(&buf[..n]), false)
            .is_err()
        {
            break;
        }
    }
    let _ = send_stream.send_data(Bytes::new(), true);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(30), upload).await;
    debug!("proxy stream finished");
}

fn reject(mut responder: h2::server::SendResponse<Bytes>, status: StatusCode) {
    let response = Response::builder()
        .status(status)
        .body(())
        .expect("static response has no invalid parts");
    let _ = responder.send_response(response, true);
}

async fn wait_for_capacity(stream: &mut h2::SendStream<Bytes>) -> Result<(), h2::Error> {
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

/// Dispatch one stream accepted from the session: reply to the handshake or
/// hand a proxy stream off to [`handle_proxy_stream`].
pub async fn dispatch(
    incoming: IncomingStream,
    handshake_body: &HandshakeBody,
    local_targets: Arc<HashMap<String, SocketAddr>>,
) {
    match incoming {
        IncomingStream::Handshake { responder } => {
            if let Err(e) = respond_to_handshake(responder, handshake_body).await {
                warn!(error = %e, "failed to answer handshake request");
            }
        }
        IncomingStream::Proxy {
            envelope,
            body,
            responder,
        } => {
            if envelope.error.is_some() {
                debug!(message = ?envelope.error, "server sent an error notification");
                reject(responder, StatusCode::OK);
                return;
            }
            handle_proxy_stream(envelope, body, responder, local_targets).await;
        }
    }
}
