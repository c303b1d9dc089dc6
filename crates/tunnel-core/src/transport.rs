//! The multiplexed stream transport shared by server and client: a thin
//! wrapper over `h2`, used with an asymmetric role split that mirrors the
//! reference implementation's use of an `http2.Transport` as a custom
//! connection pool on the server side.
//!
//! The server accepts a TCP connection from the client and then runs the
//! `h2` *client* role over it (`MuxSession`), so it can open new streams
//! back toward the tunnel client whenever a public TCP connection arrives.
//! The client dials out to the server and then runs the `h2` *server* role
//! over that connection (`MuxListener`), accepting the streams the server
//! opens.

use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::envelope::{ControlEnvelope, HandshakeBody};
use crate::error::{TunnelError, TunnelResult};

/// A connection type usable as the transport's underlying socket: a TLS
/// stream in practice, boxed so `MuxSession`/`MuxListener` don't need to be
/// generic over the concrete TLS stream type.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

pub type BoxedIo = Pin<Box<dyn IoStream>>;

/// The server-role endpoint of a session: wraps the `h2` client handle used
/// to open new streams back toward a connected tunnel client.
pub struct MuxSession {
    send_request: h2::client::SendRequest<Bytes>,
    ping_pong: Mutex<h2::PingPong>,
}

impl MuxSession {
    /// Run the `h2` client handshake over an already-accepted connection and
    /// spawn its background driver task. The driver task's completion (the
    /// `Connection` future resolving) is the transport's disconnect signal.
    pub async fn establish(io: BoxedIo) -> TunnelResult<(Self, JoinHandle<()>)> {
        let (send_request, mut connection) = h2::client::handshake(io).await?;
        let ping_pong = connection
            .ping_pong()
            .expect("ping_pong must be taken before the connection is first polled");
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "mux connection driver exited");
            }
        });
        Ok((
            MuxSession {
                send_request,
                ping_pong: Mutex::new(ping_pong),
            },
            driver,
        ))
    }

    /// Send the handshake request (`CONNECT`) and decode the client's JSON
    /// tunnel map from the response body.
    pub async fn open_handshake(&self, max_body: usize) -> TunnelResult<HandshakeBody> {
        let mut send_request = self.send_request.clone();
        send_request.ready().await?;

        let request = http::Request::builder()
            .method(http::Method::CONNECT)
            .uri("tunnel://handshake")
            .body(())
            .map_err(|e| TunnelError::Other(e.to_string()))?;

        let (response_fut, _send_stream) = send_request.send_request(request, true)?;
        let response = response_fut.await?;
        let mut body = response.into_body();
        let bytes = read_body_capped(&mut body, max_body).await?;
        HandshakeBody::decode(&bytes)
    }

    /// Open a new proxy stream carrying `envelope` in its request headers.
    /// Returns the request body sender (bytes flowing user→client) and the
    /// response body receiver (bytes flowing client→user), once the peer
    /// has answered with response headers.
    pub async fn open_proxy_stream(
        &self,
        envelope: &ControlEnvelope,
    ) -> TunnelResult<(h2::SendStream<Bytes>, h2::RecvStream)> {
        let mut send_request = self.send_request.clone();
        send_request.ready().await?;

        let mut builder = http::Request::builder().method(http::Method::PUT).uri("tunnel://proxy");
        {
            let headers = builder
                .headers_mut()
                .expect("request builder has no prior error");
            envelope.apply_to_headers(headers)?;
        }
        let request = builder
            .body(())
            .map_err(|e| TunnelError::Other(e.to_string()))?;

        let (response_fut, send_stream) = send_request.send_request(request, false)?;
        let response = response_fut.await?;
        Ok((send_stream, response.into_body()))
    }

    /// Send a session-level ping and return the measured round-trip time.
    pub async fn ping(&self) -> TunnelResult<Duration> {
        let mut ping_pong = self.ping_pong.lock().await;
        let start = Instant::now();
        ping_pong.ping([0u8; 8]).await?;
        Ok(start.elapsed())
    }
}

/// A stream accepted by the client-role (`h2` server) side of the session.
pub enum IncomingStream {
    /// The server's handshake request; reply with the tunnel map.
    Handshake {
        responder: h2::server::SendResponse<Bytes>,
    },
    /// A proxied user connection.
    Proxy {
        envelope: ControlEnvelope,
        body: h2::RecvStream,
        responder: h2::server::SendResponse<Bytes>,
    },
}

/// The client-role endpoint of a session: accepts streams the server opens.
pub struct MuxListener {
    connection: h2::server::Connection<BoxedIo, Bytes>,
}

impl MuxListener {
    /// Run the `h2` server handshake over the connection dialed out to the
    /// tunnel server.
    pub async fn establish(io: BoxedIo) -> TunnelResult<Self> {
        let connection = h2::server::handshake(io).await?;
        Ok(MuxListener { connection })
    }

    /// Accept the next stream, classifying it by its request method. Returns
    /// `None` once the peer has closed the session.
    pub async fn accept(&mut self) -> Option<TunnelResult<IncomingStream>> {
        let accepted = self.connection.accept().await?;
        Some(match accepted {
            Ok((request, responder)) => classify(request, responder),
            Err(e) => Err(e.into()),
        })
    }
}

fn classify(
    request: http::Request<h2::RecvStream>,
    responder: h2::server::SendResponse<Bytes>,
) -> TunnelResult<IncomingStream> {
    if request.method() == http::Method::CONNECT {
        Ok(IncomingStream::Handshake { responder })
    } else {
        let envelope = ControlEnvelope::from_headers(request.headers())?;
        let body = request.into_body();
        Ok(IncomingStream::Proxy {
            envelope,
            body,
            responder,
        })
    }
}

/// Drain a `RecvStream` fully, releasing flow-control credit as data
/// arrives, rejecting bodies larger than `max`.
pub async fn read_body_capped(body: &mut h2::RecvStream, max: usize) -> TunnelResult<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(chunk.len());
        if buf.len() > max {
            return Err(TunnelError::HandshakeRejected(format!(
                "body exceeded {max} bytes"
            )));
        }
    }
    Ok(buf)
}
