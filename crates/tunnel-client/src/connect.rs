//! The client's outer connect loop: dial the server, run the session, and
//! reconnect under exponential backoff when it ends.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use tunnel_core::error::{TunnelError, TunnelResult};
use tunnel_core::keepalive;
use tunnel_core::transport::{BoxedIo, MuxListener};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::dispatch;

/// Run the connect loop until `shutdown` is notified or the backoff policy
/// exhausts its max elapsed time.
pub async fn run(
    config: Arc<ClientConfig>,
    tls_config: Arc<rustls::ClientConfig>,
    shutdown: Arc<Notify>,
) -> TunnelResult<()> {
    let mut backoff = Backoff::new(config.backoff.clone());
    let local_targets = Arc::new(config.local_targets());
    let handshake_body = Arc::new(build_handshake_body(&config));

    loop {
        let attempt = connect_once(
            &config,
            tls_config.clone(),
            handshake_body.clone(),
            local_targets.clone(),
        );

        tokio::select! {
            _ = shutdown.notified() => return Ok(()),
            result = attempt => {
                match result {
                    Ok(()) => {
                        info!("session ended cleanly, reconnecting");
                        backoff.reset();
                    }
                    Err(e) => warn!(error = %e, "session attempt failed"),
                }
            }
        }

        match backoff.next_interval() {
            Some(interval) => {
                tokio::select! {
                    _ = shutdown.notified() => return Ok(()),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            None => {
                return Err(TunnelError::Timeout(
                    "reconnect backoff exceeded max elapsed time",
                ))
            }
        }
    }
}

async fn connect_once(
    config: &ClientConfig,
    tls_config: Arc<rustls::ClientConfig>,
    handshake_body: Arc<tunnel_core::envelope::HandshakeBody>,
    local_targets: Arc<std::collections::HashMap<String, std::net::SocketAddr>>,
) -> TunnelResult<()> {
    let tcp = TcpStream::connect(&config.server_addr).await?;
    keepalive::enable(&tcp);

    let server_name = rustls::pki_types::ServerName::try_from(config.server_name.clone())
        .map_err(|e| TunnelError::Configuration(format!("invalid server_name: {e}")))?;

    let connector = TlsConnector::from(tls_config);
    let tls = connector.connect(server_name, tcp).await?;
    info!(server = %config.server_addr, "TLS session established");

    let boxed: BoxedIo = Box::pin(tls);
    let mut listener = MuxListener::establish(boxed).await?;

    while let Some(incoming) = listener.accept().await {
        match incoming {
            Ok(stream) => {
                let handshake_body = handshake_body.clone();
                let local_targets = local_targets.clone();
                tokio::spawn(async move {
                    dispatch::dispatch(stream, &handshake_body, local_targets).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "error accepting stream from server");
                break;
            }
        }
    }

    Ok(())
}

fn build_handshake_body(config: &ClientConfig) -> tunnel_core::envelope::HandshakeBody {
    let mut map = std::collections::BTreeMap::new();
    for tunnel in &config.tunnels {
        map.insert(tunnel.name.clone(), tunnel.descriptor.clone());
    }
    tunnel_core::envelope::HandshakeBody(map)
}
