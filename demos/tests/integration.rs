//! End-to-end scenarios driving real `tunnel-server` and `tunnel-client`
//! instances over loopback TCP with mutual TLS, no mocked transport.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use tunnel_client::config::NamedTunnel;
use tunnel_client::dispatch;
use tunnel_core::envelope::{ForwardedProto, HandshakeBody, TunnelDescriptor};
use tunnel_core::identity::Identity;
use tunnel_core::tls::{client_tls_config, parse_certs, parse_private_key, root_store, server_tls_config};
use tunnel_core::transport::{BoxedIo, MuxListener};
use tunnel_server::{ServerConfig, TunnelServer};

struct CertPair {
    cert_pem: String,
    key_pem: String,
}

fn generate_cert(san: &str) -> CertPair {
    let cert = rcgen::generate_simple_self_signed(vec![san.to_string()])
        .expect("self-signed cert generation");
    CertPair {
        cert_pem: cert.cert.pem(),
        key_pem: cert.key_pair.serialize_pem(),
    }
}

fn identity_of(cert: &CertPair) -> Identity {
    let der = parse_certs(cert.cert_pem.as_bytes()).unwrap().remove(0);
    Identity::from_certificate_der(der.as_ref())
}

/// Start a `TunnelServer` bound to an OS-assigned loopback port, trusting
/// `client_cert` as its own client CA.
async fn start_server(auto_subscribe: bool) -> (Arc<TunnelServer>, SocketAddr, CertPair, CertPair) {
    let server_cert = generate_cert("localhost");
    let client_cert = generate_cert("test-client");

    let server_chain = parse_certs(server_cert.cert_pem.as_bytes()).unwrap();
    let server_key = parse_private_key(server_cert.key_pem.as_bytes()).unwrap();
    let client_roots = root_store(client_cert.cert_pem.as_bytes()).unwrap();
    let tls_config = server_tls_config(server_chain, server_key, client_roots).unwrap();

    let config = ServerConfig {
        auto_subscribe,
        ..ServerConfig::default()
    };
    let server = Arc::new(TunnelServer::new(config, Arc::new(tls_config)));

    let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp_listener.local_addr().unwrap();
    let server_for_task = server.clone();
    tokio::spawn(async move {
        let _ = server_for_task.serve(tcp_listener).await;
    });

    (server, addr, server_cert, client_cert)
}

/// Dial the server as a tunnel client, announce `tunnels`, and run the
/// client-side dispatch loop in the background until the session ends.
async fn dial_client(
    server_addr: SocketAddr,
    server_cert: &CertPair,
    client_cert: &CertPair,
    tunnels: Vec<NamedTunnel>,
) -> JoinHandle<()> {
    let client_chain = parse_certs(client_cert.cert_pem.as_bytes()).unwrap();
    let client_key = parse_private_key(client_cert.key_pem.as_bytes()).unwrap();
    let server_roots = root_store(server_cert.cert_pem.as_bytes()).unwrap();
    let tls_config = Arc::new(client_tls_config(client_chain, client_key, server_roots).unwrap());

    let tcp = TcpStream::connect(server_addr).await.unwrap();
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from("localhost".to_string()).unwrap();
    let tls = connector.connect(server_name, tcp).await.unwrap();
    let boxed: BoxedIo = Box::pin(tls);
    let mut listener = MuxListener::establish(boxed).await.unwrap();

    let mut map = BTreeMap::new();
    for t in &tunnels {
        map.insert(t.name.clone(), t.descriptor.clone());
    }
    let handshake_body = Arc::new(HandshakeBody(map));
    let local_targets: Arc<HashMap<String, SocketAddr>> = Arc::new(
        tunnels
            .iter()
            .map(|t| (t.descriptor.bind_addr.clone(), t.local_target))
            .collect(),
    );

    tokio::spawn(async move {
        while let Some(incoming) = listener.accept().await {
            match incoming {
                Ok(stream) => {
                    let handshake_body = handshake_body.clone();
                    let local_targets = local_targets.clone();
                    tokio::spawn(async move {
                        dispatch::dispatch(stream, &handshake_body, local_targets).await;
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// A trivial TCP echo service, bound to an OS-assigned loopback port.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn named_tunnel(name: &str, bind_addr: SocketAddr, local_target: SocketAddr) -> NamedTunnel {
    NamedTunnel {
        name: name.to_string(),
        descriptor: TunnelDescriptor {
            protocol: ForwardedProto::Tcp,
            bind_addr: bind_addr.to_string(),
        },
        local_target,
    }
}

/// Poll the server until it reports a resolved public address for `id`,
/// the way a caller that requested an ephemeral port (`:0`) learns what the
/// OS actually assigned.
async fn wait_for_public_addr(server: &TunnelServer, id: Identity) -> SocketAddr {
    for _ in 0..50 {
        if let Some(addr) = server.public_addrs(id).await.into_iter().next() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server never bound a public listener for the subscribed client");
}

#[tokio::test]
async fn happy_path_round_trips_bytes_through_the_tunnel() {
    let (server, server_addr, server_cert, client_cert) = start_server(false).await;
    let client_id = identity_of(&client_cert);
    server.subscribe(client_id).await;

    let echo_addr = start_echo_server().await;
    let ephemeral: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let tunnels = vec![named_tunnel("echo", ephemeral, echo_addr)];
    let _client_task = dial_client(server_addr, &server_cert, &client_cert, tunnels).await;

    let public_addr = wait_for_public_addr(&server, client_id).await;

    let mut user = TcpStream::connect(public_addr)
        .await
        .expect("public listener should be open after the handshake");
    let payload = b"hello tunnel";
    user.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    user.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, payload);

    server.stop();
}

#[tokio::test]
async fn duplicate_bind_rejects_the_second_client_but_keeps_the_first() {
    let (server, server_addr, server_cert, client_a_cert) = start_server(false).await;
    let client_b_cert = generate_cert("test-client-b");
    server.subscribe(identity_of(&client_a_cert)).await;
    server.subscribe(identity_of(&client_b_cert)).await;

    let echo_addr = start_echo_server().await;
    let public_addr: SocketAddr = "127.0.0.1:48302".parse().unwrap();

    let tunnels_a = vec![named_tunnel("echo", public_addr, echo_addr)];
    let _client_a = dial_client(server_addr, &server_cert, &client_a_cert, tunnels_a).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let tunnels_b = vec![named_tunnel("echo", public_addr, echo_addr)];
    let client_b = dial_client(server_addr, &server_cert, &client_b_cert, tunnels_b).await;

    // Client B's dispatch loop ends once the server tears down its
    // rejected session.
    tokio::time::timeout(Duration::from_secs(2), client_b)
        .await
        .expect("client B's session should be rejected promptly")
        .unwrap();

    let mut user = TcpStream::connect(public_addr)
        .await
        .expect("client A's listener should remain open");
    let payload = b"still working";
    user.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    user.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, payload);

    server.stop();
}

#[tokio::test]
async fn peer_drop_closes_its_listener_and_frees_the_address() {
    let (server, server_addr, server_cert, client_cert) = start_server(false).await;
    server.subscribe(identity_of(&client_cert)).await;

    let echo_addr = start_echo_server().await;
    let public_addr: SocketAddr = "127.0.0.1:48303".parse().unwrap();
    let tunnels = vec![named_tunnel("echo", public_addr, echo_addr)];
    let client_task = dial_client(server_addr, &server_cert, &client_cert, tunnels).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    TcpStream::connect(public_addr)
        .await
        .expect("listener should be open before the client is dropped");

    client_task.abort();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        TcpStream::connect(public_addr).await.is_err(),
        "listener should be closed once the owning client disconnects"
    );

    server.stop();
}

#[tokio::test]
async fn unknown_client_is_disconnected_without_being_subscribed() {
    let (_server, server_addr, server_cert, client_cert) = start_server(false).await;
    // Deliberately not calling `server.subscribe` for this identity.

    let client_chain = parse_certs(client_cert.cert_pem.as_bytes()).unwrap();
    let client_key = parse_private_key(client_cert.key_pem.as_bytes()).unwrap();
    let server_roots = root_store(server_cert.cert_pem.as_bytes()).unwrap();
    let tls_config = Arc::new(client_tls_config(client_chain, client_key, server_roots).unwrap());

    let tcp = TcpStream::connect(server_addr).await.unwrap();
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from("localhost".to_string()).unwrap();
    let tls = connector
        .connect(server_name, tcp)
        .await
        .expect("TLS handshake itself succeeds regardless of subscription");
    let boxed: BoxedIo = Box::pin(tls);

    let result = tokio::time::timeout(Duration::from_secs(2), MuxListener::establish(boxed)).await;
    assert!(
        matches!(result, Ok(Err(_)) | Err(_)),
        "an unsubscribed client's session should never complete its mux handshake"
    );
}
