//! TCP keepalive tuning for accepted and dialed connections.
//!
//! The reference implementation only exposes a single "period" knob to the
//! OS; `socket2` lets us set idle time, probe interval, and probe count
//! independently, so we do, while keeping the same default values.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Idle time before the first keepalive probe is sent.
pub const DEFAULT_IDLE_TIME: Duration = Duration::from_secs(15 * 60);
/// Interval between subsequent probes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
/// Number of unacknowledged probes before the connection is considered dead.
pub const DEFAULT_COUNT: u32 = 8;

/// Enable TCP keepalive on `stream` using the reference defaults. Platforms
/// that cannot configure one or more of the settings silently ignore that
/// setting rather than failing the caller.
pub fn enable(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let keepalive = build_keepalive();
    let _ = sock.set_tcp_keepalive(&keepalive);
}

fn build_keepalive() -> TcpKeepalive {
    let ka = TcpKeepalive::new()
        .with_time(DEFAULT_IDLE_TIME)
        .with_interval(DEFAULT_INTERVAL);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    let ka = ka.with_retries(DEFAULT_COUNT);
    ka
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enable_does_not_panic_on_a_real_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accept_res, connect_res) =
            tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (accepted, _) = accept_res.unwrap();
        let connected = connect_res.unwrap();
        enable(&accepted);
        enable(&connected);
    }
}
