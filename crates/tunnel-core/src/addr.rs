//! Address normalization for tunnel bind addresses and local targets.
//!
//! Mirrors the handful of shorthand forms the reference implementation
//! accepts: a bare port number, a `:port` form, and full `host:port`.
//! Error messages always contain the substring `"missing port"` when no
//! port can be determined, matching the diagnostic text callers match
//! against.

use crate::error::{TunnelError, TunnelResult};

/// Normalize `addr` into a `host:port` string.
///
/// - A bare integer (`"22"`) becomes `":22"`, then expands to `"127.0.0.1:22"`.
/// - An empty host (`":22"`) becomes `"127.0.0.1:22"`.
/// - `"host:port"` (including bracketed IPv6 literals) passes through unchanged
///   once validated.
/// - Anything without a discoverable port is rejected with an error whose
///   message contains `"missing port"`.
pub fn normalize_addr(addr: &str) -> TunnelResult<String> {
    if !addr.is_empty() && addr.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(format!("127.0.0.1:{addr}"));
    }

    let (host, port) = split_host_port(addr)?;
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    if host.contains(':') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

/// Extract just the host portion of an address, discarding the port the way
/// the reference implementation's registry keys its duplicate-bind index
/// (`trimPort`). Used to match a configured tunnel address (which may name
/// an ephemeral port, `:0`) against the resolved `host:port` the server
/// reports once it has actually bound a listener — the host is stable
/// across that substitution, the port isn't.
pub fn host_only(addr: &str) -> TunnelResult<String> {
    let normalized = normalize_addr(addr)?;
    let (host, _) = split_host_port(&normalized)?;
    Ok(host.to_string())
}

fn split_host_port(addr: &str) -> TunnelResult<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        // Bracketed IPv6 literal: "[::1]:22"
        let close = rest.find(']').ok_or_else(|| {
            TunnelError::BadAddress(addr.to_string(), "missing closing bracket".to_string())
        })?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let port = after.strip_prefix(':').ok_or_else(|| {
            TunnelError::BadAddress(addr.to_string(), "missing port in address".to_string())
        })?;
        if port.is_empty() {
            return Err(TunnelError::BadAddress(
                addr.to_string(),
                "missing port in address".to_string(),
            ));
        }
        return Ok((host, port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() => Ok((host, port)),
        _ => Err(TunnelError::BadAddress(
            addr.to_string(),
            "missing port in address".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_expands_to_loopback() {
        assert_eq!(normalize_addr("22").unwrap(), "127.0.0.1:22");
    }

    #[test]
    fn colon_port_expands_to_loopback() {
        assert_eq!(normalize_addr(":22").unwrap(), "127.0.0.1:22");
    }

    #[test]
    fn host_port_passes_through() {
        assert_eq!(normalize_addr("0.0.0.0:22").unwrap(), "0.0.0.0:22");
    }

    #[test]
    fn bare_host_is_rejected() {
        let err = normalize_addr("0.0.0.0").unwrap_err().to_string();
        assert!(err.contains("missing port"), "error was: {err}");
    }

    #[test]
    fn empty_string_is_rejected() {
        let err = normalize_addr("").unwrap_err().to_string();
        assert!(err.contains("missing port"), "error was: {err}");
    }

    #[test]
    fn bracketed_ipv6_passes_through() {
        assert_eq!(normalize_addr("[::1]:22").unwrap(), "[::1]:22");
    }

    #[test]
    fn host_only_strips_the_port() {
        assert_eq!(host_only("0.0.0.0:0").unwrap(), "0.0.0.0");
        assert_eq!(host_only("0.0.0.0:58213").unwrap(), "0.0.0.0");
    }

    #[test]
    fn host_only_expands_shorthand_before_stripping() {
        assert_eq!(host_only("22").unwrap(), "127.0.0.1");
        assert_eq!(host_only(":0").unwrap(), "127.0.0.1");
    }
}
