//! Endpoint parsing helpers shared by the session and the forwarding rules.

use crate::error::{TunnelError, TunnelResult};

/// Port used when the SSH host carries none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Append the default SSH port when `host` has none.
///
/// * `example.com` becomes `example.com:22`
/// * `[fe80::1]` becomes `[fe80::1]:22`
/// * a bare IPv6 literal such as `::1` is bracketed first
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with('[') {
        if host.contains("]:") {
            return host.to_string();
        }
        return format!("{host}:{DEFAULT_SSH_PORT}");
    }
    match host.matches(':').count() {
        0 => format!("{host}:{DEFAULT_SSH_PORT}"),
        1 => host.to_string(),
        _ => format!("[{host}]:{DEFAULT_SSH_PORT}"),
    }
}

/// Split a `host:port` pair, removing IPv6 brackets from the host.
///
/// An empty host is kept; for a remote listener it means every interface.
pub fn split_host_port(address: &str) -> TunnelResult<(String, u16)> {
    let trimmed = address.trim();
    let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| TunnelError::invalid_address(address, "expected [host]:port"))?;
        (host, port)
    } else {
        trimmed
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::invalid_address(address, "expected host:port"))?
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| TunnelError::invalid_address(address, format!("invalid port: {port}")))?;
    Ok((host.to_string(), port))
}
