//! Forwarding address derivation.
//!
//! Every node accepts forwarded requests on its consensus host at the
//! consensus port plus one. Peers rely on this to reach each other, so it is
//! never configured separately.

use crate::error::AddressError;

/// `host:port` to `host:port+1`. IPv6 hosts keep their brackets.
pub fn forwarding_addr(raft_addr: &str) -> Result<String, AddressError> {
    let (host, port) = raft_addr
        .rsplit_once(':')
        .ok_or_else(|| AddressError::MissingPort(raft_addr.to_string()))?;

    if host.is_empty() {
        return Err(AddressError::MissingHost(raft_addr.to_string()));
    }
    // A bare IPv6 address like "::1" has colons but no port.
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(AddressError::MissingPort(raft_addr.to_string()));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| AddressError::InvalidPort(raft_addr.to_string()))?;
    let next = port
        .checked_add(1)
        .ok_or_else(|| AddressError::PortOverflow(raft_addr.to_string()))?;

    Ok(format!("{host}:{next}"))
}
