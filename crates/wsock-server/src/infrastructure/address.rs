//! Resolution of the listening address.
//!
//! When no bind address is configured the server listens on the first IPv4
//! address found on a local interface, preferring non-loopback interfaces.
//! Enumeration reads the interface table only, so it works on hosts with no
//! default route.

use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

use crate::infrastructure::server::ServerError;

/// Returns `explicit` if set, otherwise the first local IPv4 address.
///
/// # Errors
///
/// [`ServerError::AddressResolution`] if no address was given and none
/// could be found.
pub fn resolve_bind_address(explicit: Option<IpAddr>) -> Result<IpAddr, ServerError> {
    match explicit {
        Some(ip) => Ok(ip),
        None => local_ipv4_address().map(IpAddr::V4),
    }
}

/// Finds the first IPv4 address assigned to a local interface.
///
/// Loopback is used only when no other IPv4 interface is up.
pub fn local_ipv4_address() -> Result<Ipv4Addr, ServerError> {
    let interfaces = if_addrs::get_if_addrs().map_err(|e| ServerError::AddressResolution {
        reason: format!("cannot list network interfaces: {e}"),
    })?;

    let ip = first_ipv4(
        interfaces
            .iter()
            .map(|iface| (iface.ip(), iface.is_loopback())),
    )
    .ok_or_else(|| ServerError::AddressResolution {
        reason: format!("none of {} interfaces has an IPv4 address", interfaces.len()),
    })?;

    debug!("resolved local IPv4 address {ip}");
    Ok(ip)
}

/// Picks the first non-loopback IPv4 address, falling back to the first
/// loopback one.  Candidates are `(address, is_loopback)` pairs.
fn first_ipv4(candidates: impl IntoIterator<Item = (IpAddr, bool)>) -> Option<Ipv4Addr> {
    let mut loopback = None;
    for (ip, is_loopback) in candidates {
        let IpAddr::V4(v4) = ip else { continue };
        if v4.is_unspecified() {
            continue;
        }
        if !is_loopback {
            return Some(v4);
        }
        loopback.get_or_insert(v4);
    }
    loopback
}
