//! Address normalization for map columns keyed by IP.
//!
//! IPv6 addresses are stored in brackets (`[2001:db8::1]`) so that a
//! `port:address` value can be split on the first colon; IPv4 addresses are
//! stored as-is.

use std::net::IpAddr;

use crate::error::{IdlError, IdlResult};

/// Bracket `addr` iff it is an IPv6 address.
///
/// Accepts an already-bracketed address and an optional `/prefix` suffix.
pub fn bracket_if_ipv6(addr: &str) -> IdlResult<String> {
    let trimmed = addr.trim();
    let bare = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let (ip, prefix) = match bare.split_once('/') {
        Some((ip, prefix)) => (ip, Some(prefix)),
        None => (bare, None),
    };

    let parsed: IpAddr = ip
        .parse()
        .map_err(|_| IdlError::InvalidAddress(addr.to_string()))?;
    if let Some(prefix) = prefix {
        let max = if parsed.is_ipv6() { 128 } else { 32 };
        match prefix.parse::<u8>() {
            Ok(len) if len <= max => {}
            _ => return Err(IdlError::InvalidAddress(addr.to_string())),
        }
    }

    Ok(match parsed {
        IpAddr::V6(_) => format!("[{bare}]"),
        IpAddr::V4(_) => bare.to_string(),
    })
}

/// Drop the brackets `bracket_if_ipv6` adds.
pub fn strip_brackets(addr: &str) -> &str {
    addr.strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(addr)
}
