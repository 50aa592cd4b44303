//! Subnet key encoding
//!
//! A lease is addressed in the store by `"<ipv4>-<prefixlen>"`, suffixed
//! with `"&<ipv6>-<prefixlen>"` for dual-stack leases. Existing stores
//! already hold keys in this form, so the encoding must not change.

use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Encode the store key for a lease
pub fn make_subnet_key(sn: Ipv4Net, sn6: Option<Ipv6Net>) -> String {
    match sn6 {
        None => format!("{}-{}", sn.addr(), sn.prefix_len()),
        Some(sn6) => format!(
            "{}-{}&{}-{}",
            sn.addr(),
            sn.prefix_len(),
            sn6.addr(),
            sn6.prefix_len()
        ),
    }
}

/// Decode a subnet key
///
/// Accepts either a bare key or a full store path; only the last path
/// segment is considered. Returns `None` for anything that is not a
/// well-formed subnet key.
pub fn parse_subnet_key(s: &str) -> Option<(Ipv4Net, Option<Ipv6Net>)> {
    let key = s.rsplit('/').next()?;

    let (v4, v6) = match key.split_once('&') {
        Some((v4, v6)) => (v4, Some(v6)),
        None => (key, None),
    };

    let (addr, len) = v4.split_once('-')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let sn = Ipv4Net::new(addr, len.parse().ok()?).ok()?;

    let sn6 = match v6 {
        None => None,
        Some(v6) => {
            let (addr, len) = v6.split_once('-')?;
            let addr: Ipv6Addr = addr.parse().ok()?;
            Some(Ipv6Net::new(addr, len.parse().ok()?).ok()?)
        }
    };

    Some((sn, sn6))
}
