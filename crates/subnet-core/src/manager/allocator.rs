//! Free subnet selection
//!
//! Walks the configured range in subnet-sized steps collecting blocks
//! that overlap no existing lease, then picks one at random. Random
//! choice keeps nodes that start together from all racing for the same
//! first free block.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use rand::Rng;
use tracing::info;

use crate::config::{Config, SubnetRange};
use crate::lease::Lease;
use crate::{Error, Result};

/// Upper bound on candidates collected per address family
pub const MAX_CANDIDATES: usize = 100;

fn ipv4_overlaps(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn ipv6_overlaps(a: Ipv6Net, b: Ipv6Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Free IPv4 subnets in `range`, in ascending order
pub fn ipv4_candidates(range: SubnetRange<Ipv4Addr>, leases: &[Lease]) -> Vec<Ipv4Net> {
    let step = 1u64 << (32 - u32::from(range.len));
    let max = u64::from(u32::from(range.max));
    let mut next = u64::from(u32::from(range.min));
    let mut out = Vec::new();

    while next <= max && out.len() < MAX_CANDIDATES {
        let addr = Ipv4Addr::from(next as u32);
        if let Ok(sn) = Ipv4Net::new(addr, range.len) {
            let taken = leases
                .iter()
                .filter_map(|l| l.subnet)
                .any(|leased| ipv4_overlaps(sn, leased));
            if !taken {
                out.push(sn);
            }
        }
        next += step;
    }
    out
}

/// Free IPv6 subnets in `range`, in ascending order
pub fn ipv6_candidates(range: SubnetRange<Ipv6Addr>, leases: &[Lease]) -> Vec<Ipv6Net> {
    let step = 1u128 << (128 - u32::from(range.len));
    let max = u128::from(range.max);
    let mut next = Some(u128::from(range.min));
    let mut out = Vec::new();

    while let Some(cur) = next
        && cur <= max
        && out.len() < MAX_CANDIDATES
    {
        if let Ok(sn) = Ipv6Net::new(Ipv6Addr::from(cur), range.len) {
            let taken = leases
                .iter()
                .filter_map(|l| l.ipv6_subnet)
                .any(|leased| ipv6_overlaps(sn, leased));
            if !taken {
                out.push(sn);
            }
        }
        next = cur.checked_add(step);
    }
    out
}

/// Pick a free subnet (and a free IPv6 subnet when IPv6 is enabled)
pub fn allocate_subnet(config: &Config, leases: &[Lease]) -> Result<(Ipv4Net, Option<Ipv6Net>)> {
    let range = config
        .ipv4_range()
        .ok_or_else(|| Error::config("network config has no IPv4 allocation range"))?;
    info!(min = %range.min, max = %range.max, "picking subnet in range");
    let v4 = ipv4_candidates(range, leases);

    let v6 = if config.enable_ipv6 {
        let range = config
            .ipv6_range()
            .ok_or_else(|| Error::config("network config has no IPv6 allocation range"))?;
        info!(min = %range.min, max = %range.max, "picking ipv6 subnet in range");
        Some(ipv6_candidates(range, leases))
    } else {
        None
    };

    if v4.is_empty() || v6.as_ref().is_some_and(Vec::is_empty) {
        return Err(Error::OutOfSubnets);
    }

    let mut rng = rand::thread_rng();
    let sn = v4[rng.gen_range(0..v4.len())];
    let sn6 = v6.map(|c| c[rng.gen_range(0..c.len())]);
    Ok((sn, sn6))
}
