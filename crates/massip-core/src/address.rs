//! Classification of addresses that are not globally routable.
//!
//! Mirrors the IANA special-purpose registries for IPv4 and IPv6. An
//! IPv4-mapped IPv6 address is classified by its embedded IPv4 address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub fn parse_ip(entity: &str) -> Option<IpAddr> {
    entity.trim().parse().ok()
}

/// True when `entity` is an IP address outside the public address space.
/// Anything that does not parse as an address (hostnames, free text) is not
/// considered private.
pub fn is_private_entity(entity: &str) -> bool {
    parse_ip(entity).is_some_and(is_non_public)
}

pub fn is_non_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_non_public_v4(v4),
        IpAddr::V6(v6) => is_non_public_v6(v6),
    }
}

fn is_non_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();

    ip.is_unspecified()
        || a == 0
        || ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        // shared address space (carrier-grade NAT)
        || (a == 100 && (b & 0b1100_0000) == 64)
        // IETF protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // reserved for future use
        || a >= 240
}

fn is_non_public_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_non_public_v4(v4);
    }

    let segments = ip.segments();

    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast() && (segments[0] & 0x000f) < 0x000e
        // unique local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // link local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
        // deprecated site local fec0::/10
        || (segments[0] & 0xffc0) == 0xfec0
        // documentation 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
        // discard-only 100::/64
        || (segments[0] == 0x0100 && segments[1] == 0 && segments[2] == 0 && segments[3] == 0)
        || is_ietf_protocol_v6(segments)
}

fn is_ietf_protocol_v6(segments: [u16; 8]) -> bool {
    // 2001::/23, minus the globally reachable AMT (2001:3::/32) and
    // ORCHIDv2 (2001:20::/28) blocks.
    segments[0] == 0x2001
        && segments[1] < 0x0200
        && segments[1] != 0x0003
        && !(0x0020..=0x002f).contains(&segments[1])
}
