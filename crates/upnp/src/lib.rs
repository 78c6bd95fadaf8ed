//! Network-interface helpers shared between the SSDP server and the HTTP
//! server: picking the local address to advertise in a `LOCATION` header
//! relative to whichever peer asked for it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::bail;
use network_interface::NetworkInterface;

/// Given a socket address a peer connected from (or sent a datagram from),
/// find the local address that shares a subnet with it, so a multi-homed
/// host advertises the interface the requester can actually reach.
pub fn get_local_ip_relative_to(
    local_dest: SocketAddr,
    interfaces: &[NetworkInterface],
) -> anyhow::Result<IpAddr> {
    fn masked_v4(ip: Ipv4Addr, mask: Ipv4Addr) -> u32 {
        ip.to_bits() & mask.to_bits()
    }

    fn masked_v6(ip: Ipv6Addr, mask: Ipv6Addr) -> u128 {
        ip.to_bits() & mask.to_bits()
    }

    for i in interfaces {
        for addr in i.addr.iter() {
            match (local_dest, addr.ip(), addr.netmask()) {
                // We are connecting to ourselves, return itself.
                (l, a, _) if l.ip() == a => return Ok(addr.ip()),
                // IPv4 masks match.
                (SocketAddr::V4(l), IpAddr::V4(a), Some(IpAddr::V4(m)))
                    if masked_v4(*l.ip(), m) == masked_v4(a, m) =>
                {
                    return Ok(addr.ip());
                }
                // Return IPv6 link-local addresses when source is link-local address and there's a scope_id set.
                (SocketAddr::V6(l), IpAddr::V6(a), _)
                    if l.ip().is_unicast_link_local() && l.scope_id() > 0 =>
                {
                    if a.is_unicast_link_local() && l.scope_id() == i.index {
                        return Ok(addr.ip());
                    }
                }
                // If V6 masks match, return.
                (SocketAddr::V6(l), IpAddr::V6(a), Some(IpAddr::V6(m)))
                    if masked_v6(*l.ip(), m) == masked_v6(a, m) =>
                {
                    return Ok(addr.ip());
                }
                // For IPv6 fallback to returning a random (first encountered) IPv6 address.
                (SocketAddr::V6(_), IpAddr::V6(_), None) => return Ok(addr.ip()),
                _ => continue,
            }
        }
    }
    bail!("couldn't find a local ip address")
}

/// Bitwise-AND subnet comparison for two IPv4 addresses under a mask.
/// Used by the interface-change monitor to detect whether the set of
/// `(ip, netmask)` pairs on the host actually changed.
pub fn same_subnet_v4(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    a.to_bits() & mask.to_bits() == b.to_bits() & mask.to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;
    use network_interface::{Addr, V4IfAddr};

    fn nic(name: &str, index: u32, ip: Ipv4Addr, netmask: Ipv4Addr) -> NetworkInterface {
        NetworkInterface {
            name: name.to_owned(),
            addr: vec![Addr::V4(V4IfAddr {
                ip,
                broadcast: None,
                netmask: Some(netmask),
            })],
            index,
            mac_addr: None,
        }
    }

    #[test]
    fn test_masked_subnet_selects_matching_interface() {
        let interfaces = vec![
            nic(
                "eth0",
                1,
                Ipv4Addr::new(192, 168, 1, 5),
                Ipv4Addr::new(255, 255, 255, 0),
            ),
            nic(
                "eth1",
                2,
                Ipv4Addr::new(10, 0, 0, 5),
                Ipv4Addr::new(255, 255, 255, 0),
            ),
        ];

        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)), 12345);
        let ip = get_local_ip_relative_to(dest, &interfaces).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)));

        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)), 12345);
        let ip = get_local_ip_relative_to(dest, &interfaces).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn test_no_matching_subnet_errors() {
        let interfaces = vec![nic(
            "eth0",
            1,
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(255, 255, 255, 0),
        )];
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)), 1900);
        assert!(get_local_ip_relative_to(dest, &interfaces).is_err());
    }

    #[test]
    fn test_same_subnet_v4() {
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(same_subnet_v4(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(192, 168, 1, 200),
            mask
        ));
        assert!(!same_subnet_v4(
            Ipv4Addr::new(192, 168, 1, 5),
            Ipv4Addr::new(192, 168, 2, 200),
            mask
        ));
    }
}
