use std::net::Ipv4Addr;

/// IPv4 arithmetic helpers for subnet carving

/// Netmask for a prefix length, as a host-order integer
pub fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}

/// Network address of `ip` under `prefix`
pub fn network_address(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & prefix_mask(prefix))
}

/// Number of usable host addresses in a subnet (network and broadcast excluded)
pub fn host_capacity(prefix: u8) -> u32 {
    match prefix {
        p if p >= 31 => 0,
        p => (1u32 << (32 - p)) - 2,
    }
}

/// Number of `subnet_prefix` subnets that fit into a `pool_prefix` pool
pub fn subnet_capacity(pool_prefix: u8, subnet_prefix: u8) -> u64 {
    if subnet_prefix < pool_prefix {
        return 0;
    }
    1u64 << (subnet_prefix - pool_prefix)
}

/// The `n`-th `subnet_prefix` subnet inside the pool starting at `base`
pub fn nth_subnet(base: Ipv4Addr, pool_prefix: u8, subnet_prefix: u8, n: u32) -> Option<Ipv4Addr> {
    if u64::from(n) >= subnet_capacity(pool_prefix, subnet_prefix) {
        return None;
    }
    let base = u32::from(network_address(base, pool_prefix));
    let step = 1u32.checked_shl(32 - u32::from(subnet_prefix)).unwrap_or(0);
    base.checked_add(n.checked_mul(step)?).map(Ipv4Addr::from)
}

/// The `host`-th address inside `network` (host 1 is the first usable one)
pub fn host_address(network: Ipv4Addr, host: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network).wrapping_add(host))
}

/// Format an address with its prefix length
pub fn format_cidr(ip: Ipv4Addr, prefix: u8) -> String {
    format!("{}/{}", ip, prefix)
}

/// Check if an IPv4 address is private (RFC 1918)
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    // 10.0.0.0/8
    octets[0] == 10 ||
    // 172.16.0.0/12
    (octets[0] == 172 && octets[1] >= 16 && octets[1] <= 31) ||
    // 192.168.0.0/16
    (octets[0] == 192 && octets[1] == 168)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_mask() {
        assert_eq!(prefix_mask(0), 0);
        assert_eq!(prefix_mask(24), 0xffff_ff00);
        assert_eq!(prefix_mask(32), u32::MAX);
    }

    #[test]
    fn test_nth_subnet() {
        let base = Ipv4Addr::new(10, 0, 0, 0);
        assert_eq!(nth_subnet(base, 16, 24, 0), Some(Ipv4Addr::new(10, 0, 0, 0)));
        assert_eq!(nth_subnet(base, 16, 24, 5), Some(Ipv4Addr::new(10, 0, 5, 0)));
        assert_eq!(nth_subnet(base, 16, 24, 255), Some(Ipv4Addr::new(10, 0, 255, 0)));
        assert_eq!(nth_subnet(base, 16, 24, 256), None);
        assert_eq!(nth_subnet(base, 24, 16, 0), None);
    }

    #[test]
    fn test_host_capacity() {
        assert_eq!(host_capacity(24), 254);
        assert_eq!(host_capacity(30), 2);
        assert_eq!(host_capacity(31), 0);
    }

    #[test]
    fn test_is_private_ipv4() {
        assert!(is_private_ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_private_ipv4(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_private_ipv4(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_private_ipv4(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_format_cidr() {
        assert_eq!(format_cidr(Ipv4Addr::new(10, 0, 1, 2), 24), "10.0.1.2/24");
    }
}
