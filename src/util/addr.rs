use std::cmp::Ordering;
use std::net::SocketAddr;

/// A total order over socket addresses that two processes evaluate identically: IPv4 sorts
///  before IPv6, addresses of the same family are compared by their octets, then by port.
///
/// IPv6 flow info and scope id are not part of the order - they are local to the sending host
///  and would not be seen the same way by the peer.
pub fn addr_cmp(a: &SocketAddr, b: &SocketAddr) -> Ordering {
    match (a, b) {
        (SocketAddr::V4(a), SocketAddr::V4(b)) => {
            a.ip().octets().cmp(&b.ip().octets())
                .then(a.port().cmp(&b.port()))
        }
        (SocketAddr::V6(a), SocketAddr::V6(b)) => {
            a.ip().octets().cmp(&b.ip().octets())
                .then(a.port().cmp(&b.port()))
        }
        (SocketAddr::V4(_), SocketAddr::V6(_)) => Ordering::Less,
        (SocketAddr::V6(_), SocketAddr::V4(_)) => Ordering::Greater,
    }
}

#[cfg(test)]
mod test {
    use std::net::{Ipv6Addr, SocketAddrV6};
    use std::str::FromStr;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::equal("10.0.0.1:5000", "10.0.0.1:5000", Ordering::Equal)]
    #[case::ip_less("10.0.0.1:5000", "10.0.0.2:1", Ordering::Less)]
    #[case::ip_greater("10.0.1.0:1", "10.0.0.255:9999", Ordering::Greater)]
    #[case::port_less("10.0.0.1:4999", "10.0.0.1:5000", Ordering::Less)]
    #[case::v4_before_v6("255.255.255.255:65535", "[::]:0", Ordering::Less)]
    #[case::v6_after_v4("[::1]:1", "0.0.0.0:0", Ordering::Greater)]
    #[case::v6_ip("[fe80::1]:7", "[fe80::2]:7", Ordering::Less)]
    #[case::v6_port("[fe80::1]:8", "[fe80::1]:7", Ordering::Greater)]
    fn test_addr_cmp(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        let a = SocketAddr::from_str(a).unwrap();
        let b = SocketAddr::from_str(b).unwrap();
        assert_eq!(addr_cmp(&a, &b), expected);
        assert_eq!(addr_cmp(&b, &a), expected.reverse());
    }

    #[test]
    fn test_addr_cmp_ignores_scope() {
        let ip = Ipv6Addr::from_str("fe80::1").unwrap();
        let a = SocketAddr::V6(SocketAddrV6::new(ip, 7, 1, 2));
        let b = SocketAddr::V6(SocketAddrV6::new(ip, 7, 0, 3));
        assert_eq!(addr_cmp(&a, &b), Ordering::Equal);
    }
}
