use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// A loopback address with the number as its port, so that addresses compare in the order of
///  their numbers
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}
