use num::{One, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Bind a UDP socket that other processes on this host may also bind.
///
/// Beacons arrive on a well-known port that several clients listen on at once.
pub(crate) fn new_reusable_udp_socket<T: ToSocketAddrs>(address: T) -> io::Result<UdpSocket> {
    let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "No address to bind UDP socket")
    })?;
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + One + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::one());
    id
}

/// Broadcast addresses of every non-loopback IPv4 interface
pub(crate) fn interface_broadcast_ips() -> Vec<IpAddr> {
    datalink::interfaces()
        .into_iter()
        .filter(|i| !i.is_loopback())
        .flat_map(|i| i.ips.into_iter())
        .filter(|i| i.is_ipv4())
        .map(|i| i.broadcast())
        .collect()
}

/// Resolve an EPICS-style whitespace separated address list.
///
/// Entries without an explicit port use `default_port`. Hostnames are resolved
/// here, so calling this again re-resolves them.
pub(crate) fn parse_address_list(list: &str, default_port: u16) -> Vec<SocketAddr> {
    let mut addresses = Vec::new();
    for entry in list.split_ascii_whitespace() {
        let resolved = if entry.contains(':') {
            entry.to_socket_addrs()
        } else {
            (entry, default_port).to_socket_addrs()
        };
        match resolved {
            Ok(addr) => {
                let addr: Vec<_> = addr.filter(SocketAddr::is_ipv4).collect();
                debug!("Adding address: {entry} => {addr:?}");
                addresses.extend(addr);
            }
            Err(e) => warn!("Failed to convert '{entry}' to address: {e}"),
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_add() {
        let mut i = 3u32;
        assert_eq!(wrapping_inplace_add(&mut i), 3);
        assert_eq!(i, 4);
        let mut i = u32::MAX;
        assert_eq!(wrapping_inplace_add(&mut i), u32::MAX);
        assert_eq!(i, 0);
    }

    #[test]
    fn address_lists() {
        let addresses = parse_address_list("127.0.0.1  10.0.0.255:6000", 5064);
        assert_eq!(
            addresses,
            vec![
                "127.0.0.1:5064".parse().unwrap(),
                "10.0.0.255:6000".parse().unwrap()
            ]
        );
    }
}
