// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

//! Raw-socket UDP egress impersonating a third-party source address.
//!
//! When a transparently-redirected UDP flow is answered from the proxy, the
//! peer expects the reply to come from the server it originally addressed,
//! not from the proxy. The masquerade path hand-crafts an IPv4 + UDP header
//! with source = original destination and sends the packet through a raw
//! `IPPROTO_RAW` socket (which implies `IP_HDRINCL`: the kernel takes our
//! IP header as-is but still fills the IP checksum we leave zeroed). The UDP
//! checksum is also left zeroed, which is valid for IPv4.

use buffer::Data;
use etherparse::{IpNumber, Ipv4Header, UdpHeader};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddrV4;

const MASQUERADE_TTL: u8 = 23;

/// A raw IPv4 socket for masqueraded UDP replies.
pub struct MasqueradeSocket {
    socket: Socket,
}

impl MasqueradeSocket {
    /// Opens the raw socket. Needs `CAP_NET_RAW`.
    ///
    /// # Errors
    ///
    /// Returns the socket error, typically permission denied when the
    /// process lacks raw-socket privileges.
    pub fn new() -> io::Result<Self> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// Sends one datagram `source -> destination` with the given payload.
    /// Returns the payload length on success.
    ///
    /// # Errors
    ///
    /// Returns the send error; `WouldBlock` means the packet was dropped.
    pub fn send_to(
        &self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        payload: &Data,
    ) -> io::Result<usize> {
        let packet = encode_packet(source, destination, payload)?;
        self.socket
            .send_to(&packet, &std::net::SocketAddr::V4(destination).into())?;
        Ok(payload.len())
    }
}

/// Serializes IPv4 header + UDP header + payload. Lengths are patched per
/// datagram; both checksums stay zero.
fn encode_packet(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &Data,
) -> io::Result<Vec<u8>> {
    let udp_len = u16::try_from(payload.len() + UdpHeader::LEN)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"))?;

    let ip = Ipv4Header::new(
        udp_len,
        MASQUERADE_TTL,
        IpNumber::UDP,
        source.ip().octets(),
        destination.ip().octets(),
    )
    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"))?;

    let udp = UdpHeader {
        source_port: source.port(),
        destination_port: destination.port(),
        length: udp_len,
        checksum: 0,
    };

    let mut packet = Vec::with_capacity(ip.header_len() + usize::from(udp_len));
    // write_raw keeps the zeroed IP checksum for the kernel to fill.
    ip.write_raw(&mut packet)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    udp.write(&mut packet)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    for chunk in payload.chunks() {
        packet.extend_from_slice(chunk);
    }
    Ok(packet)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn packet_layout_matches_the_wire_format() {
        let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 53);
        let destination = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 40000);
        let payload = Data::from_slice(b"reply");

        let packet = encode_packet(source, destination, &payload).unwrap();
        assert_eq!(packet.len(), 20 + 8 + 5);

        // IPv4: version 4, IHL 5, TTL 23, protocol 17, checksum zero.
        assert_eq!(packet[0], 0x45);
        assert_eq!(packet[8], 23);
        assert_eq!(packet[9], 17);
        assert_eq!(&packet[10..12], &[0, 0]);
        // Total length covers both headers and the payload.
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 20 + 8 + 5);
        // Addresses: source is the impersonated server, destination the peer.
        assert_eq!(&packet[12..16], &source.ip().octets());
        assert_eq!(&packet[16..20], &destination.ip().octets());

        // UDP: ports, length, zero checksum.
        assert_eq!(u16::from_be_bytes([packet[20], packet[21]]), 53);
        assert_eq!(u16::from_be_bytes([packet[22], packet[23]]), 40000);
        assert_eq!(u16::from_be_bytes([packet[24], packet[25]]), 8 + 5);
        assert_eq!(&packet[26..28], &[0, 0]);

        assert_eq!(&packet[28..], b"reply");
    }
}
