//! 16-byte address field shared by discovery messages.
//!
//! IPv6 addresses are written as-is; IPv4 addresses travel as IPv4-mapped
//! IPv6 (`::ffff:a.b.c.d`). The all-zero address means "the sender's
//! address".

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use pvwire_frame::{Result, WireReader, WireWriter};

/// Encoded size of an address field.
pub const ADDRESS_SIZE: usize = 16;

pub fn encode_address(w: &mut WireWriter<'_>, addr: IpAddr) {
    let mapped = match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    w.put_bytes(&mapped.octets());
}

pub fn decode_address(r: &mut WireReader<'_>) -> Result<IpAddr> {
    let octets: [u8; ADDRESS_SIZE] = r.get_array()?;
    let v6 = Ipv6Addr::from(octets);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}

/// Resolve an address reported by a peer against the datagram source.
///
/// An unspecified reported address is replaced by the source address.
pub fn resolve_reported(reported: IpAddr, port: u16, from: SocketAddr) -> SocketAddr {
    if reported.is_unspecified() {
        SocketAddr::new(from.ip(), port)
    } else {
        SocketAddr::new(reported, port)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::BytesMut;
    use pvwire_frame::ByteOrder;

    use super::*;

    fn encoded(addr: IpAddr) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_address(&mut WireWriter::new(&mut buf, ByteOrder::Big), addr);
        buf
    }

    #[test]
    fn ipv4_travels_mapped() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        let buf = encoded(addr);
        assert_eq!(buf.len(), ADDRESS_SIZE);
        assert_eq!(&buf[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(&buf[12..], &[192, 168, 1, 20]);

        let decoded = decode_address(&mut WireReader::new(&buf, ByteOrder::Little)).expect("decode");
        assert_eq!(decoded, addr);
    }

    #[test]
    fn ipv6_is_kept() {
        let addr: IpAddr = "fe80::1".parse().expect("addr");
        let buf = encoded(addr);
        let decoded = decode_address(&mut WireReader::new(&buf, ByteOrder::Big)).expect("decode");
        assert_eq!(decoded, addr);
    }

    #[test]
    fn unspecified_resolves_to_sender() {
        let from: SocketAddr = "10.0.0.5:40000".parse().expect("addr");
        let zero = decode_address(&mut WireReader::new(&[0u8; 16], ByteOrder::Big)).expect("decode");
        assert!(zero.is_unspecified());
        assert_eq!(
            resolve_reported(zero, 5075, from),
            "10.0.0.5:5075".parse::<SocketAddr>().expect("addr")
        );

        let reported = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(resolve_reported(reported, 5075, from).ip(), reported);
    }
}
