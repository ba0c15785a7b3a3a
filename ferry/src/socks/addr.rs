//! SOCKS5 address encoding (RFC 1928 §5), shared by the SOCKS front-end,
//! the SOCKS5 upstream client, and the shadowsocks target header.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::AsyncRead;

use crate::network::stream_reader::StreamReader;
use crate::utils::address::{Address, NetLocation};

pub const SOCKS5_VERSION: u8 = 0x05;

pub mod auth {
    pub const METHOD_NONE: u8 = 0x00;
    pub const METHOD_NOT_ACCEPTABLE: u8 = 0xff;
}

pub mod command {
    pub const CONNECT: u8 = 0x01;
}

pub mod address_type {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN_NAME: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const CONNECTION_NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Read an ATYP-prefixed address and port.
pub async fn read_location<R: AsyncRead + Unpin + ?Sized>(
    stream: &mut R,
    reader: &mut StreamReader,
) -> std::io::Result<NetLocation> {
    let address_type = reader.read_u8(stream).await?;
    let address = match address_type {
        address_type::IPV4 => {
            let octets: [u8; 4] = reader.read_slice(stream, 4).await?.try_into().unwrap();
            Address::Ipv4(Ipv4Addr::from(octets))
        }
        address_type::IPV6 => {
            let octets: [u8; 16] = reader.read_slice(stream, 16).await?.try_into().unwrap();
            Address::Ipv6(Ipv6Addr::from(octets))
        }
        address_type::DOMAIN_NAME => {
            let len = reader.read_u8(stream).await? as usize;
            if len == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "empty domain name",
                ));
            }
            let bytes = reader.read_slice(stream, len).await?;
            let name = std::str::from_utf8(bytes)
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 domain name")
                })?
                .to_string();
            // A client may send a literal IP under the domain ATYP.
            Address::from_str_smart(&name)
        }
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown address type: {other:#02x}"),
            ));
        }
    };
    let port = reader.read_u16_be(stream).await?;
    Ok(NetLocation::new(address, port))
}

/// Encode an address and port with its ATYP prefix.
pub fn write_location(location: &NetLocation) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 1 + 255 + 2);
    match &location.address {
        Address::Ipv4(v4) => {
            buf.push(address_type::IPV4);
            buf.extend_from_slice(&v4.octets());
        }
        Address::Ipv6(v6) => {
            buf.push(address_type::IPV6);
            buf.extend_from_slice(&v6.octets());
        }
        Address::Hostname(name) => {
            buf.push(address_type::DOMAIN_NAME);
            let bytes = name.as_bytes();
            buf.push(bytes.len().min(255) as u8);
            buf.extend_from_slice(&bytes[..bytes.len().min(255)]);
        }
    }
    buf.extend_from_slice(&location.port.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn location_encoding_round_trips() {
        for location in [
            NetLocation::parse("1.2.3.4:80").unwrap(),
            NetLocation::parse("[2001:db8::1]:443").unwrap(),
            NetLocation::from_host_port("example.com", 8080),
        ] {
            let encoded = write_location(&location);
            let (mut a, mut b) = tokio::io::duplex(512);
            a.write_all(&encoded).await.unwrap();

            let mut reader = StreamReader::new();
            let decoded = read_location(&mut b, &mut reader).await.unwrap();
            assert_eq!(decoded, location);
        }
    }

    #[tokio::test]
    async fn domain_encoding_matches_the_rfc_layout() {
        let encoded = write_location(&NetLocation::from_host_port("example.com", 80));
        assert_eq!(encoded[0], address_type::DOMAIN_NAME);
        assert_eq!(encoded[1], 11);
        assert_eq!(&encoded[2..13], b"example.com");
        assert_eq!(&encoded[13..], &[0x00, 0x50]);
    }
}
