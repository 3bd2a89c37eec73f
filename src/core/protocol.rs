//! VLESS session header parsing
//!
//! Request header layout (big-endian):
//! - Version (1 byte)
//! - Session token (16 bytes, raw UUID)
//! - Addon length N (1 byte) + N addon bytes (skipped)
//! - Command (1 byte: TCP=1, UDP=2)
//! - Port (2 bytes)
//! - Address type (1 byte: IPv4=1, Domain=2, IPv6=3) + address
//! - Payload
//!
//! Response header: version echoed back followed by a zero status byte.

use std::net::{Ipv4Addr, Ipv6Addr};
use subtle::ConstantTimeEq;

use super::identity::Identity;
use crate::error::ProtocolError;

/// Address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 2;
const ATYP_IPV6: u8 = 3;

/// Longest domain a one-byte length prefix can carry
const MAX_DOMAIN_LEN: usize = u8::MAX as usize;

/// The only destination port relayed over UDP
pub const DNS_PORT: u16 = 53;

/// Token length in bytes
pub const TOKEN_LEN: usize = 16;

/// VLESS command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlessCmd {
    /// TCP stream
    Tcp = 1,
    /// UDP datagrams (DNS only)
    Udp = 2,
}

impl TryFrom<u8> for VlessCmd {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(VlessCmd::Tcp),
            2 => Ok(VlessCmd::Udp),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Outbound destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl Address {
    /// Decode `port | atyp | address` from the start of `buf`
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if buf.len() < 3 {
            return Err(ProtocolError::Truncated);
        }
        let port = u16::from_be_bytes([buf[0], buf[1]]);
        let atyp = buf[2];
        let rest = &buf[3..];

        match atyp {
            ATYP_IPV4 => {
                if rest.len() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&rest[..4]);
                Ok((Address::IPv4(ip, port), 3 + 4))
            }
            ATYP_IPV6 => {
                if rest.len() < 16 {
                    return Err(ProtocolError::Truncated);
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&rest[..16]);
                Ok((Address::IPv6(ip, port), 3 + 16))
            }
            ATYP_DOMAIN => {
                let Some(&domain_len) = rest.first() else {
                    return Err(ProtocolError::Truncated);
                };
                let domain_len = domain_len as usize;
                if rest.len() < 1 + domain_len {
                    return Err(ProtocolError::Truncated);
                }
                let domain = std::str::from_utf8(&rest[1..1 + domain_len])
                    .map_err(|_| ProtocolError::InvalidDomain)?;
                if domain.is_empty() || !domain.is_ascii() {
                    return Err(ProtocolError::InvalidDomain);
                }
                Ok((Address::Domain(domain.to_string(), port), 3 + 1 + domain_len))
            }
            other => Err(ProtocolError::UnknownAddressType(other)),
        }
    }

    /// Encode as `port | atyp | address`
    ///
    /// Domains longer than 255 bytes are cut at 255, the most the length
    /// byte can describe. Returns the number of bytes written.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start_len = buf.len();
        buf.extend_from_slice(&self.port().to_be_bytes());
        match self {
            Address::IPv4(ip, _) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
            }
            Address::IPv6(ip, _) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
            }
            Address::Domain(domain, _) => {
                let name = &domain.as_bytes()[..domain.len().min(MAX_DOMAIN_LEN)];
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);
            }
        }
        buf.len() - start_len
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host string (IP or domain)
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

/// Parsed VLESS request header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessRequest {
    /// Protocol version, echoed in the response
    pub version: u8,
    /// Command type
    pub cmd: VlessCmd,
    /// Target address
    pub addr: Address,
    /// Index into the decoded buffer where the relay payload begins
    pub payload_offset: usize,
}

impl VlessRequest {
    /// Version + token + addon length
    const PREFIX_LEN: usize = 1 + TOKEN_LEN + 1;

    /// Compute the full header length without validating any field
    ///
    /// Only reports `Truncated`. An unknown address type ends the header right
    /// after the type byte so that validation can reject it.
    pub fn header_len(buf: &[u8]) -> Result<usize, ProtocolError> {
        if buf.len() < Self::PREFIX_LEN {
            return Err(ProtocolError::Truncated);
        }
        let addon_len = buf[Self::PREFIX_LEN - 1] as usize;
        // cmd(1) + port(2) precede the address type
        let atyp_pos = Self::PREFIX_LEN + addon_len + 3;
        if buf.len() <= atyp_pos {
            return Err(ProtocolError::Truncated);
        }

        let addr_pos = atyp_pos + 1;
        let end = match buf[atyp_pos] {
            ATYP_IPV4 => addr_pos + 4,
            ATYP_IPV6 => addr_pos + 16,
            ATYP_DOMAIN => match buf.get(addr_pos) {
                Some(&len) => addr_pos + 1 + len as usize,
                None => return Err(ProtocolError::Truncated),
            },
            _ => addr_pos,
        };

        if buf.len() < end {
            return Err(ProtocolError::Truncated);
        }
        Ok(end)
    }

    /// Decode and authenticate a request header
    ///
    /// Checks run in a fixed order: completeness, token, command, address,
    /// UDP port. The token comparison is constant-time.
    pub fn decode(buf: &[u8], identity: &Identity) -> Result<Self, ProtocolError> {
        let header_len = Self::header_len(buf)?;

        let version = buf[0];
        let token = &buf[1..1 + TOKEN_LEN];
        if !bool::from(token.ct_eq(identity.as_bytes())) {
            return Err(ProtocolError::Unauthorized);
        }

        let cmd_pos = Self::PREFIX_LEN + buf[Self::PREFIX_LEN - 1] as usize;
        let cmd = VlessCmd::try_from(buf[cmd_pos])?;

        let (addr, _) = Address::decode(&buf[cmd_pos + 1..header_len])?;

        if cmd == VlessCmd::Udp && addr.port() != DNS_PORT {
            return Err(ProtocolError::UnsupportedUdpPort(addr.port()));
        }

        Ok(VlessRequest {
            version,
            cmd,
            addr,
            payload_offset: header_len,
        })
    }

    /// Build a request header (no addons) as a client would send it
    pub fn encode(version: u8, token: &[u8; TOKEN_LEN], cmd: VlessCmd, addr: &Address) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::PREFIX_LEN + 1 + 4 + 256);
        buf.push(version);
        buf.extend_from_slice(token);
        buf.push(0);
        buf.push(cmd as u8);
        addr.encode(&mut buf);
        buf
    }
}

/// Response header sent once ahead of the first transport-bound bytes
pub fn response_header(version: u8) -> [u8; 2] {
    [version, 0x00]
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";

    fn identity() -> Identity {
        Identity::parse(UUID).unwrap()
    }

    fn request(cmd: VlessCmd, addr: &Address, payload: &[u8]) -> Vec<u8> {
        let mut buf = VlessRequest::encode(0, identity().as_bytes(), cmd, addr);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_vless_cmd_try_from() {
        assert_eq!(VlessCmd::try_from(1), Ok(VlessCmd::Tcp));
        assert_eq!(VlessCmd::try_from(2), Ok(VlessCmd::Udp));
        assert_eq!(
            VlessCmd::try_from(0),
            Err(ProtocolError::UnknownCommand(0))
        );
        assert_eq!(
            VlessCmd::try_from(3),
            Err(ProtocolError::UnknownCommand(3))
        );
    }

    #[test]
    fn test_address_decode_ipv4() {
        let buf = [0x1F, 0x90, 1, 192, 168, 1, 1]; // 192.168.1.1:8080
        let (addr, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(consumed, 7);
        assert_eq!(addr, Address::IPv4([192, 168, 1, 1], 8080));
    }

    #[test]
    fn test_address_decode_ipv6() {
        let mut buf = vec![0x01, 0xBB, 3]; // port 443, ATYP_IPV6
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        let (addr, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(consumed, 19);
        assert!(matches!(addr, Address::IPv6(_, 443)));
    }

    #[test]
    fn test_address_decode_domain() {
        let mut buf = vec![0x00, 0x50, 2, 11];
        buf.extend_from_slice(b"example.com");
        let (addr, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(consumed, 15);
        assert!(matches!(addr, Address::Domain(ref d, 80) if d == "example.com"));
    }

    #[test]
    fn test_address_decode_invalid() {
        assert_eq!(
            Address::decode(&[0, 80, 4, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownAddressType(4))
        );
        assert_eq!(
            Address::decode(&[0, 80, 2, 2, 0xff, 0xfe]),
            Err(ProtocolError::InvalidDomain)
        );
        assert_eq!(
            Address::decode(&[0, 80, 2, 0]),
            Err(ProtocolError::InvalidDomain)
        );
        assert_eq!(
            Address::decode(&[0, 80, 1, 10]),
            Err(ProtocolError::Truncated)
        );
    }

    #[test]
    fn test_address_display() {
        assert_eq!(
            Address::IPv4([192, 168, 1, 1], 8080).to_string(),
            "192.168.1.1:8080"
        );
        let mut v6 = [0u8; 16];
        v6[15] = 1;
        assert_eq!(Address::IPv6(v6, 443).to_string(), "[::1]:443");
        assert_eq!(
            Address::Domain("example.com".to_string(), 80).to_string(),
            "example.com:80"
        );
    }

    #[test]
    fn test_address_host_and_port() {
        assert_eq!(Address::IPv4([10, 0, 0, 1], 22).host(), "10.0.0.1");
        assert_eq!(Address::IPv4([10, 0, 0, 1], 22).port(), 22);
        assert_eq!(Address::Domain("a.b".to_string(), 53).host(), "a.b");
    }

    #[test]
    fn test_decode_tcp_destination_roundtrip() {
        let mut v6 = [0u8; 16];
        v6[0] = 0x20;
        v6[1] = 0x01;
        v6[15] = 7;
        let targets = vec![
            Address::IPv4([1, 2, 3, 4], 80),
            Address::IPv6(v6, 8443),
            Address::Domain("example.com".to_string(), 443),
        ];
        for target in targets {
            let buf = request(VlessCmd::Tcp, &target, b"");
            let req = VlessRequest::decode(&buf, &identity()).unwrap();
            assert_eq!(req.addr, target);

            let mut reencoded = Vec::new();
            req.addr.encode(&mut reencoded);
            let mut original = Vec::new();
            target.encode(&mut original);
            assert_eq!(reencoded, original);
        }
    }

    #[test]
    fn test_decode_domain_with_payload() {
        let target = Address::Domain("example.com".to_string(), 443);
        let buf = request(VlessCmd::Tcp, &target, b"GET / HTTP/1.1\r\n");
        let req = VlessRequest::decode(&buf, &identity()).unwrap();
        assert_eq!(req.version, 0);
        assert_eq!(req.cmd, VlessCmd::Tcp);
        assert_eq!(req.addr, target);
        assert_eq!(&buf[req.payload_offset..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_decode_skips_addons() {
        let mut buf = vec![1];
        buf.extend_from_slice(identity().as_bytes());
        buf.push(3);
        buf.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        buf.push(1);
        Address::IPv4([127, 0, 0, 1], 8080).encode(&mut buf);
        buf.extend_from_slice(b"xyz");

        let req = VlessRequest::decode(&buf, &identity()).unwrap();
        assert_eq!(req.version, 1);
        assert_eq!(req.addr, Address::IPv4([127, 0, 0, 1], 8080));
        assert_eq!(&buf[req.payload_offset..], b"xyz");
    }

    #[test]
    fn test_decode_every_prefix_is_truncated() {
        let full = request(
            VlessCmd::Tcp,
            &Address::Domain("example.com".to_string(), 443),
            b"",
        );
        for len in 0..full.len() {
            assert_eq!(
                VlessRequest::decode(&full[..len], &identity()),
                Err(ProtocolError::Truncated),
                "prefix of length {}",
                len
            );
        }
        assert!(VlessRequest::decode(&full, &identity()).is_ok());
    }

    #[test]
    fn test_decode_truncated_wins_over_bad_token() {
        let buf = [0xFFu8; 10];
        assert_eq!(
            VlessRequest::decode(&buf, &identity()),
            Err(ProtocolError::Truncated)
        );
    }

    #[test]
    fn test_decode_single_byte_token_mismatch() {
        let target = Address::IPv4([8, 8, 8, 8], 443);
        let good = request(VlessCmd::Tcp, &target, b"");
        for i in 1..=TOKEN_LEN {
            let mut bad = good.clone();
            bad[i] ^= 0x01;
            assert_eq!(
                VlessRequest::decode(&bad, &identity()),
                Err(ProtocolError::Unauthorized),
                "flipped token byte {}",
                i
            );
        }
    }

    #[test]
    fn test_decode_unauthorized_before_command() {
        let mut buf = request(VlessCmd::Tcp, &Address::IPv4([1, 1, 1, 1], 80), b"");
        buf[1] ^= 0xFF;
        buf[18] = 9;
        assert_eq!(
            VlessRequest::decode(&buf, &identity()),
            Err(ProtocolError::Unauthorized)
        );
    }

    #[test]
    fn test_decode_unknown_command() {
        let mut buf = request(VlessCmd::Tcp, &Address::IPv4([1, 1, 1, 1], 80), b"");
        buf[18] = 3;
        assert_eq!(
            VlessRequest::decode(&buf, &identity()),
            Err(ProtocolError::UnknownCommand(3))
        );
    }

    #[test]
    fn test_decode_unknown_address_type() {
        let mut buf = request(VlessCmd::Tcp, &Address::IPv4([1, 1, 1, 1], 80), b"");
        buf[21] = 4;
        assert_eq!(
            VlessRequest::decode(&buf, &identity()),
            Err(ProtocolError::UnknownAddressType(4))
        );
        // Nothing beyond the type byte is required to reject it
        assert_eq!(
            VlessRequest::decode(&buf[..22], &identity()),
            Err(ProtocolError::UnknownAddressType(4))
        );
    }

    #[test]
    fn test_decode_udp_port_policy() {
        let dns = Address::IPv4([8, 8, 8, 8], DNS_PORT);
        let buf = request(VlessCmd::Udp, &dns, b"query");
        let req = VlessRequest::decode(&buf, &identity()).unwrap();
        assert_eq!(req.cmd, VlessCmd::Udp);
        assert_eq!(&buf[req.payload_offset..], b"query");

        for port in [80u16, 443, 52, 54, 5353] {
            let buf = request(VlessCmd::Udp, &Address::IPv4([8, 8, 8, 8], port), b"");
            assert_eq!(
                VlessRequest::decode(&buf, &identity()),
                Err(ProtocolError::UnsupportedUdpPort(port))
            );
        }
    }

    #[test]
    fn test_header_len_matches_payload_offset() {
        let buf = request(VlessCmd::Tcp, &Address::IPv4([1, 2, 3, 4], 80), b"abc");
        let len = VlessRequest::header_len(&buf).unwrap();
        assert_eq!(len, 18 + 1 + 2 + 1 + 4);
        assert_eq!(len, buf.len() - 3);
    }

    #[test]
    fn test_response_header() {
        assert_eq!(response_header(0), [0, 0]);
        assert_eq!(response_header(7), [7, 0]);
    }

    #[test]
    fn test_address_rejects_non_ascii_domain() {
        let name = "bücher.example";
        let mut buf = vec![0x01, 0xBB, ATYP_DOMAIN, name.len() as u8];
        buf.extend_from_slice(name.as_bytes());
        assert_eq!(Address::decode(&buf), Err(ProtocolError::InvalidDomain));

        let mut buf = vec![0x01, 0xBB, ATYP_DOMAIN, 11];
        buf.extend_from_slice(b"example.com");
        assert!(Address::decode(&buf).is_ok());
    }

    #[test]
    fn test_address_encode_caps_long_domain() {
        let long = "a".repeat(300);
        let mut buf = Vec::new();
        let written = Address::Domain(long, 80).encode(&mut buf);

        assert_eq!(written, 2 + 1 + 1 + 255);
        assert_eq!(buf[3], 255);
        // The frame stays self-consistent and decodes back to the capped name
        let (addr, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(addr, Address::Domain("a".repeat(255), 80));
    }
}
