//! ICMP echo construction/parsing and extraction of the quoted packet
//! carried inside Time Exceeded / Destination Unreachable errors.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::TraceError;
use crate::packet::checksum;

pub const ECHO_REQUEST_V4: u8 = 8;
pub const ECHO_REPLY_V4: u8 = 0;
pub const TIME_EXCEEDED_V4: u8 = 11;
pub const DEST_UNREACHABLE_V4: u8 = 3;

pub const ECHO_REQUEST_V6: u8 = 128;
pub const ECHO_REPLY_V6: u8 = 129;
pub const TIME_EXCEEDED_V6: u8 = 3;
pub const DEST_UNREACHABLE_V6: u8 = 1;

/// ICMP header length, and also the number of quoted transport-header
/// bytes an error message is required to carry.
pub const HEADER_LEN: usize = 8;

/// An ICMP echo message: type(1) | code(1) | checksum(2) | id(2) | seq(2) | payload.
///
/// The checksum is not part of the struct; it is produced on marshal and
/// ignored on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl EchoPacket {
    pub fn echo_request_v4(identifier: u16, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            icmp_type: ECHO_REQUEST_V4,
            code: 0,
            identifier,
            sequence,
            payload,
        }
    }

    pub fn echo_request_v6(identifier: u16, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            icmp_type: ECHO_REQUEST_V6,
            code: 0,
            identifier,
            sequence,
            payload,
        }
    }

    /// Serialize with the checksum computed over the whole message (IPv4).
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = self.marshal_zero_checksum();
        let sum = checksum::checksum(&buf);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    /// Serialize with a zeroed checksum field.
    ///
    /// For ICMPv6 the checksum covers a pseudo-header and the kernel fills
    /// it on send.
    pub fn marshal_zero_checksum(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[0] = self.icmp_type;
        buf[1] = self.code;
        buf[4..6].copy_from_slice(&self.identifier.to_be_bytes());
        buf[6..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, TraceError> {
        if buf.len() < HEADER_LEN {
            return Err(TraceError::InvalidPacket("icmp message shorter than header"));
        }
        Ok(Self {
            icmp_type: buf[0],
            code: buf[1],
            identifier: u16::from_be_bytes([buf[4], buf[5]]),
            sequence: u16::from_be_bytes([buf[6], buf[7]]),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Build an echo payload whose first 8 bytes are the big-endian
/// nanosecond UNIX send time. Late replies still yield an accurate RTT
/// because the reply quotes the payload back.
pub fn timestamp_payload(extra: &[u8]) -> Vec<u8> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mut payload = Vec::with_capacity(8 + extra.len());
    payload.extend_from_slice(&nanos.to_be_bytes());
    payload.extend_from_slice(extra);
    payload
}

/// Recover the RTT from a timestamp payload, if it holds a plausible one.
pub fn payload_rtt(payload: &[u8]) -> Option<Duration> {
    if payload.len() < 8 {
        return None;
    }
    let sent = u64::from_be_bytes(payload[..8].try_into().ok()?);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_nanos() as u64;
    now.checked_sub(sent).map(Duration::from_nanos)
}

/// Skip the IPv4 header of a raw-socket read using the IHL nibble.
pub fn strip_ipv4_header(buf: &[u8]) -> Result<&[u8], TraceError> {
    if buf.is_empty() || buf[0] >> 4 != 4 {
        return Err(TraceError::InvalidPacket("not an ipv4 packet"));
    }
    let header_len = usize::from(buf[0] & 0x0f) * 4;
    if header_len < 20 || buf.len() < header_len {
        return Err(TraceError::InvalidPacket("ipv4 header truncated"));
    }
    Ok(&buf[header_len..])
}

/// The quoted transport header pulled out of an ICMP error body.
///
/// `body` is everything after the outer 8-byte ICMP header: the offending
/// packet's IP header plus at least 8 bytes of its transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quoted {
    Icmp { identifier: u16, sequence: u16 },
    Transport { dst_addr: IpAddr, src_port: u16, dst_port: u16 },
}

/// Extract the quoted header from an IPv4 error body.
pub fn quoted_v4(body: &[u8]) -> Result<Quoted, TraceError> {
    if body.is_empty() || body[0] >> 4 != 4 {
        return Err(TraceError::InvalidPacket("quoted packet is not ipv4"));
    }
    let header_len = usize::from(body[0] & 0x0f) * 4;
    if header_len < 20 || body.len() < header_len + HEADER_LEN {
        return Err(TraceError::InvalidPacket("quoted ipv4 packet too short"));
    }
    let proto = body[9];
    let dst = Ipv4Addr::new(body[16], body[17], body[18], body[19]);
    let inner = &body[header_len..];
    quoted_transport(proto, IpAddr::V4(dst), inner)
}

/// Extract the quoted header from an IPv6 error body (fixed 40-byte header).
pub fn quoted_v6(body: &[u8]) -> Result<Quoted, TraceError> {
    if body.is_empty() || body[0] >> 4 != 6 {
        return Err(TraceError::InvalidPacket("quoted packet is not ipv6"));
    }
    if body.len() < 40 + HEADER_LEN {
        return Err(TraceError::InvalidPacket("quoted ipv6 packet too short"));
    }
    let next_header = body[6];
    let dst_octets: [u8; 16] = body[24..40]
        .try_into()
        .map_err(|_| TraceError::InvalidPacket("quoted ipv6 address truncated"))?;
    let dst = Ipv6Addr::from(dst_octets);
    let inner = &body[40..];
    quoted_transport(next_header, IpAddr::V6(dst), inner)
}

fn quoted_transport(proto: u8, dst_addr: IpAddr, inner: &[u8]) -> Result<Quoted, TraceError> {
    match proto {
        // ICMP / ICMPv6: id and seq sit at the same offsets.
        1 | 58 => Ok(Quoted::Icmp {
            identifier: u16::from_be_bytes([inner[4], inner[5]]),
            sequence: u16::from_be_bytes([inner[6], inner[7]]),
        }),
        // UDP and TCP both lead with src(2) | dst(2) ports.
        6 | 17 => Ok(Quoted::Transport {
            dst_addr,
            src_port: u16::from_be_bytes([inner[0], inner[1]]),
            dst_port: u16::from_be_bytes([inner[2], inner[3]]),
        }),
        _ => Err(TraceError::InvalidPacket("quoted packet has unknown protocol")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_round_trip() {
        let packet = EchoPacket::echo_request_v4(0x1234, 7, vec![0xaa, 0xbb, 0xcc]);
        let wire = packet.marshal();
        assert!(checksum::validate(&wire));
        let parsed = EchoPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);

        let packet6 = EchoPacket::echo_request_v6(99, 1000, vec![]);
        let wire6 = packet6.marshal_zero_checksum();
        assert_eq!(&wire6[2..4], &[0, 0]);
        assert_eq!(EchoPacket::parse(&wire6).unwrap(), packet6);
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert!(matches!(
            EchoPacket::parse(&[8, 0, 0]),
            Err(TraceError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_timestamp_payload_round_trip() {
        let payload = timestamp_payload(&[1, 2, 3]);
        assert_eq!(payload.len(), 11);
        let rtt = payload_rtt(&payload).expect("rtt from own payload");
        assert!(rtt < Duration::from_secs(1));
        assert!(payload_rtt(&[0u8; 4]).is_none());
    }

    fn v4_error_body(proto: u8, dst: [u8; 4], transport: [u8; 8]) -> Vec<u8> {
        let mut body = vec![0u8; 20 + 8];
        body[0] = 0x45;
        body[9] = proto;
        body[16..20].copy_from_slice(&dst);
        body[20..28].copy_from_slice(&transport);
        body
    }

    #[test]
    fn test_quoted_icmp_v4() {
        let mut transport = [0u8; 8];
        transport[0] = ECHO_REQUEST_V4;
        transport[4..6].copy_from_slice(&0xbeefu16.to_be_bytes());
        transport[6..8].copy_from_slice(&41u16.to_be_bytes());
        let body = v4_error_body(1, [8, 8, 8, 8], transport);
        assert_eq!(
            quoted_v4(&body).unwrap(),
            Quoted::Icmp {
                identifier: 0xbeef,
                sequence: 41
            }
        );
    }

    #[test]
    fn test_quoted_udp_v4_with_options() {
        // IHL of 6 words exercises the options-aware header walk.
        let mut body = vec![0u8; 24 + 8];
        body[0] = 0x46;
        body[9] = 17;
        body[16..20].copy_from_slice(&[192, 0, 2, 1]);
        body[24..26].copy_from_slice(&54321u16.to_be_bytes());
        body[26..28].copy_from_slice(&33434u16.to_be_bytes());
        assert_eq!(
            quoted_v4(&body).unwrap(),
            Quoted::Transport {
                dst_addr: "192.0.2.1".parse().unwrap(),
                src_port: 54321,
                dst_port: 33434,
            }
        );
    }

    #[test]
    fn test_quoted_tcp_v6() {
        let mut body = vec![0u8; 40 + 8];
        body[0] = 0x60;
        body[6] = 6;
        let dst: Ipv6Addr = "2001:db8::5".parse().unwrap();
        body[24..40].copy_from_slice(&dst.octets());
        body[40..42].copy_from_slice(&40000u16.to_be_bytes());
        body[42..44].copy_from_slice(&443u16.to_be_bytes());
        assert_eq!(
            quoted_v6(&body).unwrap(),
            Quoted::Transport {
                dst_addr: dst.into(),
                src_port: 40000,
                dst_port: 443,
            }
        );
    }

    #[test]
    fn test_quoted_rejects_truncated_bodies() {
        // 20-byte header but only 4 bytes of quoted transport header.
        let mut body = vec![0u8; 24];
        body[0] = 0x45;
        body[9] = 17;
        assert!(quoted_v4(&body).is_err());
        assert!(quoted_v6(&[0x60; 12]).is_err());
        assert!(quoted_v4(&[]).is_err());
    }

    #[test]
    fn test_strip_ipv4_header() {
        let mut raw = vec![0u8; 28];
        raw[0] = 0x45;
        raw[20] = TIME_EXCEEDED_V4;
        let icmp = strip_ipv4_header(&raw).unwrap();
        assert_eq!(icmp[0], TIME_EXCEEDED_V4);
        assert!(strip_ipv4_header(&[0x60; 28]).is_err());
    }
}
