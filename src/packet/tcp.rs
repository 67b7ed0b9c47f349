//! TCP SYN segment construction for half-open path probing.

use std::net::IpAddr;

use crate::error::TraceError;
use crate::packet::checksum;

pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_SYN_ACK: u8 = 0x12;

pub const TCP_HEADER_LEN: usize = 20;
const TCP_PROTO: u8 = 6;

/// A minimal 20-byte SYN: no options, window 0xFFFF.
#[derive(Debug, Clone, Copy)]
pub struct SynSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence: u32,
}

impl SynSegment {
    pub fn new(src_port: u16, dst_port: u16, sequence: u32) -> Self {
        Self {
            src_port,
            dst_port,
            sequence,
        }
    }

    /// Serialize with the checksum computed over pseudo-header || segment.
    pub fn marshal(&self, src: IpAddr, dst: IpAddr) -> Result<[u8; TCP_HEADER_LEN], TraceError> {
        let mut buf = [0u8; TCP_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        // Data offset 5 words, SYN flag, max window.
        buf[12] = 5 << 4;
        buf[13] = FLAG_SYN;
        buf[14..16].copy_from_slice(&0xffffu16.to_be_bytes());

        let sum = match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let pseudo = checksum::pseudo_header_v4(s, d, TCP_PROTO, TCP_HEADER_LEN as u16);
                checksum::transport_checksum(&pseudo, &buf)
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                let pseudo = checksum::pseudo_header_v6(s, d, TCP_PROTO, TCP_HEADER_LEN as u32);
                checksum::transport_checksum(&pseudo, &buf)
            }
            _ => return Err(TraceError::InvalidPacket("mixed address families")),
        };
        buf[16..18].copy_from_slice(&sum.to_be_bytes());
        Ok(buf)
    }
}

/// The header fields of an inbound TCP segment that probe matching needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
}

impl TcpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, TraceError> {
        if buf.len() < TCP_HEADER_LEN {
            return Err(TraceError::InvalidPacket("tcp header truncated"));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            flags: buf[13],
        })
    }

    /// SYN+ACK or RST both prove the destination host answered.
    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_SYN_ACK == FLAG_SYN_ACK || self.flags & FLAG_RST == FLAG_RST
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_syn_layout_and_checksum() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let dst = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 80));
        let syn = SynSegment::new(40001, 80, 0x01020304);
        let wire = syn.marshal(src, dst).unwrap();

        assert_eq!(u16::from_be_bytes([wire[0], wire[1]]), 40001);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 80);
        assert_eq!(wire[12] >> 4, 5);
        assert_eq!(wire[13], FLAG_SYN);
        assert_eq!(u16::from_be_bytes([wire[14], wire[15]]), 0xffff);

        // The checksum verifies against the pseudo-header.
        let pseudo = checksum::pseudo_header_v4(
            "10.0.0.2".parse().unwrap(),
            "192.0.2.80".parse().unwrap(),
            6,
            TCP_HEADER_LEN as u16,
        );
        let mut full = pseudo.to_vec();
        full.extend_from_slice(&wire);
        assert!(checksum::validate(&full));
    }

    #[test]
    fn test_syn_v6_checksum() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let wire = SynSegment::new(50000, 443, 1)
            .marshal(src.into(), dst.into())
            .unwrap();
        let pseudo = checksum::pseudo_header_v6(src, dst, 6, TCP_HEADER_LEN as u32);
        let mut full = pseudo.to_vec();
        full.extend_from_slice(&wire);
        assert!(checksum::validate(&full));
    }

    #[test]
    fn test_mixed_families_rejected() {
        let src = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let dst = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(SynSegment::new(1, 2, 3).marshal(src, dst).is_err());
    }

    #[test]
    fn test_header_parse_and_reply_flags() {
        let mut buf = [0u8; TCP_HEADER_LEN];
        buf[0..2].copy_from_slice(&80u16.to_be_bytes());
        buf[2..4].copy_from_slice(&40001u16.to_be_bytes());
        buf[13] = FLAG_SYN_ACK;
        let header = TcpHeader::parse(&buf).unwrap();
        assert_eq!(header.src_port, 80);
        assert_eq!(header.dst_port, 40001);
        assert!(header.is_reply());

        buf[13] = FLAG_RST;
        assert!(TcpHeader::parse(&buf).unwrap().is_reply());

        buf[13] = FLAG_SYN;
        assert!(!TcpHeader::parse(&buf).unwrap().is_reply());

        assert!(TcpHeader::parse(&buf[..10]).is_err());
    }
}
