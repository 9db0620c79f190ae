// packet/mod.rs
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::PacketError;

mod builder;
mod checksum;

pub use builder::{DecoySpec, build_decoy};
pub use checksum::{checksum, ipv4_header_checksum, udp_checksum};

pub const ETH_HLEN: usize = 14;
pub const IPV4_HLEN: usize = 20;
pub const IPV6_HLEN: usize = 40;
pub const UDP_HLEN: usize = 8;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86dd;
pub const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn ethertype(self) -> u16 {
        match self {
            IpFamily::V4 => ETH_P_IP,
            IpFamily::V6 => ETH_P_IPV6,
        }
    }
}

/// Header fields of a queued UDP datagram, copied out of the kernel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// TTL for IPv4, hop limit for IPv6.
    pub ttl: u8,
    /// IPv4 TOS or IPv6 traffic class.
    pub tos: u8,
    /// IPv4 only.
    pub dont_fragment: bool,
    /// IPv6 only.
    pub flow_label: u32,
    pub payload_len: usize,
}

impl UdpPacket {
    pub fn family(&self) -> IpFamily {
        match self.src {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Parses a raw IP datagram as delivered by NFQUEUE (no link-layer header).
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let first = *data.first().ok_or(PacketError::Truncated { need: 1, have: 0 })?;
        match first >> 4 {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            v => Err(PacketError::UnsupportedVersion(v)),
        }
    }

    fn parse_v4(data: &[u8]) -> Result<Self, PacketError> {
        need(data, IPV4_HLEN)?;

        // IHL 单位是 32-bit word
        let ihl = (data[0] & 0x0F) as usize * 4;
        if ihl < IPV4_HLEN {
            return Err(PacketError::BadHeaderLength(ihl));
        }
        need(data, ihl)?;

        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < ihl {
            return Err(PacketError::BadHeaderLength(total_len));
        }
        need(data, total_len)?;

        let flags_frag = u16::from_be_bytes([data[6], data[7]]);
        let more_fragments = flags_frag & 0x2000 != 0;
        let frag_offset = flags_frag & 0x1FFF;
        if more_fragments || frag_offset != 0 {
            return Err(PacketError::Fragmented);
        }

        if data[9] != IPPROTO_UDP {
            return Err(PacketError::NotUdp(data[9]));
        }

        let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

        let (src_port, dst_port, payload_len) = parse_udp(&data[ihl..total_len])?;

        Ok(Self {
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            src_port,
            dst_port,
            ttl: data[8],
            tos: data[1],
            dont_fragment: flags_frag & 0x4000 != 0,
            flow_label: 0,
            payload_len,
        })
    }

    fn parse_v6(data: &[u8]) -> Result<Self, PacketError> {
        need(data, IPV6_HLEN)?;

        let word = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        need(data, IPV6_HLEN + payload_len)?;

        // Extension headers are not walked; the rules only queue plain UDP.
        if data[6] != IPPROTO_UDP {
            return Err(PacketError::NotUdp(data[6]));
        }

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);

        let (src_port, dst_port, udp_payload_len) =
            parse_udp(&data[IPV6_HLEN..IPV6_HLEN + payload_len])?;

        Ok(Self {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            src_port,
            dst_port,
            ttl: data[7],
            tos: ((word >> 20) & 0xFF) as u8,
            dont_fragment: false,
            flow_label: word & 0x000F_FFFF,
            payload_len: udp_payload_len,
        })
    }
}

fn need(data: &[u8], len: usize) -> Result<(), PacketError> {
    if data.len() < len {
        return Err(PacketError::Truncated {
            need: len,
            have: data.len(),
        });
    }
    Ok(())
}

fn parse_udp(segment: &[u8]) -> Result<(u16, u16, usize), PacketError> {
    need(segment, UDP_HLEN)?;
    let src_port = u16::from_be_bytes([segment[0], segment[1]]);
    let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
    let udp_len = u16::from_be_bytes([segment[4], segment[5]]) as usize;
    if udp_len < UDP_HLEN || udp_len > segment.len() {
        return Err(PacketError::BadUdpLength {
            udp_len,
            ip_payload: segment.len(),
        });
    }
    Ok((src_port, dst_port, udp_len - UDP_HLEN))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn ipv4_udp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, ttl: u8, body: &[u8]) -> Vec<u8> {
        let udp_len = UDP_HLEN + body.len();
        let total = IPV4_HLEN + udp_len;
        let mut p = vec![0u8; total];
        p[0] = 0x45;
        p[1] = 0x10;
        p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        p[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        p[6] = 0x40;
        p[8] = ttl;
        p[9] = IPPROTO_UDP;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        let csum = ipv4_header_checksum(&p[..IPV4_HLEN]);
        p[10..12].copy_from_slice(&csum.to_be_bytes());
        p[20..22].copy_from_slice(&sport.to_be_bytes());
        p[22..24].copy_from_slice(&dport.to_be_bytes());
        p[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
        p[28..].copy_from_slice(body);
        p
    }

    pub fn ipv6_udp(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16, hlim: u8, body: &[u8]) -> Vec<u8> {
        let udp_len = UDP_HLEN + body.len();
        let mut p = vec![0u8; IPV6_HLEN + udp_len];
        p[0] = 0x62;
        p[1] = 0xea;
        p[2] = 0xbc;
        p[3] = 0xde;
        p[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        p[6] = IPPROTO_UDP;
        p[7] = hlim;
        p[8..24].copy_from_slice(&src.octets());
        p[24..40].copy_from_slice(&dst.octets());
        p[40..42].copy_from_slice(&sport.to_be_bytes());
        p[42..44].copy_from_slice(&dport.to_be_bytes());
        p[44..46].copy_from_slice(&(udp_len as u16).to_be_bytes());
        p[48..].copy_from_slice(body);
        p
    }

    #[test]
    fn parses_ipv4_udp() {
        let pkt = ipv4_udp([203, 0, 113, 5], [198, 51, 100, 9], 5060, 5061, 64, b"hello");
        let udp = UdpPacket::parse(&pkt).unwrap();
        assert_eq!(udp.src, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)));
        assert_eq!(udp.dst, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));
        assert_eq!(udp.src_port, 5060);
        assert_eq!(udp.dst_port, 5061);
        assert_eq!(udp.ttl, 64);
        assert_eq!(udp.tos, 0x10);
        assert!(udp.dont_fragment);
        assert_eq!(udp.payload_len, 5);
        assert_eq!(udp.family(), IpFamily::V4);
    }

    #[test]
    fn parses_ipv6_udp() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let pkt = ipv6_udp(src, dst, 40000, 5060, 57, b"abc");
        let udp = UdpPacket::parse(&pkt).unwrap();
        assert_eq!(udp.src, IpAddr::V6(src));
        assert_eq!(udp.dst, IpAddr::V6(dst));
        assert_eq!(udp.ttl, 57);
        assert_eq!(udp.tos, 0x2e);
        assert_eq!(udp.flow_label, 0xabcde);
        assert_eq!(udp.payload_len, 3);
    }

    #[test]
    fn rejects_garbage() {
        assert!(UdpPacket::parse(&[]).is_err());
        assert_eq!(
            UdpPacket::parse(&[0x45, 0, 0]),
            Err(PacketError::Truncated { need: 20, have: 3 })
        );
        assert_eq!(UdpPacket::parse(&[0x25; 64]), Err(PacketError::UnsupportedVersion(2)));

        let mut pkt = ipv4_udp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 64, b"x");
        pkt[0] = 0x44;
        assert_eq!(UdpPacket::parse(&pkt), Err(PacketError::BadHeaderLength(16)));
    }

    #[test]
    fn rejects_truncated_total_length() {
        let pkt = ipv4_udp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 64, b"payload");
        assert!(matches!(
            UdpPacket::parse(&pkt[..pkt.len() - 2]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_non_udp_and_fragments() {
        let mut pkt = ipv4_udp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 64, b"x");
        pkt[9] = 6;
        assert_eq!(UdpPacket::parse(&pkt), Err(PacketError::NotUdp(6)));

        let mut pkt = ipv4_udp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 64, b"x");
        pkt[6] = 0x20;
        assert_eq!(UdpPacket::parse(&pkt), Err(PacketError::Fragmented));
    }

    #[test]
    fn rejects_bad_udp_length() {
        let mut pkt = ipv4_udp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, 64, b"xy");
        pkt[24..26].copy_from_slice(&200u16.to_be_bytes());
        assert!(matches!(UdpPacket::parse(&pkt), Err(PacketError::BadUdpLength { .. })));
    }
}
