use std::net::IpAddr;

use crate::packet::{
    ETH_HLEN, IPPROTO_UDP, IPV4_HLEN, IPV6_HLEN, IpFamily, UDP_HLEN, ipv4_header_checksum,
    udp_checksum,
};

/// Everything needed to lay out one decoy frame.
#[derive(Debug, Clone)]
pub struct DecoySpec<'a> {
    /// (destination, source) MAC. `None` on interfaces without an Ethernet header.
    pub link: Option<([u8; 6], [u8; 6])>,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ttl: u8,
    pub tos: u8,
    pub dont_fragment: bool,
    pub flow_label: u32,
    pub ip_id: u16,
    pub payload: &'a [u8],
}

impl DecoySpec<'_> {
    pub fn family(&self) -> IpFamily {
        match self.src {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

pub fn build_decoy(spec: &DecoySpec<'_>) -> Vec<u8> {
    let family = spec.family();
    let ip_hlen = match family {
        IpFamily::V4 => IPV4_HLEN,
        IpFamily::V6 => IPV6_HLEN,
    };
    let l2 = if spec.link.is_some() { ETH_HLEN } else { 0 };
    let udp_len = UDP_HLEN + spec.payload.len();

    let mut frame = vec![0u8; l2 + ip_hlen + udp_len];

    // 1. Ethernet 头
    if let Some((dst_mac, src_mac)) = spec.link {
        frame[0..6].copy_from_slice(&dst_mac);
        frame[6..12].copy_from_slice(&src_mac);
        frame[12..14].copy_from_slice(&family.ethertype().to_be_bytes());
    }

    // 2. UDP 头 + payload，先写好再算 IP 校验
    let udp_off = l2 + ip_hlen;
    {
        let seg = &mut frame[udp_off..];
        seg[0..2].copy_from_slice(&spec.src_port.to_be_bytes());
        seg[2..4].copy_from_slice(&spec.dst_port.to_be_bytes());
        seg[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        seg[UDP_HLEN..].copy_from_slice(spec.payload);
    }
    let udp_csum = udp_checksum(spec.src, spec.dst, &frame[udp_off..]);
    frame[udp_off + 6..udp_off + 8].copy_from_slice(&udp_csum.to_be_bytes());

    // 3. IP 头
    let ip = &mut frame[l2..udp_off];
    match (spec.src, spec.dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let total_len = (IPV4_HLEN + udp_len) as u16;
            ip[0] = 0x45;
            ip[1] = spec.tos;
            ip[2..4].copy_from_slice(&total_len.to_be_bytes());
            ip[4..6].copy_from_slice(&spec.ip_id.to_be_bytes());
            ip[6] = if spec.dont_fragment { 0x40 } else { 0x00 };
            ip[8] = spec.ttl;
            ip[9] = IPPROTO_UDP;
            ip[12..16].copy_from_slice(&src.octets());
            ip[16..20].copy_from_slice(&dst.octets());
            let csum = ipv4_header_checksum(ip);
            ip[10..12].copy_from_slice(&csum.to_be_bytes());
        }
        (src, dst) => {
            let word = (6u32 << 28) | ((spec.tos as u32) << 20) | (spec.flow_label & 0x000F_FFFF);
            ip[0..4].copy_from_slice(&word.to_be_bytes());
            ip[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            ip[6] = IPPROTO_UDP;
            ip[7] = spec.ttl;
            ip[8..24].copy_from_slice(&v6_octets(src));
            ip[24..40].copy_from_slice(&v6_octets(dst));
        }
    }

    frame
}

fn v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
        IpAddr::V6(a) => a.octets(),
    }
}
