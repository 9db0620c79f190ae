use std::net::IpAddr;

use crate::packet::IPPROTO_UDP;

// RFC 1071 反码求和，未取反
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Header checksum for an IPv4 header whose checksum field is zeroed.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    checksum(header)
}

/// UDP checksum over the pseudo-header and the whole UDP segment (checksum
/// field zeroed). A computed zero is sent as 0xffff.
pub fn udp_checksum(src: IpAddr, dst: IpAddr, segment: &[u8]) -> u16 {
    let len = segment.len() as u32;
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum = sum_words(&s.octets(), sum);
            sum = sum_words(&d.octets(), sum);
            sum += IPPROTO_UDP as u32;
            sum += len;
        }
        (s, d) => {
            sum = sum_words(&to_v6(s), sum);
            sum = sum_words(&to_v6(d), sum);
            sum += len >> 16;
            sum += len & 0xFFFF;
            sum += IPPROTO_UDP as u32;
        }
    }
    sum = sum_words(segment, sum);
    match fold(sum) {
        0 => 0xFFFF,
        c => c,
    }
}

fn to_v6(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
        IpAddr::V6(a) => a.octets(),
    }
}
