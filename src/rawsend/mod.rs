use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::error::{PacketError, SendError};
use crate::packet::{DecoySpec, IpFamily, UdpPacket, build_decoy};
use crate::packet_context::{DeliveryContext, Direction};
use crate::payload::PayloadRotation;
use crate::srcinfo::{FlowCache, FlowKey, FlowSide};
use crate::stats::Stats;

mod socket;
mod ttl;

pub use socket::{RawSender, parse_mac};
pub use ttl::{TtlPolicy, estimate_hops};

/// Cache placeholder for links without link-layer addresses.
const NO_HWADDR: [u8; 6] = [0; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Ethernet 网卡，带本机 MAC
    Ethernet([u8; 6]),
    /// tun/ppp 之类，没有二层头
    Raw,
}

/// Transmission seam between frame construction and the wire.
pub trait FrameSender: Send + Sync {
    fn link(&self, ifindex: u32) -> Option<LinkKind>;
    fn send(&self, ifindex: u32, family: IpFamily, dst_mac: Option<[u8; 6]>, frame: &[u8]) -> Result<(), SendError>;
    /// Next-hop MAC the kernel would use for off-link traffic leaving `ifindex`.
    fn neighbour(&self, ifindex: u32, family: IpFamily) -> Option<[u8; 6]>;
}

impl<S: FrameSender + ?Sized> FrameSender for Arc<S> {
    fn link(&self, ifindex: u32) -> Option<LinkKind> {
        (**self).link(ifindex)
    }

    fn send(&self, ifindex: u32, family: IpFamily, dst_mac: Option<[u8; 6]>, frame: &[u8]) -> Result<(), SendError> {
        (**self).send(ifindex, family, dst_mac, frame)
    }

    fn neighbour(&self, ifindex: u32, family: IpFamily) -> Option<[u8; 6]> {
        (**self).neighbour(ifindex, family)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectOutcome {
    pub emitted: usize,
    pub packet_modified: bool,
}

pub struct Injector<S> {
    cache: Arc<FlowCache>,
    payloads: Arc<PayloadRotation>,
    sender: S,
    ttl: TtlPolicy,
    repeat: usize,
    stats: Arc<Stats>,
}

impl<S: FrameSender> Injector<S> {
    pub fn new(
        cache: Arc<FlowCache>,
        payloads: Arc<PayloadRotation>,
        sender: S,
        ttl: TtlPolicy,
        repeat: usize,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            cache,
            payloads,
            sender,
            ttl,
            repeat,
            stats,
        }
    }

    pub fn cache(&self) -> &FlowCache {
        &self.cache
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn handle(&self, ctx: &DeliveryContext, packet: &[u8]) -> Result<InjectOutcome, PacketError> {
        let udp = UdpPacket::parse(packet)?;

        // 远端 = 入站的源 / 出站的目的；诱饵总是 本机 -> 远端
        let (local, local_port, remote, remote_port) = match ctx.direction {
            Direction::Inbound => (udp.dst, udp.dst_port, udp.src, udp.src_port),
            Direction::Outbound => (udp.src, udp.src_port, udp.dst, udp.dst_port),
        };
        let link = self.sender.link(ctx.ifindex);

        // 1. 更新缓存
        match (ctx.direction, ctx.hwaddr, link) {
            (Direction::Inbound, Some(hwaddr), _) => {
                self.cache.put_next_hop(ctx.ifindex, hwaddr);
                self.cache.put(FlowKey::new(remote, remote_port, FlowSide::Source), udp.ttl, hwaddr);
            }
            // tun/ppp 没有二层地址，只记 TTL
            (Direction::Inbound, None, Some(LinkKind::Raw)) => {
                self.cache.put(FlowKey::new(remote, remote_port, FlowSide::Source), udp.ttl, NO_HWADDR);
            }
            (Direction::Outbound, Some(hwaddr), _) => {
                self.cache.put(FlowKey::new(remote, remote_port, FlowSide::Destination), udp.ttl, hwaddr);
            }
            _ => {}
        }

        // 2. 查远端信息。Destination 条目的 TTL 是本机发出的值，不算观测
        let from_peer = self.cache.get(&FlowKey::new(remote, remote_port, FlowSide::Source));
        let learned = from_peer.or_else(|| self.cache.get(&FlowKey::new(remote, remote_port, FlowSide::Destination)));
        match learned {
            Some(_) => Stats::incr(&self.stats.cache_hits),
            None => Stats::incr(&self.stats.cache_misses),
        }

        let Some(link) = link else {
            debug!("ifindex {} unknown, no decoy for {}", ctx.ifindex, fmt_endpoint(remote, remote_port));
            return Ok(self.skipped());
        };

        let l2 = match link {
            LinkKind::Raw => None,
            LinkKind::Ethernet(src_mac) => {
                let dst_mac = learned
                    .map(|e| e.hwaddr)
                    .filter(|mac| *mac != NO_HWADDR)
                    .or(ctx.hwaddr)
                    .or_else(|| self.sender.neighbour(ctx.ifindex, udp.family()))
                    .or_else(|| self.cache.next_hop(ctx.ifindex));
                match dst_mac {
                    Some(dst_mac) => Some((dst_mac, src_mac)),
                    None => {
                        let err = SendError::NoLinkAddress(ctx.ifindex);
                        debug!("{err}, no decoy for {}", fmt_endpoint(remote, remote_port));
                        return Ok(self.skipped());
                    }
                }
            }
        };
        let dst_mac = l2.map(|(dst, _)| dst);

        // 入站包的 TTL 本身就是远端观测值；出站只信远端发来的包
        let observed = match ctx.direction {
            Direction::Inbound => Some(udp.ttl),
            Direction::Outbound => from_peer.map(|e| e.ttl),
        };
        let decoy_ttl = self.ttl.decoy_ttl(observed, udp.ttl);

        // 3. 构造并发送
        let mut emitted = 0;
        for _ in 0..self.repeat {
            let spec = DecoySpec {
                link: l2,
                src: local,
                dst: remote,
                src_port: local_port,
                dst_port: remote_port,
                ttl: decoy_ttl,
                tos: udp.tos,
                dont_fragment: udp.dont_fragment,
                flow_label: udp.flow_label,
                ip_id: rand::random(),
                payload: self.payloads.next(),
            };
            let frame = build_decoy(&spec);

            match self.sender.send(ctx.ifindex, udp.family(), dst_mac, &frame) {
                Ok(()) => {
                    emitted += 1;
                    Stats::incr(&self.stats.decoys_sent);
                }
                Err(e) => {
                    // 诱饵丢了就丢了，不影响原包
                    warn!("decoy to {} failed: {e}", fmt_endpoint(remote, remote_port));
                    Stats::incr(&self.stats.decoys_failed);
                }
            }
        }

        trace!(
            "{:?} {} -> {} ttl={} decoy_ttl={} emitted={}",
            ctx.direction,
            fmt_endpoint(udp.src, udp.src_port),
            fmt_endpoint(udp.dst, udp.dst_port),
            udp.ttl,
            decoy_ttl,
            emitted
        );

        // UDP 原包从不改写
        Ok(InjectOutcome {
            emitted,
            packet_modified: false,
        })
    }
}

impl<S> Injector<S> {
    fn skipped(&self) -> InjectOutcome {
        Stats::incr(&self.stats.decoys_skipped);
        InjectOutcome {
            emitted: 0,
            packet_modified: false,
        }
    }
}

fn fmt_endpoint(addr: IpAddr, port: u16) -> String {
    match addr {
        IpAddr::V4(a) => format!("{a}:{port}"),
        IpAddr::V6(a) => format!("[{a}]:{port}"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::packet::tests::{ipv4_udp, ipv6_udp};
    use crate::packet::{ETH_HLEN, IPV4_HLEN, IPV6_HLEN, checksum, udp_checksum};
    use crate::payload::PayloadSpec;
    use parking_lot::Mutex;
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub const LOCAL_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    pub const GATEWAY_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0xfe];

    #[derive(Debug, Clone)]
    pub struct Sent {
        pub ifindex: u32,
        pub family: IpFamily,
        pub dst_mac: Option<[u8; 6]>,
        pub frame: Vec<u8>,
    }

    pub struct RecordingSender {
        pub link: Option<LinkKind>,
        pub neighbour: Option<[u8; 6]>,
        pub fail: bool,
        pub sent: Mutex<Vec<Sent>>,
    }

    impl RecordingSender {
        pub fn ethernet() -> Self {
            Self {
                link: Some(LinkKind::Ethernet(LOCAL_MAC)),
                neighbour: None,
                fail: false,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl FrameSender for RecordingSender {
        fn link(&self, _ifindex: u32) -> Option<LinkKind> {
            self.link
        }

        fn send(&self, ifindex: u32, family: IpFamily, dst_mac: Option<[u8; 6]>, frame: &[u8]) -> Result<(), SendError> {
            if self.fail {
                return Err(SendError::Io(std::io::Error::from_raw_os_error(libc::ENETDOWN)));
            }
            self.sent.lock().push(Sent {
                ifindex,
                family,
                dst_mac,
                frame: frame.to_vec(),
            });
            Ok(())
        }

        fn neighbour(&self, _ifindex: u32, _family: IpFamily) -> Option<[u8; 6]> {
            self.neighbour
        }
    }

    fn injector(sender: RecordingSender) -> Injector<RecordingSender> {
        injector_with(sender, TtlPolicy::new(6, 2, None).unwrap())
    }

    fn injector_with(sender: RecordingSender, ttl: TtlPolicy) -> Injector<RecordingSender> {
        let payloads = PayloadRotation::new(vec![PayloadSpec::Custom(b"decoy".to_vec())]).unwrap();
        Injector::new(
            Arc::new(FlowCache::new(1024)),
            Arc::new(payloads),
            sender,
            ttl,
            2,
            Arc::new(Stats::default()),
        )
    }

    fn inbound(ifindex: u32, hwaddr: Option<[u8; 6]>) -> DeliveryContext {
        DeliveryContext {
            direction: Direction::Inbound,
            ifindex,
            hwaddr,
        }
    }

    fn sent_ttls(inj: &Injector<RecordingSender>) -> Vec<u8> {
        inj.sender
            .sent
            .lock()
            .iter()
            .map(|s| UdpPacket::parse(&s.frame[ETH_HLEN..]).unwrap().ttl)
            .collect()
    }

    fn outbound(hwaddr: Option<[u8; 6]>) -> DeliveryContext {
        DeliveryContext {
            direction: Direction::Outbound,
            ifindex: 2,
            hwaddr,
        }
    }

    #[test]
    fn outbound_keeps_tuple_and_limits_ttl() {
        let inj = injector(RecordingSender::ethernet());
        let pkt = ipv4_udp([192, 0, 2, 10], [198, 51, 100, 9], 40000, 5060, 64, b"REGISTER");
        let out = inj.handle(&outbound(Some(GATEWAY_MAC)), &pkt).unwrap();
        assert_eq!(out, InjectOutcome { emitted: 2, packet_modified: false });

        let sent = inj.sender.sent.lock();
        assert_eq!(sent.len(), 2);
        for s in sent.iter() {
            assert_eq!(s.ifindex, 2);
            assert_eq!(s.dst_mac, Some(GATEWAY_MAC));
            assert_eq!(&s.frame[0..6], &GATEWAY_MAC);
            assert_eq!(&s.frame[6..12], &LOCAL_MAC);

            let ip = &s.frame[ETH_HLEN..];
            assert_eq!(checksum(&ip[..IPV4_HLEN]), 0);
            let d = UdpPacket::parse(ip).unwrap();
            assert_eq!(d.src, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
            assert_eq!(d.dst, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));
            assert_eq!((d.src_port, d.dst_port), (40000, 5060));
            assert_eq!(d.ttl, 4);
            assert_eq!(&ip[IPV4_HLEN + 8..], b"decoy");
            assert_eq!(udp_checksum(d.src, d.dst, &ip[IPV4_HLEN..]), 0xFFFF);
        }
    }

    #[test]
    fn inbound_learns_and_mirrors() {
        let inj = injector(RecordingSender::ethernet());
        let ctx = DeliveryContext {
            direction: Direction::Inbound,
            ifindex: 3,
            hwaddr: Some(GATEWAY_MAC),
        };
        let pkt = ipv4_udp([198, 51, 100, 9], [192, 0, 2, 10], 5060, 40000, 51, b"200 OK");
        inj.handle(&ctx, &pkt).unwrap();

        let key = FlowKey::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)), 5060, FlowSide::Source);
        let entry = inj.cache().get(&key).unwrap();
        assert_eq!((entry.ttl, entry.hwaddr), (51, GATEWAY_MAC));

        let sent = inj.sender.sent.lock();
        let d = UdpPacket::parse(&sent[0].frame[ETH_HLEN..]).unwrap();
        assert_eq!(d.src, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
        assert_eq!(d.dst, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));
        assert_eq!((d.src_port, d.dst_port), (40000, 5060));
        assert!(d.ttl < 6);
    }

    #[test]
    fn outbound_uses_learned_mac() {
        let inj = injector(RecordingSender::ethernet());
        let learned = [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        inj.cache().put(
            FlowKey::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)), 5060, FlowSide::Source),
            60,
            learned,
        );
        let pkt = ipv4_udp([192, 0, 2, 10], [198, 51, 100, 9], 40000, 5060, 64, b"x");
        inj.handle(&outbound(None), &pkt).unwrap();
        let sent = inj.sender.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].dst_mac, Some(learned));
        assert_eq!(inj.stats().snapshot().cache_hits, 1);
    }

    #[test]
    fn ethernet_without_any_mac_skips() {
        let inj = injector(RecordingSender::ethernet());
        let pkt = ipv4_udp([192, 0, 2, 10], [198, 51, 100, 9], 40000, 5060, 64, b"x");
        let out = inj.handle(&outbound(None), &pkt).unwrap();
        assert_eq!(out.emitted, 0);
        assert!(inj.sender.sent.lock().is_empty());
        assert_eq!(inj.stats().snapshot().decoys_skipped, 1);
    }

    #[test]
    fn first_outbound_packet_resolves_neighbour() {
        let mut sender = RecordingSender::ethernet();
        sender.neighbour = Some(GATEWAY_MAC);
        let inj = injector(sender);
        let pkt = ipv4_udp([203, 0, 113, 5], [198, 51, 100, 9], 5060, 5060, 64, b"x");
        let out = inj.handle(&outbound(None), &pkt).unwrap();
        assert_eq!(out.emitted, 2);

        let sent = inj.sender.sent.lock();
        assert_eq!(sent[0].dst_mac, Some(GATEWAY_MAC));
        assert_eq!(&sent[0].frame[0..6], &GATEWAY_MAC);
        assert_eq!(inj.stats().snapshot().decoys_skipped, 0);
    }

    #[test]
    fn outbound_falls_back_to_last_inbound_next_hop() {
        let inj = injector(RecordingSender::ethernet());
        let other = ipv4_udp([192, 0, 2, 77], [192, 0, 2, 10], 53, 33000, 60, b"y");
        inj.handle(&inbound(2, Some(GATEWAY_MAC)), &other).unwrap();
        inj.sender.sent.lock().clear();

        let pkt = ipv4_udp([192, 0, 2, 10], [198, 51, 100, 9], 40000, 5060, 64, b"x");
        let out = inj.handle(&outbound(None), &pkt).unwrap();
        assert_eq!(out.emitted, 2);
        assert_eq!(inj.sender.sent.lock()[0].dst_mac, Some(GATEWAY_MAC));
    }

    #[test]
    fn next_hop_is_per_interface() {
        let inj = injector(RecordingSender::ethernet());
        let other = ipv4_udp([192, 0, 2, 77], [192, 0, 2, 10], 53, 33000, 60, b"y");
        inj.handle(&inbound(5, Some(GATEWAY_MAC)), &other).unwrap();
        inj.sender.sent.lock().clear();

        let pkt = ipv4_udp([192, 0, 2, 10], [198, 51, 100, 9], 40000, 5060, 64, b"x");
        assert_eq!(inj.handle(&outbound(None), &pkt).unwrap().emitted, 0);
    }

    #[test]
    fn outbound_own_ttl_is_not_an_observation() {
        let inj = injector_with(RecordingSender::ethernet(), TtlPolicy::new(10, 2, Some(50)).unwrap());
        let pkt = ipv4_udp([192, 0, 2, 10], [198, 51, 100, 9], 40000, 5060, 64, b"x");
        inj.handle(&outbound(Some(GATEWAY_MAC)), &pkt).unwrap();
        inj.handle(&outbound(Some(GATEWAY_MAC)), &pkt).unwrap();
        assert_eq!(sent_ttls(&inj), vec![8; 4]);
    }

    #[test]
    fn outbound_uses_ttl_seen_from_peer() {
        let inj = injector_with(RecordingSender::ethernet(), TtlPolicy::new(10, 2, Some(50)).unwrap());
        // 64 - 58 = 6 跳，50% -> 3
        let reply = ipv4_udp([198, 51, 100, 9], [192, 0, 2, 10], 5060, 40000, 58, b"200 OK");
        inj.handle(&inbound(2, Some(GATEWAY_MAC)), &reply).unwrap();
        inj.sender.sent.lock().clear();

        let pkt = ipv4_udp([192, 0, 2, 10], [198, 51, 100, 9], 40000, 5060, 64, b"x");
        inj.handle(&outbound(None), &pkt).unwrap();
        assert_eq!(sent_ttls(&inj), vec![3, 3]);
    }

    #[test]
    fn raw_link_learns_ttl_without_mac() {
        let mut sender = RecordingSender::ethernet();
        sender.link = Some(LinkKind::Raw);
        let inj = injector(sender);
        let reply = ipv4_udp([198, 51, 100, 9], [10, 8, 0, 2], 5060, 40000, 120, b"200 OK");
        inj.handle(&inbound(9, None), &reply).unwrap();

        let key = FlowKey::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)), 5060, FlowSide::Source);
        assert_eq!(inj.cache().get(&key), Some(crate::srcinfo::SourceInfoEntry { ttl: 120, hwaddr: NO_HWADDR }));
        assert_eq!(inj.cache().next_hop(9), None);
        assert!(inj.sender.sent.lock().iter().all(|s| s.dst_mac.is_none()));
    }

    #[test]
    fn raw_link_sends_bare_ipv6() {
        let mut sender = RecordingSender::ethernet();
        sender.link = Some(LinkKind::Raw);
        let inj = injector(sender);
        let src: Ipv6Addr = "2001:db8::10".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8:1::9".parse().unwrap();
        let pkt = ipv6_udp(src, dst, 40000, 5060, 64, b"INVITE");
        let out = inj.handle(&outbound(None), &pkt).unwrap();
        assert_eq!(out.emitted, 2);

        let sent = inj.sender.sent.lock();
        assert_eq!(sent[0].family, IpFamily::V6);
        let d = UdpPacket::parse(&sent[0].frame).unwrap();
        assert_eq!(d.src, IpAddr::V6(src));
        assert_eq!(d.dst, IpAddr::V6(dst));
        assert_eq!(d.flow_label, 0xabcde);
        assert_eq!(d.ttl, 4);
        assert_eq!(udp_checksum(d.src, d.dst, &sent[0].frame[IPV6_HLEN..]), 0xFFFF);
    }

    #[test]
    fn send_failure_is_not_an_error() {
        let mut sender = RecordingSender::ethernet();
        sender.fail = true;
        let inj = injector(sender);
        let pkt = ipv4_udp([192, 0, 2, 10], [198, 51, 100, 9], 40000, 5060, 64, b"x");
        let out = inj.handle(&outbound(Some(GATEWAY_MAC)), &pkt).unwrap();
        assert_eq!(out.emitted, 0);
        assert!(!out.packet_modified);
        assert_eq!(inj.stats().snapshot().decoys_failed, 2);
    }

    #[test]
    fn malformed_is_a_parse_error() {
        let inj = injector(RecordingSender::ethernet());
        assert!(inj.handle(&outbound(Some(GATEWAY_MAC)), &[0x45, 0x00]).is_err());
        assert!(inj.sender.sent.lock().is_empty());
    }
}
