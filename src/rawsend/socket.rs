use std::collections::HashMap;
use std::ffi::CStr;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use log::debug;
use parking_lot::RwLock;

use crate::error::SendError;
use crate::packet::IpFamily;
use crate::rawsend::{FrameSender, LinkKind};

const ARPHRD_ETHER: u32 = 1;
const ATF_COM: u32 = 0x02;

// ==========================================
// AF_PACKET 发包：每个地址族一个 socket
// ==========================================
pub struct RawSender {
    v4: OwnedFd,
    v6: OwnedFd,
    links: RwLock<HashMap<u32, LinkKind>>,
    gateways: RwLock<HashMap<u32, [u8; 6]>>,
}

impl RawSender {
    pub fn open(fwmark: u32, send_timeout: Duration) -> io::Result<Self> {
        let v4 = open_packet_socket(fwmark, send_timeout)?;
        let v6 = open_packet_socket(fwmark, send_timeout)?;
        Ok(Self {
            v4,
            v6,
            links: RwLock::new(HashMap::new()),
            gateways: RwLock::new(HashMap::new()),
        })
    }

    fn lookup_link(ifindex: u32) -> Option<LinkKind> {
        let name = ifindex_to_name(ifindex)?;
        let base = format!("/sys/class/net/{name}");

        let hatype = std::fs::read_to_string(format!("{base}/type")).ok()?;
        if hatype.trim().parse::<u32>().ok()? != ARPHRD_ETHER {
            return Some(LinkKind::Raw);
        }

        let mac = std::fs::read_to_string(format!("{base}/address")).ok()?;
        parse_mac(mac.trim()).map(LinkKind::Ethernet)
    }

    // 默认路由网关的 ARP 条目；IPv6 邻居表 procfs 里没有
    fn lookup_gateway(ifindex: u32) -> Option<[u8; 6]> {
        let name = ifindex_to_name(ifindex)?;
        let routes = std::fs::read_to_string("/proc/net/route").ok()?;
        let gateway = default_gateway(&routes, &name)?;
        let arp = std::fs::read_to_string("/proc/net/arp").ok()?;
        arp_lookup(&arp, gateway, &name)
    }
}

impl FrameSender for RawSender {
    fn link(&self, ifindex: u32) -> Option<LinkKind> {
        if let Some(kind) = self.links.read().get(&ifindex) {
            return Some(*kind);
        }
        let kind = Self::lookup_link(ifindex)?;
        debug!("ifindex {ifindex}: {kind:?}");
        self.links.write().insert(ifindex, kind);
        Some(kind)
    }

    fn send(&self, ifindex: u32, family: IpFamily, dst_mac: Option<[u8; 6]>, frame: &[u8]) -> Result<(), SendError> {
        let fd = match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        };

        // SAFETY: sockaddr_ll 是纯数据结构，全零合法
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = family.ethertype().to_be();
        sll.sll_ifindex = ifindex as i32;
        if let Some(mac) = dst_mac {
            sll.sll_halen = 6;
            sll.sll_addr[..6].copy_from_slice(&mac);
        }

        let ret = unsafe {
            libc::sendto(
                fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::ENXIO) | Some(libc::ENODEV)) {
                // 网卡没了或换了，下次重新查
                self.links.write().remove(&ifindex);
                self.gateways.write().remove(&ifindex);
            }
            return Err(err.into());
        }
        if ret as usize != frame.len() {
            return Err(SendError::ShortWrite {
                sent: ret as usize,
                len: frame.len(),
            });
        }
        Ok(())
    }

    fn neighbour(&self, ifindex: u32, family: IpFamily) -> Option<[u8; 6]> {
        if family == IpFamily::V6 {
            return None;
        }
        if let Some(mac) = self.gateways.read().get(&ifindex) {
            return Some(*mac);
        }
        let mac = Self::lookup_gateway(ifindex)?;
        debug!("ifindex {ifindex}: default gateway at {mac:02x?}");
        self.gateways.write().insert(ifindex, mac);
        Some(mac)
    }
}

/// Gateway of the default route through `ifname`, from `/proc/net/route`.
fn default_gateway(routes: &str, ifname: &str) -> Option<Ipv4Addr> {
    routes.lines().skip(1).find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let [iface, dest, gateway, _flags, _refcnt, _use, _metric, mask, ..] = cols.as_slice() else {
            return None;
        };
        if *iface != ifname || *dest != "00000000" || *mask != "00000000" {
            return None;
        }
        // 内核按主机字节序打印网络序的地址
        let raw = u32::from_str_radix(gateway, 16).ok()?;
        let addr = Ipv4Addr::from(raw.to_ne_bytes());
        (!addr.is_unspecified()).then_some(addr)
    })
}

/// Completed ARP entry for `ip` on `ifname`, from `/proc/net/arp`.
fn arp_lookup(arp: &str, ip: Ipv4Addr, ifname: &str) -> Option<[u8; 6]> {
    let ip = ip.to_string();
    arp.lines().skip(1).find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let [addr, _hwtype, flags, mac, _mask, device] = cols.as_slice() else {
            return None;
        };
        let flags = u32::from_str_radix(flags.trim_start_matches("0x"), 16).ok()?;
        if *addr != ip || *device != ifname || flags & ATF_COM == 0 {
            return None;
        }
        parse_mac(mac).filter(|m| *m != [0; 6])
    })
}

fn open_packet_socket(fwmark: u32, send_timeout: Duration) -> io::Result<OwnedFd> {
    // 协议号填 0：只发不收
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd 刚创建且归我们所有
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    set_opt(&fd, libc::SO_MARK, &fwmark)?;

    let tv = libc::timeval {
        tv_sec: send_timeout.as_secs() as libc::time_t,
        tv_usec: send_timeout.subsec_micros() as libc::suseconds_t,
    };
    set_opt(&fd, libc::SO_SNDTIMEO, &tv)?;

    Ok(fd)
}

fn set_opt<T>(fd: &OwnedFd, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ifindex_to_name(ifindex: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ptr = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: if_indextoname 成功时写入了以 NUL 结尾的名字
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    name.to_str().ok().map(str::to_owned)
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}
