#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// PREROUTING：从远端收到
    Inbound,
    /// POSTROUTING：发往远端
    Outbound,
}

/// Link-layer delivery metadata of a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryContext {
    pub direction: Direction,
    /// 入站是收包网卡，出站是发包网卡
    pub ifindex: u32,
    /// 对端（下一跳）MAC；入站时是帧的源 MAC，出站时内核一般不给
    pub hwaddr: Option<[u8; 6]>,
}

impl DeliveryContext {
    /// From the NFQUEUE attributes: a non-zero indev means the packet was
    /// caught on the way in.
    pub fn from_devices(indev: u32, outdev: u32, hwaddr: Option<&[u8]>) -> Self {
        let (direction, ifindex) = if indev != 0 {
            (Direction::Inbound, indev)
        } else {
            (Direction::Outbound, outdev)
        };
        let hwaddr = hwaddr.and_then(|a| <[u8; 6]>::try_from(a.get(..6)?).ok());
        Self {
            direction,
            ifindex,
            hwaddr,
        }
    }
}

#[derive(Debug)]
pub struct QueuedPacket<'a> {
    pub ctx: DeliveryContext,
    pub nfmark: u32,
    pub payload: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_when_indev_present() {
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0, 0];
        let ctx = DeliveryContext::from_devices(3, 0, Some(&mac));
        assert_eq!(ctx.direction, Direction::Inbound);
        assert_eq!(ctx.ifindex, 3);
        assert_eq!(ctx.hwaddr, Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
    }

    #[test]
    fn outbound_without_hwaddr() {
        let ctx = DeliveryContext::from_devices(0, 7, None);
        assert_eq!(ctx.direction, Direction::Outbound);
        assert_eq!(ctx.ifindex, 7);
        assert_eq!(ctx.hwaddr, None);
    }

    #[test]
    fn short_hwaddr_is_ignored() {
        let ctx = DeliveryContext::from_devices(2, 0, Some(&[1, 2, 3]));
        assert_eq!(ctx.hwaddr, None);
    }
}
