use std::sync::Arc;

use log::debug;

use crate::packet_context::QueuedPacket;
use crate::rawsend::{FrameSender, Injector};
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwMark {
    pub mark: u32,
    pub mask: u32,
}

impl FwMark {
    pub fn matches(&self, nfmark: u32) -> bool {
        nfmark & self.mask == self.mark
    }

    /// 保留 mask 以外的位，打上自己的标记
    pub fn apply(&self, nfmark: u32) -> u32 {
        (nfmark & !self.mask) | self.mark
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    AcceptModified(Vec<u8>),
    Drop,
}

/// Turns one queued packet into exactly one verdict.
pub struct Dispatcher<S> {
    injector: Arc<Injector<S>>,
    mark: FwMark,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            injector: Arc::clone(&self.injector),
            mark: self.mark,
        }
    }
}

impl<S: FrameSender> Dispatcher<S> {
    pub fn new(injector: Arc<Injector<S>>, mark: FwMark) -> Self {
        Self { injector, mark }
    }

    pub fn mark(&self) -> FwMark {
        self.mark
    }

    pub fn injector(&self) -> &Injector<S> {
        &self.injector
    }

    pub fn dispatch(&self, pkt: &QueuedPacket<'_>) -> Verdict {
        let stats = self.injector.stats();
        Stats::incr(&stats.packets);

        // 规则本该挡住已打标记的包，这里再兜一次
        if self.mark.matches(pkt.nfmark) {
            Stats::incr(&stats.marked);
            return Verdict::Accept;
        }

        match self.injector.handle(&pkt.ctx, pkt.payload) {
            Ok(out) if out.packet_modified => Verdict::AcceptModified(pkt.payload.to_vec()),
            Ok(_) => Verdict::Accept,
            // fail open：任何错误都原样放行
            Err(e) => {
                Stats::incr(&stats.parse_errors);
                debug!("pass through unparsed packet ({} bytes): {e}", pkt.payload.len());
                Verdict::Accept
            }
        }
    }
}
