use nfq::Message;

use crate::dispatcher::{FwMark, Verdict};
use crate::packet_context::{DeliveryContext, QueuedPacket};

pub struct NfqMessage(Message);

impl NfqMessage {
    pub fn queued(&self) -> QueuedPacket<'_> {
        QueuedPacket {
            ctx: DeliveryContext::from_devices(
                self.0.get_indev(),
                self.0.get_outdev(),
                self.0.get_hw_addr(),
            ),
            nfmark: self.0.get_nfmark(),
            payload: self.0.get_payload(),
        }
    }

    /// 把判决写回消息，放行的包打上排除标记
    pub fn into_verdict(mut self, verdict: Verdict, mark: FwMark) -> Message {
        match verdict {
            Verdict::Accept => {
                let nfmark = mark.apply(self.0.get_nfmark());
                self.0.set_nfmark(nfmark);
                self.0.set_verdict(nfq::Verdict::Accept);
            }
            Verdict::AcceptModified(payload) => {
                let nfmark = mark.apply(self.0.get_nfmark());
                self.0.set_nfmark(nfmark);
                self.0.set_payload(payload);
                self.0.set_verdict(nfq::Verdict::Accept);
            }
            Verdict::Drop => self.0.set_verdict(nfq::Verdict::Drop),
        }
        self.0
    }
}

impl From<Message> for NfqMessage {
    fn from(value: Message) -> Self {
        Self(value)
    }
}
