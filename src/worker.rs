use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use nfq::Queue;

use crate::dispatcher::{Dispatcher, Verdict};
use crate::error::WorkerError;
use crate::nfq_message::NfqMessage;
use crate::rawsend::FrameSender;

const BATCH_LIMIT: usize = 1024;
const IDLE_SLEEP: Duration = Duration::from_micros(100);
const MAX_VERDICT_FAILURES: u32 = 8;
const MAX_RECV_FAILURES: u32 = 64;

pub fn make_queue(queue_num: u16, max_len: u32) -> io::Result<Queue> {
    let mut q = Queue::open()?;
    q.bind(queue_num)?;
    q.set_copy_range(queue_num, 0xFFFF)?;
    q.set_queue_max_len(queue_num, max_len)?;
    // 内核队列满了直接放行，不丢真实流量
    q.set_fail_open(queue_num, true)?;
    q.set_nonblocking(true);
    Ok(q)
}

// ==========================================
// 单个 worker：一个 NFQUEUE，一个线程
// WaitForPacket -> Parse -> UpdateCache -> Inject -> Verdict
// ==========================================
pub struct Worker<S> {
    queue_num: u16,
    max_len: u32,
    dispatcher: Dispatcher<S>,
    running: Arc<AtomicBool>,
}

impl<S: FrameSender + 'static> Worker<S> {
    pub fn new(queue_num: u16, max_len: u32, dispatcher: Dispatcher<S>, running: Arc<AtomicBool>) -> Self {
        Self {
            queue_num,
            max_len,
            dispatcher,
            running,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<Result<(), WorkerError>>> {
        thread::Builder::new()
            .name(format!("nfq-{}", self.queue_num))
            .spawn(move || self.run())
    }

    pub fn run(self) -> Result<(), WorkerError> {
        let queue_num = self.queue_num;
        let mut queue = make_queue(queue_num, self.max_len)
            .map_err(|source| WorkerError::Open { queue: queue_num, source })?;
        info!("queue {queue_num}: waiting for packets");

        let result = self.poll(&mut queue);

        if let Err(e) = queue.unbind(queue_num) {
            debug!("queue {queue_num}: unbind failed: {e}");
        }
        info!("queue {queue_num}: stopped");
        result
    }

    fn poll(&self, queue: &mut Queue) -> Result<(), WorkerError> {
        let queue_num = self.queue_num;
        let mark = self.dispatcher.mark();
        let mut verdict_failures = 0u32;
        let mut recv_failures = 0u32;

        while self.running.load(Ordering::Relaxed) {
            let mut working = false;

            for _ in 0..BATCH_LIMIT {
                let msg = match queue.recv() {
                    Ok(msg) => msg,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                        // netlink 缓冲溢出：内核已按 fail-open 处理这些包
                        warn!("queue {queue_num}: receive buffer overrun, packets bypassed");
                        continue;
                    }
                    Err(source) => {
                        recv_failures += 1;
                        if recv_failures >= MAX_RECV_FAILURES {
                            return Err(WorkerError::Recv { queue: queue_num, source });
                        }
                        warn!("queue {queue_num}: receive failed: {source}");
                        break;
                    }
                };
                recv_failures = 0;
                working = true;

                let msg = NfqMessage::from(msg);
                let verdict = panic::catch_unwind(AssertUnwindSafe(|| self.dispatcher.dispatch(&msg.queued())))
                    .unwrap_or_else(|_| {
                        error!("queue {queue_num}: dispatcher panicked, accepting packet");
                        Verdict::Accept
                    });

                match queue.verdict(msg.into_verdict(verdict, mark)) {
                    Ok(()) => verdict_failures = 0,
                    Err(source) => {
                        verdict_failures += 1;
                        error!("queue {queue_num}: verdict failed ({verdict_failures}): {source}");
                        if verdict_failures >= MAX_VERDICT_FAILURES {
                            return Err(WorkerError::Verdict {
                                queue: queue_num,
                                failures: verdict_failures,
                                source,
                            });
                        }
                    }
                }
            }

            if !working {
                thread::sleep(IDLE_SLEEP);
            }
        }
        Ok(())
    }
}
