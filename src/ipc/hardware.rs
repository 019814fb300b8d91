use crate::addr::PhysAddr;
use crate::ipc::fifo::IpcFifo;
use crate::ipc::request::IpcKernelRequest;
use crate::ipc::types::IosError;
use std::time::Instant;

/// Capacity of a core's reply queue.
pub const REPLY_QUEUE_SIZE: usize = 32;

/// The microkernel side of the IPC hardware.
///
/// Receives submitted requests. Replies come back asynchronously through the
/// submitting core's [`InterruptLine`].
pub trait IosHardware: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the request was refused. No reply follows for a
    /// refused request.
    fn submit(&self, core: usize, address: PhysAddr, request: &IpcKernelRequest) -> crate::Result<()>;
}

/// A reply travelling from the microkernel to a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcReply {
    /// The request being replied to.
    pub request: PhysAddr,
    pub reply: IosError,
}

/// The per-core reply queue plus the interrupt that announces new replies.
///
/// There is a single producer (the microkernel) and a single consumer (the
/// core's interrupt handler).
#[derive(Debug, Default)]
pub struct InterruptLine {
    replies: spin::Mutex<IpcFifo<IpcReply, REPLY_QUEUE_SIZE>>,
    waiting: parking_lot::Mutex<()>,
    raised: parking_lot::Condvar,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply and raises the interrupt.
    ///
    /// # Panics
    ///
    /// If the queue is full, which means the microkernel produced more
    /// replies than there can be outstanding requests.
    pub fn post_reply(&self, reply: IpcReply) {
        let pushed = self.replies.lock().push(reply);
        assert!(
            pushed.is_ok(),
            "reply queue overflow while posting {:?}",
            reply
        );

        let _guard = self.waiting.lock();
        self.raised.notify_all();
    }

    /// Pops the oldest pending reply.
    pub fn take_reply(&self) -> Option<IpcReply> {
        self.replies.lock().pop().ok()
    }

    pub fn pending(&self) -> usize {
        self.replies.lock().len()
    }

    /// Blocks until a reply is pending or `deadline` passes.
    ///
    /// Returns whether a reply is pending.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.waiting.lock();
        loop {
            if self.pending() > 0 {
                return true;
            }
            if self.raised.wait_until(&mut guard, deadline).timed_out() {
                return self.pending() > 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn reply(n: u32) -> IpcReply {
        IpcReply {
            request: PhysAddr::new(0x0812_0000 + n * 0x80),
            reply: IosError::OK,
        }
    }

    #[test]
    fn replies_keep_order() {
        let line = InterruptLine::new();
        line.post_reply(reply(0));
        line.post_reply(reply(1));
        assert_eq!(line.take_reply(), Some(reply(0)));
        assert_eq!(line.take_reply(), Some(reply(1)));
        assert_eq!(line.take_reply(), None);
    }

    #[test]
    #[should_panic = "reply queue overflow"]
    fn overflow_is_fatal() {
        let line = InterruptLine::new();
        for n in (0u32..).take(REPLY_QUEUE_SIZE + 1) {
            line.post_reply(reply(n));
        }
    }

    #[test]
    fn wait_times_out() {
        let line = InterruptLine::new();
        let start = Instant::now();
        assert!(!line.wait_until(start + Duration::from_millis(5)));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn wait_wakes_on_reply() {
        let line = Arc::new(InterruptLine::new());
        let poster = {
            let line = line.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(2));
                line.post_reply(reply(3));
            })
        };
        assert!(line.wait_until(Instant::now() + Duration::from_secs(5)));
        assert_eq!(line.take_reply(), Some(reply(3)));
        poster.join().unwrap();
    }
}
