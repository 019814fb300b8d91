#![allow(dead_code)]

use cafe_core::addr::PhysAddr;
use cafe_core::ipc::{
    InterruptLine, IosError, IosHardware, IpcCommand, IpcKernelDriver, IpcKernelRequest, IpcReply,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_millis(35);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Reply immediately from within `submit`.
    Immediate,
    /// Never reply on our own, tests post replies by hand.
    Manual,
    /// Refuse every submission as if the hardware were busy.
    Reject,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub core: usize,
    pub address: PhysAddr,
    pub request: IpcKernelRequest,
}

/// A stand-in microkernel that answers every request the obvious way.
#[derive(Debug)]
pub struct FakeIos {
    mode: Mutex<ReplyMode>,
    lines: Mutex<Vec<Arc<InterruptLine>>>,
    submitted: Mutex<VecDeque<Submission>>,
    next_handle: Mutex<i32>,
}

impl FakeIos {
    pub fn new(mode: ReplyMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            lines: Mutex::new(Vec::new()),
            submitted: Mutex::new(VecDeque::new()),
            next_handle: Mutex::new(1),
        })
    }

    /// Tells the fake where to deliver replies for `core`.
    pub fn connect(&self, core: usize, line: Arc<InterruptLine>) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() <= core {
            lines.resize_with(core + 1, || Arc::new(InterruptLine::new()));
        }
        lines[core] = line;
    }

    pub fn set_mode(&self, mode: ReplyMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn take_submission(&self) -> Option<Submission> {
        self.submitted.lock().unwrap().pop_front()
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    /// Replies to `submission` through its core's interrupt line.
    pub fn reply(&self, submission: &Submission, reply: IosError) {
        let line = self.lines.lock().unwrap()[submission.core].clone();
        line.post_reply(IpcReply {
            request: submission.address,
            reply,
        });
    }

    /// The answer a well-behaved device gives to `request`.
    pub fn answer(&self, request: &IpcKernelRequest) -> IosError {
        match request.request.command {
            IpcCommand::Open => {
                if request.name() == Some("/dev/missing") {
                    return IosError::NO_EXISTS;
                }
                let mut next = self.next_handle.lock().unwrap();
                let handle = *next;
                *next += 1;
                IosError(handle)
            }
            IpcCommand::Read | IpcCommand::Write => IosError(request.request.args[1] as i32),
            _ => IosError::OK,
        }
    }
}

impl IosHardware for FakeIos {
    fn submit(
        &self,
        core: usize,
        address: PhysAddr,
        request: &IpcKernelRequest,
    ) -> cafe_core::Result<()> {
        let submission = Submission {
            core,
            address,
            request: *request,
        };
        match *self.mode.lock().unwrap() {
            ReplyMode::Immediate => {
                let reply = self.answer(request);
                self.reply(&submission, reply);
            }
            ReplyMode::Manual => self.submitted.lock().unwrap().push_back(submission),
            ReplyMode::Reject => return Err(cafe_core::Error::Ios(IosError::NOT_READY)),
        }
        Ok(())
    }
}

/// An open kernel driver for `core` wired up to `ios`.
pub fn open_kernel_driver(core: usize, ios: &Arc<FakeIos>) -> IpcKernelDriver {
    let line = Arc::new(InterruptLine::new());
    ios.connect(core, line.clone());
    let mut driver = IpcKernelDriver::new(core, TIMEOUT, ios.clone(), line);
    driver.init().unwrap();
    driver.open_driver().unwrap();
    driver
}
