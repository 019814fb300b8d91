use crate::addr::PhysAddr;
use crate::guest_memory::Arena;
use crate::ipc::fifo::IpcFifo;
use crate::ipc::kernel_driver::{IoctlArgs, IpcKernelDriver};
use crate::ipc::request::{kernel_request_layout, write_reply, IpcKernelRequest, IpcRequest};
use crate::ipc::request_block::{ReplyCallback, RequestBlockId};
use crate::ipc::types::{IosError, IosHandle, IpcCommand, RamPartitionId};
use crate::ipc::{
    core_table, hardware_core, DriverState, IPCL_BLOCKS, IPCL_BUFFERS_BASE, IPCL_BUFFER_COUNT,
    IPCL_BUFFER_STRIDE,
};
use crate::Error;
use core::fmt;
use cranelift_entity::{entity_impl, PrimaryMap};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderBlockId(u32);
entity_impl!(LoaderBlockId, "loader_request");

type LoaderFifo = IpcFifo<LoaderBlockId, IPCL_BUFFER_COUNT>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandStats {
    pub success: u32,
    pub failure: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoaderDriverStats {
    commands: [CommandStats; IpcCommand::COUNT],
    /// Kernel replies that matched none of our in-flight requests.
    pub invalid_replies: u32,
    /// Times the outbound queue had to wait for a free kernel block.
    pub kernel_full: u32,
    pub submit_failures: u32,
}

impl LoaderDriverStats {
    pub fn command(&self, command: IpcCommand) -> CommandStats {
        self.commands[command as usize]
    }

    fn record(&mut self, command: IpcCommand, reply: IosError) {
        let stats = &mut self.commands[command as usize];
        if reply.is_ok() {
            stats.success += 1;
        } else {
            stats.failure += 1;
        }
    }
}

struct LoaderBlock {
    request: PhysAddr,
    allocated: bool,
    command: IpcCommand,
    kernel: Option<RequestBlockId>,
    callback: Option<ReplyCallback>,
}

impl LoaderBlock {
    fn reset(&mut self) {
        self.allocated = false;
        self.command = IpcCommand::Invalid;
        self.kernel = None;
        self.callback = None;
    }
}

/// The loader's per-core view of IPC.
///
/// Requests are staged in the loader's own pool and outbound queue, then
/// moved to the kernel driver as kernel request blocks become available.
pub struct IpcLoaderDriver {
    core: usize,
    state: DriverState,
    memory: Arena,
    blocks: PrimaryMap<LoaderBlockId, LoaderBlock>,
    free: LoaderFifo,
    outbound: LoaderFifo,
    current_send: Option<LoaderBlockId>,
    stats: LoaderDriverStats,
}

impl fmt::Debug for IpcLoaderDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcLoaderDriver")
            .field("core", &self.core)
            .field("state", &self.state)
            .field("free", &self.free.len())
            .field("outbound", &self.outbound.len())
            .field("current_send", &self.current_send)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl IpcLoaderDriver {
    /// # Panics
    ///
    /// Panics if `core` is not a hardware core.
    pub fn new(core: usize) -> Self {
        let base = core_table(IPCL_BUFFERS_BASE, IPCL_BUFFER_STRIDE, core);
        Self {
            core,
            state: DriverState::Invalid,
            memory: Arena::new(base, IPCL_BUFFER_STRIDE),
            blocks: PrimaryMap::new(),
            free: LoaderFifo::new(),
            outbound: LoaderFifo::new(),
            current_send: None,
            stats: LoaderDriverStats::default(),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::NotReady`] unless the driver is `Invalid`.
    pub fn init(&mut self) -> crate::Result<()> {
        if self.state != DriverState::Invalid {
            return Err(Error::NotReady);
        }

        let base = self.memory.base();
        self.blocks.clear();
        for i in 0..IPCL_BLOCKS {
            let request = base
                .checked_add(i * kernel_request_layout::SIZE)
                .ok_or(Error::InvalidAddress(base.get()))?;
            self.blocks.push(LoaderBlock {
                request,
                allocated: false,
                command: IpcCommand::Invalid,
                kernel: None,
                callback: None,
            });
        }

        self.state = DriverState::Initialised;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::NotReady`] unless the driver is `Initialised`.
    pub fn open_driver(&mut self) -> crate::Result<()> {
        if self.state != DriverState::Initialised {
            return Err(Error::NotReady);
        }

        for block in self.blocks.values_mut() {
            block.reset();
        }
        self.free.init();
        self.outbound.init();
        self.current_send = None;
        for id in self.blocks.keys() {
            self.free.push(id)?;
        }

        self.state = DriverState::Open;
        tracing::debug!(core = self.core, "IPC loader driver open");
        Ok(())
    }

    #[inline]
    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn stats(&self) -> &LoaderDriverStats {
        &self.stats
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Requests waiting for a free kernel block.
    pub fn pending_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn outbound_max_count(&self) -> usize {
        self.outbound.max_count()
    }

    /// The request currently being moved to the kernel driver, if any.
    pub fn current_send_transaction(&self) -> Option<LoaderBlockId> {
        self.current_send
    }

    fn allocate(
        &mut self,
        command: IpcCommand,
        handle: IosHandle,
        callback: Option<ReplyCallback>,
        fill: impl FnOnce(&mut IpcKernelRequest, PhysAddr) -> crate::Result<()>,
    ) -> crate::Result<LoaderBlockId> {
        if self.state != DriverState::Open {
            return Err(Error::NotReady);
        }
        let id = self.free.pop().map_err(|_| Error::QueueFull)?;

        let at = self.blocks[id].request;
        let mut request = IpcKernelRequest {
            request: IpcRequest {
                command,
                handle,
                cpu_id: hardware_core(self.core) + 1,
                client_pid: RamPartitionId::Loader as u32,
                ..IpcRequest::default()
            },
            ..IpcKernelRequest::default()
        };
        let written = fill(&mut request, at).and_then(|()| request.write_to(&mut self.memory, at));
        if let Err(err) = written {
            self.free.push(id)?;
            return Err(err);
        }

        let block = &mut self.blocks[id];
        block.allocated = true;
        block.command = command;
        block.callback = callback;
        Ok(id)
    }

    fn free_block(&mut self, id: LoaderBlockId) -> crate::Result<()> {
        self.blocks[id].reset();
        self.free.push(id)
    }

    fn enqueue(
        &mut self,
        kernel: &mut IpcKernelDriver,
        id: LoaderBlockId,
    ) -> crate::Result<LoaderBlockId> {
        if let Err(err) = self.outbound.push(id) {
            self.free_block(id)?;
            return Err(err);
        }
        self.send_fifo_to_kernel(kernel)?;
        Ok(id)
    }

    /// Stages an open of `name` and hands it to the kernel driver if a kernel
    /// block is free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] unless the driver is open,
    /// [`Error::QueueFull`] once every loader block is in use, and
    /// [`Error::InvalidArgument`] for a name that does not fit. A request
    /// that only waits for a kernel block is not an error.
    pub fn open_async(
        &mut self,
        kernel: &mut IpcKernelDriver,
        name: &str,
        mode: u32,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<LoaderBlockId> {
        let id = self.allocate(IpcCommand::Open, 0, callback, |request, _| {
            request.set_name(name)?;
            request.request.args[1] =
                u32::try_from(name.len() + 1).map_err(|_| Error::InvalidArgument)?;
            request.request.args[2] = mode;
            Ok(())
        })?;
        self.enqueue(kernel, id)
    }

    /// # Errors
    ///
    /// See [`IpcLoaderDriver::open_async`].
    pub fn close_async(
        &mut self,
        kernel: &mut IpcKernelDriver,
        handle: IosHandle,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<LoaderBlockId> {
        let id = self.allocate(IpcCommand::Close, handle, callback, |_, _| Ok(()))?;
        self.enqueue(kernel, id)
    }

    /// Submits an ioctl.
    ///
    /// # Errors
    ///
    /// A non-null buffer is required whenever its length is nonzero, see
    /// [`IpcLoaderDriver::open_async`] for the rest.
    pub fn ioctl_async(
        &mut self,
        kernel: &mut IpcKernelDriver,
        handle: IosHandle,
        ioctl: IoctlArgs,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<LoaderBlockId> {
        ioctl.validate()?;
        let id = self.allocate(IpcCommand::Ioctl, handle, callback, |request, _| {
            ioctl.fill(request);
            Ok(())
        })?;
        self.enqueue(kernel, id)
    }

    /// Moves queued requests to the kernel driver until it runs out of blocks.
    ///
    /// # Errors
    ///
    /// Passes on kernel driver errors other than running out of blocks.
    ///
    /// # Panics
    ///
    /// Panics if the outbound queue changes under a send.
    pub fn send_fifo_to_kernel(&mut self, kernel: &mut IpcKernelDriver) -> crate::Result<()> {
        while let Ok(id) = self.outbound.peek() {
            self.current_send = Some(id);
            let staged = IpcKernelRequest::read_from(&self.memory, self.blocks[id].request)?;
            let command = staged.request.command;

            let kernel_id = match kernel.allocate_request_block(
                RamPartitionId::Loader,
                command,
                staged.request.handle,
                None,
                0,
            ) {
                Ok(kernel_id) => kernel_id,
                Err(Error::QueueFull) => {
                    // stays queued until a kernel reply frees a block
                    self.stats.kernel_full += 1;
                    self.current_send = None;
                    return Ok(());
                }
                Err(err) => {
                    self.current_send = None;
                    return Err(err);
                }
            };

            let popped = self.outbound.pop()?;
            assert_eq!(popped, id, "loader outbound queue changed while sending");

            let copied = kernel.update_request(kernel_id, |request, at| {
                request.request.args = staged.request.args;
                request.buffer1 = staged.buffer1;
                request.buffer2 = staged.buffer2;
                request.name_buffer = staged.name_buffer;
                if command == IpcCommand::Open {
                    request.request.args[0] = at.get() + kernel_request_layout::NAME_BUFFER;
                }
            });
            let submitted = copied.and_then(|()| kernel.submit_request(kernel_id));
            self.current_send = None;

            match submitted {
                Ok(()) => self.blocks[id].kernel = Some(kernel_id),
                Err(err) => {
                    tracing::warn!(core = self.core, "sending {id} to the kernel failed: {err}");
                    self.stats.submit_failures += 1;
                    kernel.free_request_block(kernel_id)?;
                    self.complete(id, IosError::from(err))?;
                }
            }
        }
        Ok(())
    }

    /// Drains the kernel's loader reply queue, then retries queued requests.
    ///
    /// # Errors
    ///
    /// See [`IpcLoaderDriver::send_fifo_to_kernel`].
    pub fn process_replies(&mut self, kernel: &mut IpcKernelDriver) -> crate::Result<usize> {
        let mut processed = 0;
        while let Ok((kernel_id, reply)) = kernel.pop_loader_reply(RamPartitionId::Loader) {
            kernel.free_request_block(kernel_id)?;

            let owner = self
                .blocks
                .iter()
                .find(|(_, block)| block.allocated && block.kernel == Some(kernel_id))
                .map(|(id, _)| id);
            let Some(id) = owner else {
                self.stats.invalid_replies += 1;
                tracing::warn!(core = self.core, "kernel reply for {kernel_id} matches no loader request");
                continue;
            };

            write_reply(&mut self.memory, self.blocks[id].request, reply.reply)?;
            self.complete(id, reply.reply)?;
            processed += 1;
        }

        self.send_fifo_to_kernel(kernel)?;
        Ok(processed)
    }

    fn complete(&mut self, id: LoaderBlockId, reply: IosError) -> crate::Result<()> {
        let block = &mut self.blocks[id];
        self.stats.record(block.command, reply);
        let callback = block.callback.take();
        self.free_block(id)?;
        if let Some(callback) = callback {
            callback(reply);
        }
        Ok(())
    }

    /// The raw request of a loader block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown `id`.
    pub fn read_request(&self, id: LoaderBlockId) -> crate::Result<IpcKernelRequest> {
        let block = self.blocks.get(id).ok_or(Error::InvalidArgument)?;
        IpcKernelRequest::read_from(&self.memory, block.request)
    }

    pub fn is_allocated(&self, id: LoaderBlockId) -> bool {
        self.blocks.get(id).is_some_and(|block| block.allocated)
    }
}
