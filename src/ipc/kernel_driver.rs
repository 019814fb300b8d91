use crate::addr::PhysAddr;
use crate::guest_memory::Arena;
use crate::ipc::fifo::IpcFifo;
use crate::ipc::hardware::{InterruptLine, IosHardware};
use crate::ipc::request::{
    kernel_request_layout, write_reply, IpcKernelRequest, IpcRequest, NUM_ARGS,
};
use crate::ipc::request_block::{
    BlockState, ReplyCallback, ReplyTarget, RequestBlock, RequestBlockFlags, RequestBlockId,
};
use crate::ipc::types::{
    IosError, IosHandle, IpcCommand, RamPartitionId, SeekOrigin, NUM_RAM_PARTITIONS,
};
use crate::ipc::{
    core_table, hardware_core, DriverState, IPCK_BLOCKS, IPCK_BUFFERS_BASE, IPCK_BUFFER_COUNT,
    IPCK_BUFFER_STRIDE,
};
use crate::Error;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::time::Duration;
use cranelift_entity::{EntityRef, PrimaryMap};
use std::time::Instant;

pub type RequestFifo = IpcFifo<RequestBlockId, IPCK_BUFFER_COUNT>;

/// Called when a reply lands in a process' user reply queue.
pub type ReplyNotify = Box<dyn Fn(RamPartitionId) + Send>;

/// Shadow of the IPC hardware registers as last written by the driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterShadow {
    pub ppc_msg: u32,
    pub ppc_ctrl: u32,
    pub arm_msg: u32,
    pub arm_ctrl: u32,
}

impl RegisterShadow {
    /// PPC has a message for ARM.
    pub const CTRL_X1: u32 = 1 << 0;
    /// ARM has a message for PPC.
    pub const CTRL_Y1: u32 = 1 << 1;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub replies: u32,
    pub last_error: Option<IosError>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KernelDriverStats {
    /// Replies whose request address is not one of this core's blocks.
    pub invalid_reply_address: u32,
    /// Replies for blocks that were not waiting for one.
    pub invalid_reply_block: u32,
    pub submit_failures: u32,
    pub allocation_failures: u32,
    pub processes: [ProcessStats; NUM_RAM_PARTITIONS],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub title_id: u64,
    pub group_id: u32,
}

/// Per-core kernel side of the IPC protocol.
///
/// Owns a fixed pool of request blocks, each with its raw request in this
/// core's slice of the IPC buffer memory.
pub struct IpcKernelDriver {
    core: usize,
    state: DriverState,
    timeout: Duration,
    hardware: Arc<dyn IosHardware>,
    interrupts: Arc<InterruptLine>,
    memory: Arena,
    blocks: PrimaryMap<RequestBlockId, RequestBlock>,
    free: RequestFifo,
    outbound: RequestFifo,
    user_replies: [RequestFifo; NUM_RAM_PARTITIONS],
    loader_replies: [RequestFifo; NUM_RAM_PARTITIONS],
    notify: [Option<ReplyNotify>; NUM_RAM_PARTITIONS],
    identities: [ProcessIdentity; NUM_RAM_PARTITIONS],
    registers: RegisterShadow,
    stats: KernelDriverStats,
}

impl fmt::Debug for IpcKernelDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcKernelDriver")
            .field("core", &self.core)
            .field("state", &self.state)
            .field("free", &self.free.len())
            .field("registers", &self.registers)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl IpcKernelDriver {
    /// # Panics
    ///
    /// Panics if `core` is not a hardware core.
    pub fn new(
        core: usize,
        timeout: Duration,
        hardware: Arc<dyn IosHardware>,
        interrupts: Arc<InterruptLine>,
    ) -> Self {
        let base = core_table(IPCK_BUFFERS_BASE, IPCK_BUFFER_STRIDE, core);
        Self {
            core,
            state: DriverState::Invalid,
            timeout,
            hardware,
            interrupts,
            memory: Arena::new(base, IPCK_BUFFER_STRIDE),
            blocks: PrimaryMap::new(),
            free: RequestFifo::new(),
            outbound: RequestFifo::new(),
            user_replies: core::array::from_fn(|_| RequestFifo::new()),
            loader_replies: core::array::from_fn(|_| RequestFifo::new()),
            notify: core::array::from_fn(|_| None),
            identities: [ProcessIdentity::default(); NUM_RAM_PARTITIONS],
            registers: RegisterShadow::default(),
            stats: KernelDriverStats::default(),
        }
    }

    /// Lays out the request block pool. `Invalid -> Initialised`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] unless the driver is `Invalid`.
    pub fn init(&mut self) -> crate::Result<()> {
        if self.state != DriverState::Invalid {
            return Err(Error::NotReady);
        }

        let base = self.memory.base();
        self.blocks.clear();
        for i in 0..IPCK_BLOCKS {
            let request = base
                .checked_add(i * kernel_request_layout::SIZE)
                .ok_or(Error::InvalidAddress(base.get()))?;
            self.blocks.push(RequestBlock::new(request));
        }

        self.state = DriverState::Initialised;
        tracing::debug!(core = self.core, "IPC kernel driver initialised");
        Ok(())
    }

    /// Resets every block and queue and opens the driver. `Initialised -> Open`.
    ///
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
        for fifo in self.user_replies.iter_mut().chain(self.loader_replies.iter_mut()) {
            fifo.init();
        }
        for id in self.blocks.keys() {
            self.free.push(id)?;
        }

        self.state = DriverState::Open;
        tracing::debug!(core = self.core, "IPC kernel driver open");
        Ok(())
    }

    #[inline]
    pub fn core(&self) -> usize {
        self.core
    }

    #[inline]
    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn interrupt_line(&self) -> &Arc<InterruptLine> {
        &self.interrupts
    }

    pub fn registers(&self) -> RegisterShadow {
        self.registers
    }

    pub fn stats(&self) -> &KernelDriverStats {
        &self.stats
    }

    pub fn free_fifo(&self) -> &RequestFifo {
        &self.free
    }

    pub fn outbound_fifo(&self) -> &RequestFifo {
        &self.outbound
    }

    pub fn user_reply_fifo(&self, pid: RamPartitionId) -> &RequestFifo {
        &self.user_replies[pid.index()]
    }

    pub fn loader_reply_fifo(&self, pid: RamPartitionId) -> &RequestFifo {
        &self.loader_replies[pid.index()]
    }

    pub fn block(&self, id: RequestBlockId) -> Option<&RequestBlock> {
        self.blocks.get(id)
    }

    /// The raw memory holding this core's requests.
    pub fn memory(&self) -> &Arena {
        &self.memory
    }

    pub fn set_process_identity(&mut self, pid: RamPartitionId, identity: ProcessIdentity) {
        self.identities[pid.index()] = identity;
    }

    /// Registers `notify` to be called whenever a reply for `pid` is queued.
    pub fn register_user_notify(&mut self, pid: RamPartitionId, notify: ReplyNotify) {
        self.notify[pid.index()] = Some(notify);
    }

    pub fn unregister_user_notify(&mut self, pid: RamPartitionId) {
        self.notify[pid.index()] = None;
    }

    /// Takes a block off the free list and stamps a fresh request header into it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] unless the driver is open and
    /// [`Error::QueueFull`] when every block is in use.
    pub fn allocate_request_block(
        &mut self,
        pid: RamPartitionId,
        command: IpcCommand,
        handle: IosHandle,
        callback: Option<ReplyCallback>,
        context: u32,
    ) -> crate::Result<RequestBlockId> {
        if self.state != DriverState::Open {
            return Err(Error::NotReady);
        }

        let id = match self.free.pop() {
            Ok(id) => id,
            Err(_) => {
                self.stats.allocation_failures += 1;
                // nothing free to satisfy a new request
                return Err(Error::QueueFull);
            }
        };

        let reply_target = if pid == RamPartitionId::Loader && callback.is_none() {
            ReplyTarget::Loader
        } else {
            ReplyTarget::User
        };
        let block = &mut self.blocks[id];
        block.flags = RequestBlockFlags {
            allocated: true,
            has_callback: callback.is_some(),
            state: BlockState::Idle,
            reply_target,
            owner: Some(pid),
            command,
        };
        block.callback = callback;
        block.context = context;
        let at = block.request;

        let previous = IpcRequest::read_from(&self.memory, at)?;
        let identity = self.identities[pid.index()];
        let fresh = IpcKernelRequest {
            request: IpcRequest {
                command,
                reply: IosError::OK,
                handle,
                flags: 0,
                cpu_id: hardware_core(self.core) + 1,
                client_pid: pid as u32,
                title_id: identity.title_id,
                group_id: identity.group_id,
                args: [0; NUM_ARGS],
            },
            prev_command: previous.command,
            prev_handle: previous.handle,
            ..IpcKernelRequest::default()
        };
        fresh.write_to(&mut self.memory, at)?;

        tracing::trace!(core = self.core, "allocated {id} for {pid:?} {command:?}");
        Ok(id)
    }

    /// Returns a block to the free list, dropping any pending callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `id` is not allocated.
    pub fn free_request_block(&mut self, id: RequestBlockId) -> crate::Result<()> {
        let block = self.blocks.get_mut(id).ok_or(Error::InvalidArgument)?;
        if !block.flags.allocated {
            return Err(Error::InvalidArgument);
        }
        block.reset();
        self.free.push(id)
    }

    /// Reads, modifies and writes back the raw request of an allocated block.
    ///
    /// `update` also receives the request's physical address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `id` is not allocated.
    pub fn update_request(
        &mut self,
        id: RequestBlockId,
        update: impl FnOnce(&mut IpcKernelRequest, PhysAddr),
    ) -> crate::Result<()> {
        let at = self.allocated_block(id)?.request;
        let mut request = IpcKernelRequest::read_from(&self.memory, at)?;
        update(&mut request, at);
        request.write_to(&mut self.memory, at)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unknown `id`.
    pub fn read_request(&self, id: RequestBlockId) -> crate::Result<IpcKernelRequest> {
        let at = self.blocks.get(id).ok_or(Error::InvalidArgument)?.request;
        IpcKernelRequest::read_from(&self.memory, at)
    }

    fn allocated_block(&self, id: RequestBlockId) -> crate::Result<&RequestBlock> {
        self.blocks
            .get(id)
            .filter(|block| block.flags.allocated)
            .ok_or(Error::InvalidArgument)
    }

    /// Hands an allocated request to the hardware.
    ///
    /// The request goes through the outbound queue so its high-water mark
    /// reflects how many submissions were in progress at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] unless the driver is open, or the
    /// hardware's error if it refuses the request. Either way the block stays
    /// allocated and idle and the driver stays open.
    pub fn submit_request(&mut self, id: RequestBlockId) -> crate::Result<()> {
        let at = self.allocated_block(id)?.request;
        if let Err(err) = self.outbound.push(id) {
            self.stats.submit_failures += 1;
            return Err(err);
        }

        if self.state != DriverState::Open {
            let _ = self.outbound.pop();
            self.stats.submit_failures += 1;
            return Err(Error::NotReady);
        }
        let id = self.outbound.pop()?;

        let request = IpcKernelRequest::read_from(&self.memory, at)?;
        self.state = DriverState::Submitting;
        self.blocks[id].flags.state = BlockState::Submitted;
        self.registers.ppc_msg = at.get();
        self.registers.ppc_ctrl = RegisterShadow::CTRL_X1;

        let result = self.hardware.submit(self.core, at, &request);

        self.registers.ppc_ctrl = 0;
        self.state = DriverState::Open;

        match result {
            Ok(()) => {
                tracing::trace!(core = self.core, "submitted {id} at {at}");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(core = self.core, "submitting {id} failed: {err}");
                self.blocks[id].flags.state = BlockState::Idle;
                self.stats.submit_failures += 1;
                Err(err)
            }
        }
    }

    /// Maps a raw request address back to the block owning it.
    fn block_at(&self, at: PhysAddr) -> Option<RequestBlockId> {
        let offset = at.offset_from(self.memory.base())?;
        if offset % kernel_request_layout::SIZE != 0 {
            return None;
        }
        let index = (offset / kernel_request_layout::SIZE) as usize;
        (index < self.blocks.len()).then(|| RequestBlockId::new(index))
    }

    /// Delivers a reply from the microkernel to the owner of `at`.
    ///
    /// # Errors
    ///
    /// Replies for unknown addresses or blocks that are not awaiting one are
    /// counted and rejected without touching any driver state.
    pub fn process_reply(&mut self, at: PhysAddr, reply: IosError) -> crate::Result<()> {
        let Some(id) = self.block_at(at) else {
            self.stats.invalid_reply_address += 1;
            tracing::warn!(core = self.core, "reply for unknown request address {at}");
            return Err(Error::InvalidAddress(at.get()));
        };

        let flags = self.blocks[id].flags;
        let owner = match flags.owner {
            Some(owner) if flags.allocated && flags.state == BlockState::Submitted => owner,
            _ => {
                self.stats.invalid_reply_block += 1;
                tracing::warn!(core = self.core, "unexpected reply for {id} ({flags:?})");
                return Err(Error::InvalidArgument);
            }
        };

        write_reply(&mut self.memory, at, reply)?;
        self.registers.arm_msg = at.get();
        self.registers.arm_ctrl = RegisterShadow::CTRL_Y1;

        let process = &mut self.stats.processes[owner.index()];
        process.replies += 1;
        if reply.is_err() {
            process.last_error = Some(reply);
        }

        let block = &mut self.blocks[id];
        block.flags.state = BlockState::Replied;
        tracing::trace!(core = self.core, "reply {reply} for {id}");

        if let Some(callback) = block.callback.take() {
            self.free_request_block(id)?;
            callback(reply);
            return Ok(());
        }

        match flags.reply_target {
            ReplyTarget::Loader => self.loader_replies[owner.index()].push(id)?,
            ReplyTarget::User => {
                self.user_replies[owner.index()].push(id)?;
                if let Some(notify) = &self.notify[owner.index()] {
                    notify(owner);
                }
            }
        }
        Ok(())
    }

    /// Handles one pending interrupt, returning whether there was one.
    pub fn handle_interrupt(&mut self) -> bool {
        let Some(reply) = self.interrupts.take_reply() else {
            return false;
        };
        // rejected replies are already counted
        let _ = self.process_reply(reply.request, reply.reply);
        true
    }

    /// Handles every pending interrupt.
    pub fn handle_interrupts(&mut self) -> usize {
        let mut handled = 0;
        while self.handle_interrupt() {
            handled += 1;
        }
        handled
    }

    /// Picks up the oldest queued reply for `pid`, freeing its block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueEmpty`] if no reply is queued.
    pub fn receive_user_reply(&mut self, pid: RamPartitionId) -> crate::Result<IpcRequest> {
        let id = self.user_replies[pid.index()].pop()?;
        let request = IpcRequest::read_from(&self.memory, self.blocks[id].request)?;
        self.free_request_block(id)?;
        Ok(request)
    }

    /// Takes the oldest reply routed to the loader of `pid` together with its
    /// block, which the caller must free once done with it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueEmpty`] if no reply is queued.
    pub fn pop_loader_reply(
        &mut self,
        pid: RamPartitionId,
    ) -> crate::Result<(RequestBlockId, IpcRequest)> {
        let id = self.loader_replies[pid.index()].pop()?;
        let request = IpcRequest::read_from(&self.memory, self.blocks[id].request)?;
        Ok((id, request))
    }

    /// Allocates, fills and submits a request in one go, releasing the block
    /// again if anything fails.
    fn submit_new(
        &mut self,
        pid: RamPartitionId,
        command: IpcCommand,
        handle: IosHandle,
        callback: Option<ReplyCallback>,
        fill: impl FnOnce(&mut IpcKernelRequest, PhysAddr) -> crate::Result<()>,
    ) -> crate::Result<RequestBlockId> {
        let id = self.allocate_request_block(pid, command, handle, callback, 0)?;

        let mut filled = Ok(());
        let result = self
            .update_request(id, |request, at| filled = fill(request, at))
            .and(filled)
            .and_then(|()| self.submit_request(id));

        match result {
            Ok(()) => Ok(id),
            Err(err) => {
                self.free_request_block(id)?;
                Err(err)
            }
        }
    }

    /// Submits an open of `name` and returns the request's block.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] for a name that does not fit the
    /// name buffer, or for the reasons [`IpcKernelDriver::allocate_request_block`]
    /// and [`IpcKernelDriver::submit_request`] do. Nothing stays allocated on
    /// failure, the same as for every other request below.
    pub fn open_async(
        &mut self,
        pid: RamPartitionId,
        name: &str,
        mode: u32,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<RequestBlockId> {
        self.submit_new(pid, IpcCommand::Open, 0, callback, |request, at| {
            request.set_name(name)?;
            request.request.args[0] = at.get() + kernel_request_layout::NAME_BUFFER;
            request.request.args[1] =
                u32::try_from(name.len() + 1).map_err(|_| Error::InvalidArgument)?;
            request.request.args[2] = mode;
            Ok(())
        })
    }

    /// # Errors
    ///
    /// See [`IpcKernelDriver::open_async`].
    pub fn close_async(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<RequestBlockId> {
        self.submit_new(pid, IpcCommand::Close, handle, callback, |_, _| Ok(()))
    }

    /// # Errors
    ///
    /// Rejects a null `buffer` with a nonzero `len`, see
    /// [`IpcKernelDriver::open_async`] for the rest.
    pub fn read_async(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        buffer: PhysAddr,
        len: u32,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<RequestBlockId> {
        check_buffer(buffer, len)?;
        self.submit_new(pid, IpcCommand::Read, handle, callback, |request, _| {
            request.request.args[0] = buffer.get();
            request.request.args[1] = len;
            request.buffer1 = buffer;
            Ok(())
        })
    }

    /// # Errors
    ///
    /// Rejects a null `buffer` with a nonzero `len`, see
    /// [`IpcKernelDriver::open_async`] for the rest.
    pub fn write_async(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        buffer: PhysAddr,
        len: u32,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<RequestBlockId> {
        check_buffer(buffer, len)?;
        self.submit_new(pid, IpcCommand::Write, handle, callback, |request, _| {
            request.request.args[0] = buffer.get();
            request.request.args[1] = len;
            request.buffer1 = buffer;
            Ok(())
        })
    }

    /// # Errors
    ///
    /// See [`IpcKernelDriver::open_async`].
    pub fn seek_async(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        offset: u32,
        origin: SeekOrigin,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<RequestBlockId> {
        self.submit_new(pid, IpcCommand::Seek, handle, callback, |request, _| {
            request.request.args[0] = offset;
            request.request.args[1] = origin as u32;
            Ok(())
        })
    }

    /// # Errors
    ///
    /// Rejects arguments that fail [`IoctlArgs::validate`], see
    /// [`IpcKernelDriver::open_async`] for the rest.
    pub fn ioctl_async(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        ioctl: IoctlArgs,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<RequestBlockId> {
        ioctl.validate()?;
        self.submit_new(pid, IpcCommand::Ioctl, handle, callback, |request, _| {
            ioctl.fill(request);
            Ok(())
        })
    }

    /// # Errors
    ///
    /// Rejects arguments that fail [`IoctlvArgs::validate`], see
    /// [`IpcKernelDriver::open_async`] for the rest.
    pub fn ioctlv_async(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        ioctlv: IoctlvArgs,
        callback: Option<ReplyCallback>,
    ) -> crate::Result<RequestBlockId> {
        ioctlv.validate()?;
        self.submit_new(pid, IpcCommand::Ioctlv, handle, callback, |request, _| {
            request.request.args[0] = ioctlv.request;
            request.request.args[1] = ioctlv.num_in;
            request.request.args[2] = ioctlv.num_out;
            request.request.args[3] = ioctlv.vecs.get();
            request.buffer1 = ioctlv.vecs;
            Ok(())
        })
    }

    /// Runs `submit` with a completion callback and waits for its reply.
    ///
    /// On timeout the request stays outstanding. Its late reply still runs the
    /// callback, which then reports to nobody, and frees the block.
    fn call_sync(
        &mut self,
        submit: impl FnOnce(&mut Self, ReplyCallback) -> crate::Result<RequestBlockId>,
    ) -> crate::Result<i32> {
        let done = Arc::new(spin::Once::<IosError>::new());
        let callback: ReplyCallback = {
            let done = done.clone();
            Box::new(move |reply| {
                done.call_once(|| reply);
            })
        };
        let id = submit(self, callback)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            self.handle_interrupts();
            if let Some(reply) = done.get() {
                return reply.into_result();
            }
            if !self.interrupts.wait_until(deadline) {
                self.handle_interrupts();
                if let Some(reply) = done.get() {
                    return reply.into_result();
                }
                tracing::warn!(core = self.core, "{id} timed out after {:?}", self.timeout);
                return Err(Error::Timeout);
            }
        }
    }

    /// Opens `name` and waits for the handle.
    ///
    /// # Errors
    ///
    /// Everything [`IpcKernelDriver::open_async`] rejects, [`Error::Timeout`]
    /// if no reply arrives in time, and [`Error::Ios`] for a negative reply.
    /// The other synchronous calls fail the same way.
    pub fn open(&mut self, pid: RamPartitionId, name: &str, mode: u32) -> crate::Result<IosHandle> {
        self.call_sync(|driver, callback| driver.open_async(pid, name, mode, Some(callback)))
    }

    /// # Errors
    ///
    /// See [`IpcKernelDriver::open`].
    pub fn close(&mut self, pid: RamPartitionId, handle: IosHandle) -> crate::Result<()> {
        self.call_sync(|driver, callback| driver.close_async(pid, handle, Some(callback)))
            .map(drop)
    }

    /// # Errors
    ///
    /// See [`IpcKernelDriver::open`].
    pub fn read(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        buffer: PhysAddr,
        len: u32,
    ) -> crate::Result<u32> {
        self.call_sync(|driver, callback| {
            driver.read_async(pid, handle, buffer, len, Some(callback))
        })
        .map(i32::cast_unsigned)
    }

    /// # Errors
    ///
    /// See [`IpcKernelDriver::open`].
    pub fn write(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        buffer: PhysAddr,
        len: u32,
    ) -> crate::Result<u32> {
        self.call_sync(|driver, callback| {
            driver.write_async(pid, handle, buffer, len, Some(callback))
        })
        .map(i32::cast_unsigned)
    }

    /// # Errors
    ///
    /// See [`IpcKernelDriver::open`].
    pub fn seek(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        offset: u32,
        origin: SeekOrigin,
    ) -> crate::Result<u32> {
        self.call_sync(|driver, callback| {
            driver.seek_async(pid, handle, offset, origin, Some(callback))
        })
        .map(i32::cast_unsigned)
    }

    /// # Errors
    ///
    /// See [`IpcKernelDriver::open`].
    pub fn ioctl(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        ioctl: IoctlArgs,
    ) -> crate::Result<i32> {
        self.call_sync(|driver, callback| driver.ioctl_async(pid, handle, ioctl, Some(callback)))
    }

    /// # Errors
    ///
    /// See [`IpcKernelDriver::open`].
    pub fn ioctlv(
        &mut self,
        pid: RamPartitionId,
        handle: IosHandle,
        ioctlv: IoctlvArgs,
    ) -> crate::Result<i32> {
        self.call_sync(|driver, callback| driver.ioctlv_async(pid, handle, ioctlv, Some(callback)))
    }
}

/// A non-null buffer is required whenever its length is nonzero.
pub(crate) fn check_buffer(buffer: PhysAddr, len: u32) -> crate::Result<()> {
    if len != 0 && buffer.is_null() {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// Arguments of an ioctl request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoctlArgs {
    pub request: u32,
    pub input: PhysAddr,
    pub input_len: u32,
    pub output: PhysAddr,
    pub output_len: u32,
}

impl IoctlArgs {
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a null buffer with a nonzero length.
    pub fn validate(&self) -> crate::Result<()> {
        check_buffer(self.input, self.input_len)?;
        check_buffer(self.output, self.output_len)
    }

    pub(crate) fn fill(&self, request: &mut IpcKernelRequest) {
        request.request.args[0] = self.request;
        request.request.args[1] = self.input.get();
        request.request.args[2] = self.input_len;
        request.request.args[3] = self.output.get();
        request.request.args[4] = self.output_len;
        request.buffer1 = self.input;
        request.buffer2 = self.output;
    }
}

/// Arguments of an ioctlv request, whose vectors live in guest memory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoctlvArgs {
    pub request: u32,
    pub num_in: u32,
    pub num_out: u32,
    pub vecs: PhysAddr,
}

impl IoctlvArgs {
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if there are vectors but no table
    /// holding them.
    pub fn validate(&self) -> crate::Result<()> {
        if (self.num_in | self.num_out) != 0 && self.vecs.is_null() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}
