//! The raw request structures shared with the emulated microkernel.
//!
//! These live in guest physical memory and are read and written field by
//! field at fixed big-endian offsets, so that memory dumps and debuggers see
//! the same layout the hardware does.

use crate::addr::PhysAddr;
use crate::guest_memory::Arena;
use crate::ipc::types::{IosError, IosHandle, IpcCommand};
use crate::Error;

/// Number of argument words in an [`IpcRequest`].
pub const NUM_ARGS: usize = 5;
/// Size of the name buffer embedded in an [`IpcKernelRequest`].
pub const NAME_BUFFER_SIZE: usize = 0x20;

/// Field offsets of [`IpcRequest`].
pub mod request_layout {
    pub const COMMAND: u32 = 0x00;
    pub const REPLY: u32 = 0x04;
    pub const HANDLE: u32 = 0x08;
    pub const FLAGS: u32 = 0x0C;
    pub const CPU_ID: u32 = 0x10;
    pub const CLIENT_PID: u32 = 0x14;
    pub const TITLE_ID: u32 = 0x18;
    pub const GROUP_ID: u32 = 0x20;
    pub const ARGS: u32 = 0x24;
    pub const SIZE: u32 = 0x38;
}

/// Field offsets of [`IpcKernelRequest`].
pub mod kernel_request_layout {
    pub const REQUEST: u32 = 0x00;
    pub const PREV_COMMAND: u32 = 0x38;
    pub const PREV_HANDLE: u32 = 0x3C;
    pub const BUFFER1: u32 = 0x40;
    pub const BUFFER2: u32 = 0x44;
    pub const NAME_BUFFER: u32 = 0x48;
    pub const SIZE: u32 = 0x80;
}

/// The request header the microkernel sees.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IpcRequest {
    pub command: IpcCommand,
    pub reply: IosError,
    pub handle: IosHandle,
    /// Always zero when submitted by this side.
    pub flags: u32,
    /// 1-based index of the submitting core.
    pub cpu_id: u32,
    pub client_pid: u32,
    pub title_id: u64,
    pub group_id: u32,
    pub args: [u32; NUM_ARGS],
}

impl IpcRequest {
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the request does not lie within
    /// `arena`. The same holds for every read and write in this module.
    pub fn read_from(arena: &Arena, at: PhysAddr) -> crate::Result<Self> {
        use request_layout as l;
        let field = |offset: u32| at.checked_add(offset).ok_or(Error::InvalidAddress(at.get()));

        let raw_command = arena.read_u32(field(l::COMMAND)?)?;
        let mut args = [0; NUM_ARGS];
        for (arg, offset) in args.iter_mut().zip((l::ARGS..l::SIZE).step_by(4)) {
            *arg = arena.read_u32(field(offset)?)?;
        }

        Ok(Self {
            command: IpcCommand::from_u32(raw_command).unwrap_or_default(),
            reply: IosError(arena.read_u32(field(l::REPLY)?)?.cast_signed()),
            handle: arena.read_u32(field(l::HANDLE)?)?.cast_signed(),
            flags: arena.read_u32(field(l::FLAGS)?)?,
            cpu_id: arena.read_u32(field(l::CPU_ID)?)?,
            client_pid: arena.read_u32(field(l::CLIENT_PID)?)?,
            title_id: arena.read_u64(field(l::TITLE_ID)?)?,
            group_id: arena.read_u32(field(l::GROUP_ID)?)?,
            args,
        })
    }

    pub fn write_to(&self, arena: &mut Arena, at: PhysAddr) -> crate::Result<()> {
        use request_layout as l;
        let field = |offset: u32| at.checked_add(offset).ok_or(Error::InvalidAddress(at.get()));

        arena.write_u32(field(l::COMMAND)?, self.command as u32)?;
        arena.write_u32(field(l::REPLY)?, self.reply.0.cast_unsigned())?;
        arena.write_u32(field(l::HANDLE)?, self.handle.cast_unsigned())?;
        arena.write_u32(field(l::FLAGS)?, self.flags)?;
        arena.write_u32(field(l::CPU_ID)?, self.cpu_id)?;
        arena.write_u32(field(l::CLIENT_PID)?, self.client_pid)?;
        arena.write_u64(field(l::TITLE_ID)?, self.title_id)?;
        arena.write_u32(field(l::GROUP_ID)?, self.group_id)?;
        for (arg, offset) in self.args.iter().zip((l::ARGS..l::SIZE).step_by(4)) {
            arena.write_u32(field(offset)?, *arg)?;
        }
        Ok(())
    }
}

/// One in-flight kernel transaction: the request plus driver bookkeeping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IpcKernelRequest {
    pub request: IpcRequest,
    pub prev_command: IpcCommand,
    pub prev_handle: IosHandle,
    pub buffer1: PhysAddr,
    pub buffer2: PhysAddr,
    pub name_buffer: [u8; NAME_BUFFER_SIZE],
}

impl IpcKernelRequest {
    pub fn read_from(arena: &Arena, at: PhysAddr) -> crate::Result<Self> {
        use kernel_request_layout as l;
        let field = |offset: u32| at.checked_add(offset).ok_or(Error::InvalidAddress(at.get()));

        let mut name_buffer = [0; NAME_BUFFER_SIZE];
        name_buffer.copy_from_slice(arena.bytes(field(l::NAME_BUFFER)?, NAME_BUFFER_SIZE)?);

        Ok(Self {
            request: IpcRequest::read_from(arena, field(l::REQUEST)?)?,
            prev_command: IpcCommand::from_u32(arena.read_u32(field(l::PREV_COMMAND)?)?)
                .unwrap_or_default(),
            prev_handle: arena.read_u32(field(l::PREV_HANDLE)?)?.cast_signed(),
            buffer1: PhysAddr::new(arena.read_u32(field(l::BUFFER1)?)?),
            buffer2: PhysAddr::new(arena.read_u32(field(l::BUFFER2)?)?),
            name_buffer,
        })
    }

    /// Writes the whole structure, zeroing the padding after the name buffer.
    pub fn write_to(&self, arena: &mut Arena, at: PhysAddr) -> crate::Result<()> {
        use kernel_request_layout as l;
        let field = |offset: u32| at.checked_add(offset).ok_or(Error::InvalidAddress(at.get()));

        arena.fill(at, l::SIZE as usize, 0)?;
        self.request.write_to(arena, field(l::REQUEST)?)?;
        arena.write_u32(field(l::PREV_COMMAND)?, self.prev_command as u32)?;
        arena.write_u32(field(l::PREV_HANDLE)?, self.prev_handle.cast_unsigned())?;
        arena.write_u32(field(l::BUFFER1)?, self.buffer1.get())?;
        arena.write_u32(field(l::BUFFER2)?, self.buffer2.get())?;
        arena.write_bytes(field(l::NAME_BUFFER)?, &self.name_buffer)
    }

    /// Copies `name` into the name buffer, NUL terminated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `name` does not fit or contains a NUL.
    pub fn set_name(&mut self, name: &str) -> crate::Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() >= NAME_BUFFER_SIZE || bytes.contains(&0) {
            return Err(Error::InvalidArgument);
        }
        self.name_buffer = [0; NAME_BUFFER_SIZE];
        self.name_buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// The name up to its NUL terminator, if it is valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        let len = self
            .name_buffer
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_BUFFER_SIZE);
        core::str::from_utf8(&self.name_buffer[..len]).ok()
    }
}

/// Writes only the reply word of the request at `at`.
pub fn write_reply(arena: &mut Arena, at: PhysAddr, reply: IosError) -> crate::Result<()> {
    let field = at
        .checked_add(request_layout::REPLY)
        .ok_or(Error::InvalidAddress(at.get()))?;
    arena.write_u32(field, reply.0.cast_unsigned())
}
