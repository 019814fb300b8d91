//! Inter-process communication with the emulated microkernel.
//!
//! Every core runs its own [`IpcKernelDriver`] with a fixed pool of request
//! blocks and an [`InterruptLine`] through which replies come back. The loader
//! process talks to the kernel driver through its own [`IpcLoaderDriver`],
//! which queues requests locally while the kernel has no free blocks.

mod fifo;
mod hardware;
mod kernel_driver;
mod loader_driver;
mod request;
mod request_block;
mod types;

pub use fifo::IpcFifo;
pub use hardware::{InterruptLine, IosHardware, IpcReply, REPLY_QUEUE_SIZE};
pub use kernel_driver::{
    IoctlArgs, IoctlvArgs, IpcKernelDriver, KernelDriverStats, ProcessIdentity, ProcessStats,
    RegisterShadow, ReplyNotify, RequestFifo,
};
pub use loader_driver::{CommandStats, IpcLoaderDriver, LoaderBlockId, LoaderDriverStats};
pub use request::{
    kernel_request_layout, request_layout, write_reply, IpcKernelRequest, IpcRequest,
    NAME_BUFFER_SIZE, NUM_ARGS,
};
pub use request_block::{
    BlockState, ReplyCallback, ReplyTarget, RequestBlock, RequestBlockFlags, RequestBlockId,
    REQUEST_BLOCK_RAW_SIZE,
};
pub use types::{IosError, IosHandle, IpcCommand, RamPartitionId, SeekOrigin, NUM_RAM_PARTITIONS};

use crate::addr::PhysAddr;
use crate::config::NUM_CORES;

pub(crate) const IPCK_BLOCKS: u32 = 0xB0;
pub(crate) const IPCL_BLOCKS: u32 = 0x30;
const CORES: u32 = 3;
const _: () = assert!(CORES as usize == NUM_CORES);

/// Request blocks per core in the kernel driver.
pub const IPCK_BUFFER_COUNT: usize = IPCK_BLOCKS as usize;
/// Request blocks per core in the loader driver.
pub const IPCL_BUFFER_COUNT: usize = IPCL_BLOCKS as usize;

/// Physical base of the kernel drivers' raw requests, the start of the MEM0
/// IPC buffer region.
pub const IPCK_BUFFERS_BASE: u32 = 0x0812_0000;
/// Bytes of raw requests per core in the kernel driver.
pub const IPCK_BUFFER_STRIDE: u32 = IPCK_BLOCKS * kernel_request_layout::SIZE;
/// Physical base of the loader drivers' raw requests, right after the kernel's.
pub const IPCL_BUFFERS_BASE: u32 = IPCK_BUFFERS_BASE + CORES * IPCK_BUFFER_STRIDE;
pub const IPCL_BUFFER_STRIDE: u32 = IPCL_BLOCKS * kernel_request_layout::SIZE;

/// Position of `core` among the hardware cores, as the hardware counts them.
///
/// # Panics
///
/// Panics if `core` is not one of the [`NUM_CORES`] hardware cores.
pub(crate) fn hardware_core(core: usize) -> u32 {
    match u32::try_from(core) {
        Ok(index) if index < CORES => index,
        _ => panic!("there is no hardware core {core}"),
    }
}

/// Where `core`'s slice of a per-core request table starts.
pub(crate) fn core_table(table: u32, stride: u32, core: usize) -> PhysAddr {
    PhysAddr::new(table + hardware_core(core) * stride)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    #[default]
    Invalid,
    Initialised,
    Open,
    /// Only while a request is being handed to the hardware.
    Submitting,
}
