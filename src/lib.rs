//! The execution core of a big-endian PowerPC console emulator: the guest
//! address space and its memory manager, the JIT code cache, and the IPC
//! drivers that connect guest software to the emulated microkernel.

extern crate alloc;

pub mod addr;
pub mod config;
mod errors;
pub mod guest_memory;
pub mod ipc;
pub mod jit;
pub mod memory;
mod system;

pub use config::{CodeCacheConfig, Config};
pub use errors::Error;
pub type Result<T> = core::result::Result<T, Error>;
pub use system::{Core, System};

/// The host's page size, the granularity of every host mapping.
pub fn host_page_size() -> usize {
    static PAGE_SIZE: spin::Once<usize> = spin::Once::new();

    *PAGE_SIZE.call_once(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    })
}
