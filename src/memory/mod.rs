//! The guest address space: which physical regions exist, where each process
//! role sees them in its virtual address space, and the manager that maps them.

mod backend;
mod manager;
mod map;

pub use backend::{MemoryBackend, PageTable};
pub use manager::{VirtualMemoryManager, VirtualMemoryType};
pub use map::{PhysicalMemoryMap, VirtualMapEntry, VirtualMemoryMap};

/// Granularity of every guest mapping.
pub const PAGE_SIZE: u32 = 0x20000;

/// Smallest code region an application can request.
pub const MIN_CODE_SIZE: u32 = 0x20000;
/// Largest code region an application can request, the whole window between
/// the app code base and the app data base.
pub const MAX_CODE_SIZE: u32 = 0x0E00_0000;
/// Fixed size of the reserved region carved out of the main application heap.
pub const APP_RESERVED_SIZE: u32 = 0x0040_0000;

/// Named ranges of the physical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysicalRegion {
    Invalid,
    Mem1,
    Mem0,
    Mem0IpcBuffers,
    Mem2,
    Mem2KernelHeap,
    Mem2SystemLibraries,
    Mem2LoaderGlobals,
    Mem2SharedData,
    Mem2ForegroundBucket,
    Mem2OverlayApp,
    /// The whole heap given to the foreground application, split up by
    /// [`VirtualMemoryManager::initialise_app_memory`] into the regions below.
    Mem2MainApp,
    Mem2MainAppData,
    Mem2MainAppAvailable,
    Mem2MainAppReserved,
    Mem2MainAppCodeGen,
    Mem2MainAppCode,
}

impl PhysicalRegion {
    pub const ALL: [PhysicalRegion; 16] = [
        PhysicalRegion::Mem1,
        PhysicalRegion::Mem0,
        PhysicalRegion::Mem0IpcBuffers,
        PhysicalRegion::Mem2,
        PhysicalRegion::Mem2KernelHeap,
        PhysicalRegion::Mem2SystemLibraries,
        PhysicalRegion::Mem2LoaderGlobals,
        PhysicalRegion::Mem2SharedData,
        PhysicalRegion::Mem2ForegroundBucket,
        PhysicalRegion::Mem2OverlayApp,
        PhysicalRegion::Mem2MainApp,
        PhysicalRegion::Mem2MainAppData,
        PhysicalRegion::Mem2MainAppAvailable,
        PhysicalRegion::Mem2MainAppReserved,
        PhysicalRegion::Mem2MainAppCodeGen,
        PhysicalRegion::Mem2MainAppCode,
    ];
}

/// Named ranges of a process' virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VirtualRegion {
    SystemLibraries,
    AppCode,
    AppData,
    /// Window for [`VirtualMemoryManager::alloc_virt_addr`], not backed by any
    /// fixed physical region.
    VirtualMapRange,
    ForegroundBucket,
    LoaderGlobals,
    Mem1,
    SharedData,
    KernelIpcBuffers,
}

/// The kind of process an address space is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Kernel,
    Loader,
    ForegroundApp,
    OverlayApp,
}

/// Access rights of a guest mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapPermission {
    ReadOnly,
    ReadWrite,
}
