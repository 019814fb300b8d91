use crate::addr::{PhysicalRange, VirtualRange};
use crate::memory::{MapPermission, PhysicalRegion, ProcessRole, VirtualRegion};
use smallvec::SmallVec;

const NUM_PHYSICAL_REGIONS: usize = PhysicalRegion::ALL.len() + 1;

/// Boundaries of every [`PhysicalRegion`].
///
/// Everything except the main application split is fixed at boot, the split
/// regions stay empty until the application heap is partitioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalMemoryMap {
    ranges: [PhysicalRange; NUM_PHYSICAL_REGIONS],
}

impl Default for PhysicalMemoryMap {
    fn default() -> Self {
        let mut ranges = [PhysicalRange::EMPTY; NUM_PHYSICAL_REGIONS];
        let mut set = |region: PhysicalRegion, start: u32, size: u32| {
            ranges[region as usize] = PhysicalRange::new(start, size);
        };

        set(PhysicalRegion::Mem1, 0x0000_0000, 0x0200_0000);
        set(PhysicalRegion::Mem0, 0x0800_0000, 0x002E_0000);
        set(PhysicalRegion::Mem0IpcBuffers, 0x0812_0000, 0x0002_0000);
        set(PhysicalRegion::Mem2, 0x1000_0000, 0x8000_0000);
        set(PhysicalRegion::Mem2KernelHeap, 0x1000_0000, 0x0200_0000);
        set(PhysicalRegion::Mem2SystemLibraries, 0x1200_0000, 0x0080_0000);
        set(PhysicalRegion::Mem2LoaderGlobals, 0x1300_0000, 0x0020_0000);
        set(PhysicalRegion::Mem2SharedData, 0x1800_0000, 0x0300_0000);
        set(PhysicalRegion::Mem2ForegroundBucket, 0x1B00_0000, 0x0400_0000);
        set(PhysicalRegion::Mem2OverlayApp, 0x2800_0000, 0x0800_0000);
        set(PhysicalRegion::Mem2MainApp, 0x5000_0000, 0x4000_0000);

        Self { ranges }
    }
}

impl PhysicalMemoryMap {
    #[inline]
    pub fn range(&self, region: PhysicalRegion) -> PhysicalRange {
        self.ranges[region as usize]
    }

    pub(crate) fn set_range(&mut self, region: PhysicalRegion, range: PhysicalRange) {
        debug_assert!(region != PhysicalRegion::Invalid);
        self.ranges[region as usize] = range;
    }

    /// The most specific known region containing `range`, if any.
    pub fn region_containing(&self, range: &PhysicalRange) -> Option<PhysicalRegion> {
        PhysicalRegion::ALL
            .iter()
            .rev()
            .copied()
            .find(|region| {
                let r = self.range(*region);
                !r.is_empty() && r.contains_range(range.start, range.size)
            })
    }
}

/// One row of a role's virtual region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualMapEntry {
    pub region: VirtualRegion,
    pub range: VirtualRange,
    pub physical: PhysicalRegion,
    pub permission: MapPermission,
    pub mapped: bool,
}

/// The virtual region table of one process role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMemoryMap {
    role: ProcessRole,
    entries: SmallVec<[VirtualMapEntry; 10]>,
}

impl VirtualMemoryMap {
    pub fn for_role(role: ProcessRole) -> Self {
        use MapPermission::{ReadOnly, ReadWrite};
        use PhysicalRegion as P;
        use VirtualRegion as V;

        let entry = |region, start, size, physical, permission| VirtualMapEntry {
            region,
            range: VirtualRange::new(start, size),
            physical,
            permission,
            mapped: false,
        };

        let system_libraries = entry(V::SystemLibraries, 0x0100_0000, 0x0080_0000, P::Mem2SystemLibraries, ReadOnly);
        let app_code = entry(V::AppCode, 0x0200_0000, 0, P::Mem2MainAppCode, ReadOnly);
        let app_data = entry(V::AppData, 0x1000_0000, 0, P::Mem2MainAppData, ReadWrite);
        let virtual_map = entry(V::VirtualMapRange, 0xA000_0000, 0x4000_0000, P::Invalid, ReadWrite);
        let bucket = entry(V::ForegroundBucket, 0xE000_0000, 0x0400_0000, P::Mem2ForegroundBucket, ReadWrite);
        let loader_globals = entry(V::LoaderGlobals, 0xEFE0_0000, 0x0020_0000, P::Mem2LoaderGlobals, ReadWrite);
        let mem1 = entry(V::Mem1, 0xF400_0000, 0x0200_0000, P::Mem1, ReadWrite);
        let shared_data = entry(V::SharedData, 0xF800_0000, 0x0300_0000, P::Mem2SharedData, ReadOnly);
        let ipc_buffers = entry(V::KernelIpcBuffers, 0xFF20_0000, 0x0002_0000, P::Mem0IpcBuffers, ReadWrite);

        let entries = match role {
            ProcessRole::Kernel => SmallVec::from_slice(&[bucket, mem1, shared_data, ipc_buffers]),
            ProcessRole::Loader => SmallVec::from_slice(&[
                system_libraries,
                app_code,
                app_data,
                loader_globals,
                shared_data,
            ]),
            ProcessRole::ForegroundApp => SmallVec::from_slice(&[
                system_libraries,
                app_code,
                app_data,
                virtual_map,
                bucket,
                loader_globals,
                mem1,
                shared_data,
            ]),
            ProcessRole::OverlayApp => SmallVec::from_slice(&[
                system_libraries,
                VirtualMapEntry {
                    range: VirtualRange::new(0x1000_0000, 0x0800_0000),
                    physical: P::Mem2OverlayApp,
                    ..app_data
                },
                virtual_map,
                shared_data,
            ]),
        };

        Self { role, entries }
    }

    #[inline]
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn entry(&self, region: VirtualRegion) -> Option<&VirtualMapEntry> {
        self.entries.iter().find(|e| e.region == region)
    }

    pub(crate) fn entry_mut(&mut self, region: VirtualRegion) -> Option<&mut VirtualMapEntry> {
        self.entries.iter_mut().find(|e| e.region == region)
    }

    pub fn entries(&self) -> impl Iterator<Item = &VirtualMapEntry> + '_ {
        self.entries.iter()
    }
}
