use crate::addr::{align_up, PhysAddr, PhysicalRange, VirtAddr, VirtualRange};
use crate::memory::backend::{MemoryBackend, PageTable};
use crate::memory::map::{PhysicalMemoryMap, VirtualMemoryMap};
use crate::memory::{
    MapPermission, PhysicalRegion, ProcessRole, VirtualRegion, APP_RESERVED_SIZE, MAX_CODE_SIZE,
    MIN_CODE_SIZE, PAGE_SIZE,
};
use crate::Error;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use smallvec::SmallVec;

/// What a virtual address inside the virtual map range currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualMemoryType {
    /// The address is outside of the range the query is allowed to inspect.
    Invalid,
    Free,
    Reserved,
    MappedReadOnly,
    MappedReadWrite,
}

struct Inner {
    physical: PhysicalMemoryMap,
    regions: VirtualMemoryMap,
    backend: Box<dyn MemoryBackend>,
    /// Live `alloc_virt_addr` allocations inside the virtual map range, start -> size.
    allocations: BTreeMap<u32, u32>,
}

/// The address space of one process role.
///
/// Mapping churn is rare (boot and process lifecycle transitions), so the
/// whole region table sits behind a single lock.
pub struct VirtualMemoryManager {
    inner: spin::Mutex<Inner>,
}

impl core::fmt::Debug for VirtualMemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VirtualMemoryManager")
            .field("physical", &inner.physical)
            .field("regions", &inner.regions)
            .field("allocations", &inner.allocations)
            .finish_non_exhaustive()
    }
}

impl VirtualMemoryManager {
    pub fn new(role: ProcessRole) -> Self {
        Self::with_backend(role, Box::new(PageTable::new()))
    }

    pub fn with_backend(role: ProcessRole, backend: Box<dyn MemoryBackend>) -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                physical: PhysicalMemoryMap::default(),
                regions: VirtualMemoryMap::for_role(role),
                backend,
                allocations: BTreeMap::new(),
            }),
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.inner.lock().regions.role()
    }

    /// Maps `region` onto its backing physical region.
    ///
    /// Mapping an already mapped region does nothing.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if `region` is not part of this
    /// address space or has no fitting physical backing, or with the backend's
    /// error. On failure nothing stays reserved and the region remains
    /// unmapped, callers treat that as fatal.
    pub fn map(&self, region: VirtualRegion) -> crate::Result<()> {
        self.inner.lock().map(region)
    }

    /// Tears down the mapping of `region`. Unmapping an unmapped region does nothing.
    ///
    /// Failures are logged and otherwise ignored, the region is always
    /// considered unmapped afterwards.
    pub fn unmap(&self, region: VirtualRegion) {
        self.inner.lock().unmap(region);
    }

    /// Partitions the main application heap and maps the app code and data windows.
    ///
    /// Working backwards from the end of the heap the layout is code,
    /// code-gen, a fixed reserved block, the available region, and whatever is
    /// left at the front becomes the data region.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfMemory`] if the split does not fit into the
    /// heap. If mapping the new windows fails, the previous layout is restored
    /// and the backend's error is returned.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn initialise_app_memory(
        &self,
        code_size: u32,
        code_gen_size: u32,
        avail_size: u32,
    ) -> crate::Result<()> {
        let mut inner = self.inner.lock();
        if inner.regions.entry(VirtualRegion::AppCode).is_none() {
            tracing::error!("{:?} address space has no app code window", inner.regions.role());
            return Err(Error::InvalidArgument);
        }

        let page_align = |size: u32| align_up(size, PAGE_SIZE).ok_or(Error::OutOfMemory);
        let code_size = page_align(code_size.clamp(MIN_CODE_SIZE, MAX_CODE_SIZE))?;
        let code_gen_size = page_align(code_gen_size)?;
        let avail_size = page_align(avail_size)?;

        let heap = inner.physical.range(PhysicalRegion::Mem2MainApp);
        let tail = u64::from(code_size)
            + u64::from(code_gen_size)
            + u64::from(APP_RESERVED_SIZE)
            + u64::from(avail_size);
        let tail = match u32::try_from(tail) {
            Ok(tail) if tail < heap.size => tail,
            _ => {
                tracing::error!(
                    "app memory split of {tail:#x} bytes does not fit into {heap}, code {code_size:#x} \
                     codegen {code_gen_size:#x} avail {avail_size:#x}"
                );
                return Err(Error::OutOfMemory);
            }
        };

        // tail < heap.size, so every region below ends inside the heap
        let data_size = heap.size - tail;
        let avail_start = heap.start.get() + data_size;
        let reserved_start = avail_start + avail_size;
        let code_gen_start = reserved_start + APP_RESERVED_SIZE;
        let code_start = code_gen_start + code_gen_size;

        inner.unmap(VirtualRegion::AppCode);
        inner.unmap(VirtualRegion::AppData);
        let saved_physical = inner.physical.clone();
        let saved_regions = inner.regions.clone();

        let split = [
            (PhysicalRegion::Mem2MainAppData, heap.start.get(), data_size),
            (PhysicalRegion::Mem2MainAppAvailable, avail_start, avail_size),
            (PhysicalRegion::Mem2MainAppReserved, reserved_start, APP_RESERVED_SIZE),
            (PhysicalRegion::Mem2MainAppCodeGen, code_gen_start, code_gen_size),
            (PhysicalRegion::Mem2MainAppCode, code_start, code_size),
        ];
        for (region, start, size) in split {
            inner
                .physical
                .set_range(region, PhysicalRange::new(start, size));
        }

        for (region, size) in [(VirtualRegion::AppCode, code_size), (VirtualRegion::AppData, data_size)] {
            if let Some(entry) = inner.regions.entry_mut(region) {
                entry.range.size = size;
            }
        }

        let result = match inner.map(VirtualRegion::AppCode) {
            Ok(()) => {
                let result = inner.map(VirtualRegion::AppData);
                if result.is_err() {
                    inner.unmap(VirtualRegion::AppCode);
                }
                result
            }
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            inner.physical = saved_physical;
            inner.regions = saved_regions;
            return Err(err);
        }

        tracing::debug!(
            "app memory: code {} data {}",
            inner.physical.range(PhysicalRegion::Mem2MainAppCode),
            inner.physical.range(PhysicalRegion::Mem2MainAppData),
        );
        Ok(())
    }

    /// Unmaps the app code and data windows, used on process exit.
    pub fn free_app_memory(&self) {
        let mut inner = self.inner.lock();
        inner.unmap(VirtualRegion::AppCode);
        inner.unmap(VirtualRegion::AppData);
    }

    /// Reserves a range inside the virtual map range.
    ///
    /// A non-null `address` requests that exact spot (aligned up to
    /// `alignment`), otherwise the lowest free range that fits is picked.
    /// Returns [`VirtAddr::NULL`] on failure.
    pub fn alloc_virt_addr(&self, address: VirtAddr, size: u32, alignment: u32) -> VirtAddr {
        let mut inner = self.inner.lock();
        match inner.alloc_virt_addr(address, size, alignment) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::debug!("alloc_virt_addr({address}, {size:#x}, {alignment:#x}) failed: {err}");
                VirtAddr::NULL
            }
        }
    }

    /// Releases a range previously returned by [`Self::alloc_virt_addr`].
    pub fn free_virt_addr(&self, address: VirtAddr, size: u32) -> bool {
        let mut inner = self.inner.lock();
        let Some(size) = align_up(size, PAGE_SIZE) else {
            return false;
        };
        if inner.allocations.get(&address.get()) != Some(&size) {
            tracing::warn!("free_virt_addr({address}, {size:#x}) does not match an allocation");
            return false;
        }

        inner.allocations.remove(&address.get());
        if let Err(err) = inner.backend.free(VirtualRange { start: address, size }) {
            tracing::warn!("failed to free virtual range {address} + {size:#x}: {err}");
        }
        true
    }

    /// Maps physical memory into an allocated part of the virtual map range.
    pub fn map_memory(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        size: u32,
        permission: MapPermission,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(range) = inner.checked_map_range(virt, size) else {
            return false;
        };
        if !phys.is_aligned(PAGE_SIZE)
            || inner
                .physical
                .region_containing(&PhysicalRange { start: phys, size })
                .is_none()
        {
            tracing::warn!("map_memory: invalid physical range {phys} + {size:#x}");
            return false;
        }

        match inner.backend.map(range, phys, permission) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("map_memory({virt}, {phys}, {size:#x}) failed: {err}");
                false
            }
        }
    }

    pub fn unmap_memory(&self, virt: VirtAddr, size: u32) -> bool {
        let mut inner = self.inner.lock();
        let Some(range) = inner.checked_map_range(virt, size) else {
            return false;
        };

        match inner.backend.unmap(range) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("unmap_memory({virt}, {size:#x}) failed: {err}");
                false
            }
        }
    }

    /// Queries an address inside the virtual map range, anything outside of it is [`VirtualMemoryType::Invalid`].
    pub fn query_virt_addr(&self, virt: VirtAddr) -> VirtualMemoryType {
        let inner = self.inner.lock();
        match inner.virtual_map_range() {
            Some(window) if window.contains(virt) => inner.backend.query(virt),
            _ => VirtualMemoryType::Invalid,
        }
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.inner.lock().backend.translate(virt)
    }

    pub fn virtual_range(&self, region: VirtualRegion) -> Option<VirtualRange> {
        self.inner.lock().regions.entry(region).map(|e| e.range)
    }

    pub fn physical_range(&self, region: PhysicalRegion) -> PhysicalRange {
        self.inner.lock().physical.range(region)
    }

    pub fn is_mapped(&self, region: VirtualRegion) -> bool {
        self.inner
            .lock()
            .regions
            .entry(region)
            .is_some_and(|e| e.mapped)
    }

    pub fn mapped_regions(&self) -> SmallVec<[VirtualRegion; 10]> {
        self.inner
            .lock()
            .regions
            .entries()
            .filter(|e| e.mapped)
            .map(|e| e.region)
            .collect()
    }

    pub fn virtual_map_range(&self) -> Option<VirtualRange> {
        self.inner.lock().virtual_map_range()
    }

    pub fn data_physical_range(&self) -> PhysicalRange {
        self.physical_range(PhysicalRegion::Mem2MainAppData)
    }

    pub fn available_physical_range(&self) -> PhysicalRange {
        self.physical_range(PhysicalRegion::Mem2MainAppAvailable)
    }

    pub fn foreground_bucket_range(&self) -> Option<VirtualRange> {
        self.virtual_range(VirtualRegion::ForegroundBucket)
    }
}

fn to_virt_addr(address: u64) -> crate::Result<VirtAddr> {
    u32::try_from(address)
        .map(VirtAddr::new)
        .map_err(|_| Error::OutOfMemory)
}

impl Inner {
    fn map(&mut self, region: VirtualRegion) -> crate::Result<()> {
        let Some(entry) = self.regions.entry(region).copied() else {
            tracing::error!("{region:?} is not part of the {:?} address space", self.regions.role());
            return Err(Error::InvalidArgument);
        };
        if entry.mapped {
            return Ok(());
        }
        if entry.physical == PhysicalRegion::Invalid {
            tracing::error!("{region:?} has no fixed physical backing and cannot be mapped");
            return Err(Error::InvalidArgument);
        }

        let phys = self.physical.range(entry.physical);
        if entry.range.is_empty() || entry.range.size != phys.size {
            tracing::error!(
                "size mismatch mapping {region:?} {} onto {:?} {phys}",
                entry.range,
                entry.physical
            );
            return Err(Error::InvalidArgument);
        }

        if let Err(err) = self.backend.reserve(entry.range) {
            tracing::error!("failed to reserve {region:?} at {}: {err}", entry.range);
            return Err(err);
        }
        if let Err(err) = self.backend.map(entry.range, phys.start, entry.permission) {
            tracing::error!("failed to map {region:?} {} to {phys}: {err}", entry.range);
            if let Err(err) = self.backend.free(entry.range) {
                tracing::warn!("failed to release reservation of {region:?}: {err}");
            }
            return Err(err);
        }

        if let Some(entry) = self.regions.entry_mut(region) {
            entry.mapped = true;
        }
        tracing::debug!("mapped {region:?} {} -> {phys}", entry.range);
        Ok(())
    }

    fn unmap(&mut self, region: VirtualRegion) {
        let Some(entry) = self.regions.entry_mut(region) else {
            return;
        };
        if !entry.mapped {
            return;
        }
        entry.mapped = false;
        let range = entry.range;

        if let Err(err) = self.backend.unmap(range) {
            tracing::warn!("failed to unmap {region:?} {range}: {err}");
        }
        if let Err(err) = self.backend.free(range) {
            tracing::warn!("failed to free {region:?} {range}: {err}");
        }
        tracing::debug!("unmapped {region:?} {range}");
    }

    fn virtual_map_range(&self) -> Option<VirtualRange> {
        self.regions
            .entry(VirtualRegion::VirtualMapRange)
            .map(|e| e.range)
    }

    fn alloc_virt_addr(
        &mut self,
        address: VirtAddr,
        size: u32,
        alignment: u32,
    ) -> crate::Result<VirtAddr> {
        let window = self.virtual_map_range().ok_or(Error::InvalidArgument)?;
        if size == 0 || (alignment != 0 && !alignment.is_power_of_two()) {
            return Err(Error::InvalidArgument);
        }
        let alignment = alignment.max(PAGE_SIZE);
        let size = align_up(size, PAGE_SIZE).ok_or(Error::OutOfMemory)?;

        let start = if address.is_null() {
            self.find_free_range(window, size, alignment)?
        } else {
            let start = address
                .align_up(alignment)
                .ok_or(Error::InvalidAddress(address.get()))?;
            if !window.contains_range(start, size) {
                return Err(Error::InvalidAddress(address.get()));
            }
            start
        };

        let range = VirtualRange { start, size };
        self.backend.reserve(range)?;
        self.allocations.insert(start.get(), size);
        Ok(start)
    }

    /// First fit, lowest address first.
    fn find_free_range(
        &self,
        window: VirtualRange,
        size: u32,
        alignment: u32,
    ) -> crate::Result<VirtAddr> {
        let fits = |candidate: u64, limit: u64| candidate + u64::from(size) <= limit;
        let align = |cursor: u64| (cursor + u64::from(alignment) - 1) & !(u64::from(alignment) - 1);

        let mut cursor = u64::from(window.start.get());
        for (&start, &alloc_size) in self.allocations.range(window.start.get()..) {
            let candidate = align(cursor);
            if fits(candidate, u64::from(start)) {
                return to_virt_addr(candidate);
            }
            cursor = cursor.max(u64::from(start) + u64::from(alloc_size));
        }

        let candidate = align(cursor);
        if fits(candidate, window.end()) {
            to_virt_addr(candidate)
        } else {
            Err(Error::OutOfMemory)
        }
    }

    fn checked_map_range(&self, virt: VirtAddr, size: u32) -> Option<VirtualRange> {
        let window = self.virtual_map_range()?;
        if size == 0 || size % PAGE_SIZE != 0 || !virt.is_aligned(PAGE_SIZE) {
            tracing::warn!("unaligned virtual map request {virt} + {size:#x}");
            return None;
        }
        if !window.contains_range(virt, size) {
            tracing::warn!("{virt} + {size:#x} is outside of the virtual map range {window}");
            return None;
        }
        Some(VirtualRange { start: virt, size })
    }
}
