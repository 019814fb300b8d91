use crate::addr::{PhysAddr, VirtAddr, VirtualRange};
use crate::memory::manager::VirtualMemoryType;
use crate::memory::MapPermission;
use crate::Error;
use alloc::collections::BTreeMap;
use smallvec::SmallVec;

/// The layer that actually establishes guest mappings.
///
/// [`VirtualMemoryManager`](crate::memory::VirtualMemoryManager) decides *what*
/// gets mapped where, a backend carries it out. Reservations claim a virtual
/// range, mappings bind parts of a reservation to physical memory.
///
/// # Errors
///
/// Every operation fails with [`Error::InvalidAddress`] when `range` clashes
/// with the existing reservations or mappings, and with
/// [`Error::InvalidArgument`] when it is empty.
pub trait MemoryBackend: Send {
    /// # Errors
    ///
    /// Fails if `range` is empty or overlaps another reservation.
    fn reserve(&mut self, range: VirtualRange) -> crate::Result<()>;
    /// Releases a reservation created by [`MemoryBackend::reserve`], dropping
    /// any mappings still inside of it.
    ///
    /// # Errors
    ///
    /// Fails unless `range` is exactly one reservation.
    fn free(&mut self, range: VirtualRange) -> crate::Result<()>;
    /// # Errors
    ///
    /// Fails unless `range` lies within one reservation and overlaps no
    /// existing mapping.
    fn map(
        &mut self,
        range: VirtualRange,
        phys: PhysAddr,
        permission: MapPermission,
    ) -> crate::Result<()>;
    /// # Errors
    ///
    /// Fails if nothing is mapped within `range`.
    fn unmap(&mut self, range: VirtualRange) -> crate::Result<()>;
    fn query(&self, addr: VirtAddr) -> VirtualMemoryType;
    fn translate(&self, addr: VirtAddr) -> Option<PhysAddr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    size: u32,
    phys: PhysAddr,
    permission: MapPermission,
}

/// A software page table: ordered tables of reservations and mappings.
#[derive(Debug, Default)]
pub struct PageTable {
    reservations: BTreeMap<u32, u32>,
    mappings: BTreeMap<u32, Mapping>,
}

fn end_of(start: u32, size: u32) -> u64 {
    u64::from(start) + u64::from(size)
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn reservation_containing(&self, range: VirtualRange) -> Option<(u32, u32)> {
        let (&start, &size) = self.reservations.range(..=range.start.get()).next_back()?;
        (range.end() <= end_of(start, size)).then_some((start, size))
    }

    fn overlapping_mappings(&self, range: VirtualRange) -> SmallVec<[(u32, Mapping); 4]> {
        let mut found = SmallVec::new();
        if let Some((&start, mapping)) = self.mappings.range(..range.start.get()).next_back() {
            if end_of(start, mapping.size) > u64::from(range.start.get()) {
                found.push((start, *mapping));
            }
        }
        for (&start, mapping) in self.mappings.range(range.start.get()..) {
            if u64::from(start) >= range.end() {
                break;
            }
            found.push((start, *mapping));
        }
        found
    }
}

impl MemoryBackend for PageTable {
    fn reserve(&mut self, range: VirtualRange) -> crate::Result<()> {
        if range.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let before = self.reservations.range(..=range.start.get()).next_back();
        if let Some((&start, &size)) = before {
            if end_of(start, size) > u64::from(range.start.get()) {
                return Err(Error::InvalidAddress(range.start.get()));
            }
        }
        let after = self.reservations.range(range.start.get()..).next();
        if let Some((&start, _)) = after {
            if u64::from(start) < range.end() {
                return Err(Error::InvalidAddress(start));
            }
        }

        self.reservations.insert(range.start.get(), range.size);
        Ok(())
    }

    fn free(&mut self, range: VirtualRange) -> crate::Result<()> {
        match self.reservations.get(&range.start.get()) {
            Some(&size) if size == range.size => {}
            _ => return Err(Error::InvalidAddress(range.start.get())),
        }

        for (start, _) in self.overlapping_mappings(range) {
            self.mappings.remove(&start);
        }
        self.reservations.remove(&range.start.get());
        Ok(())
    }

    fn map(
        &mut self,
        range: VirtualRange,
        phys: PhysAddr,
        permission: MapPermission,
    ) -> crate::Result<()> {
        if range.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if self.reservation_containing(range).is_none() {
            return Err(Error::InvalidAddress(range.start.get()));
        }
        if !self.overlapping_mappings(range).is_empty() {
            return Err(Error::InvalidAddress(range.start.get()));
        }

        self.mappings.insert(
            range.start.get(),
            Mapping {
                size: range.size,
                phys,
                permission,
            },
        );
        Ok(())
    }

    fn unmap(&mut self, range: VirtualRange) -> crate::Result<()> {
        let overlapping = self.overlapping_mappings(range);
        if overlapping.is_empty() {
            return Err(Error::InvalidAddress(range.start.get()));
        }

        for (start, mapping) in overlapping {
            self.mappings.remove(&start);

            // keep whatever sticks out on either side of the unmapped range
            let unmap_start = range.start.get().max(start);
            if unmap_start > start {
                let head = unmap_start - start;
                self.mappings.insert(start, Mapping { size: head, ..mapping });
            }
            let mapping_end = end_of(start, mapping.size);
            if mapping_end > range.end() {
                // below the mapping's end, so within the address space
                let tail_start = range
                    .start
                    .get()
                    .checked_add(range.size)
                    .ok_or(Error::InvalidAddress(range.start.get()))?;
                let skipped = tail_start - start;
                self.mappings.insert(
                    tail_start,
                    Mapping {
                        size: mapping.size - skipped,
                        phys: PhysAddr::new(mapping.phys.get() + skipped),
                        permission: mapping.permission,
                    },
                );
            }
        }
        Ok(())
    }

    fn query(&self, addr: VirtAddr) -> VirtualMemoryType {
        let byte = VirtualRange {
            start: addr,
            size: 1,
        };
        if let Some((_, mapping)) = self.overlapping_mappings(byte).first() {
            return match mapping.permission {
                MapPermission::ReadOnly => VirtualMemoryType::MappedReadOnly,
                MapPermission::ReadWrite => VirtualMemoryType::MappedReadWrite,
            };
        }
        if self.reservation_containing(byte).is_some() {
            VirtualMemoryType::Reserved
        } else {
            VirtualMemoryType::Free
        }
    }

    fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        let (&start, mapping) = self.mappings.range(..=addr.get()).next_back()?;
        let offset = addr.get() - start;
        (offset < mapping.size).then(|| PhysAddr::new(mapping.phys.get() + offset))
    }
}
