use crate::guest_memory::usize_is_multiple_of_host_page_size;
use crate::host_page_size;
use core::ops::Range;
use core::ptr;
use core::ptr::NonNull;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};

/// Access granted to a committed part of a [`Mmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadWriteExecute,
}

impl Protection {
    fn flags(self) -> MprotectFlags {
        match self {
            Protection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
            Protection::ReadWriteExecute => {
                MprotectFlags::READ | MprotectFlags::WRITE | MprotectFlags::EXEC
            }
        }
    }
}

/// An anonymous host memory reservation.
///
/// The whole range is reserved inaccessible up front and parts of it are made
/// accessible on demand, so the base address stays stable for the lifetime of
/// the reservation.
#[derive(Debug)]
pub struct Mmap {
    memory: NonNull<[u8]>,
}

// SAFETY: `Mmap` owns its mapping exclusively, the raw pointer is only an address.
unsafe impl Send for Mmap {}
// SAFETY: see above, all mutation goes through `&mut self` or the callers own synchronization.
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn new_empty() -> Self {
        Self {
            memory: NonNull::slice_from_raw_parts(NonNull::dangling(), 0),
        }
    }

    /// Reserves `size` bytes of address space without making any of it accessible.
    ///
    /// # Errors
    ///
    /// Returns the host error if the reservation fails.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of the host page size.
    pub fn with_reserve(size: usize) -> crate::Result<Self> {
        assert!(usize_is_multiple_of_host_page_size(size));
        if size == 0 {
            return Ok(Self::new_empty());
        }

        // SAFETY: we request a fresh anonymous mapping, nothing else can alias it.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                size,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )?
        };

        let memory = ptr::slice_from_raw_parts_mut(ptr.cast::<u8>(), size);
        let memory = NonNull::new(memory).ok_or(crate::Error::OutOfMemory)?;
        Ok(Mmap { memory })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.memory.as_ptr().cast_const().cast()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.memory.as_ptr().cast()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes `range` accessible with the given protection.
    ///
    /// # Errors
    ///
    /// Returns the host error if `mprotect` fails.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not page aligned or not within the reservation.
    pub fn commit(&self, range: Range<usize>, protection: Protection) -> crate::Result<()> {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len());
        assert_eq!(
            range.start % host_page_size(),
            0,
            "changing of protections isn't page-aligned",
        );

        if range.is_empty() {
            return Ok(());
        }

        // SAFETY: the range was checked to lie within our own mapping.
        unsafe {
            let base = self.memory.as_ptr().cast::<u8>().add(range.start).cast();
            rustix::mm::mprotect(base, range.end - range.start, protection.flags())?;
        }

        Ok(())
    }

    /// Makes `range` inaccessible again and hands the backing pages back to the host.
    ///
    /// # Errors
    ///
    /// Returns the host error if releasing the pages fails.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not within the reservation.
    pub fn decommit(&self, range: Range<usize>) -> crate::Result<()> {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len());

        if range.is_empty() {
            return Ok(());
        }

        // SAFETY: the range was checked to lie within our own mapping. Callers
        // guarantee no references into the range outlive this call.
        unsafe {
            let base = self.memory.as_ptr().cast::<u8>().add(range.start).cast();
            let len = range.end - range.start;
            cfg_if::cfg_if! {
                if #[cfg(any(target_os = "linux", target_os = "android"))] {
                    rustix::mm::madvise(base, len, rustix::mm::Advice::LinuxDontNeed)?;
                }
            }
            rustix::mm::mprotect(base, len, MprotectFlags::empty())?;
        }

        Ok(())
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        let len = self.len();
        if len == 0 {
            return;
        }

        // SAFETY: we own the mapping and nobody can observe it after drop.
        if let Err(err) = unsafe { rustix::mm::munmap(self.memory.as_ptr().cast(), len) } {
            tracing::warn!("munmap of {len:#x} bytes failed: {err}");
        }
    }
}
