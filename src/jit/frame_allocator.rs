use crate::guest_memory::{round_usize_up_to, round_usize_up_to_host_pages, Mmap, Protection};
use crate::Error;
use core::fmt;
use core::ptr::NonNull;

#[derive(Debug, Default, Clone, Copy)]
struct FrameState {
    committed: usize,
    allocated: usize,
}

/// A bump allocator over a fixed host reservation.
///
/// Memory is committed in `commit_step` sized increments as the allocation
/// offset grows. Offsets handed out stay valid until [`FrameAllocator::reset`]
/// or [`FrameAllocator::release`].
pub struct FrameAllocator {
    name: &'static str,
    mmap: Mmap,
    protection: Protection,
    commit_step: usize,
    state: spin::Mutex<FrameState>,
}

impl fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("FrameAllocator")
            .field("name", &self.name)
            .field("base", &self.mmap.as_ptr())
            .field("reserved", &self.mmap.len())
            .field("committed", &state.committed)
            .field("allocated", &state.allocated)
            .finish()
    }
}

impl FrameAllocator {
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the sizes overflow when rounded to
    /// host pages, or the host error if the reservation fails.
    pub fn new(
        name: &'static str,
        reserve: usize,
        commit_step: usize,
        protection: Protection,
    ) -> crate::Result<Self> {
        let reserve = round_usize_up_to_host_pages(reserve).ok_or(Error::OutOfMemory)?;
        let commit_step = round_usize_up_to_host_pages(commit_step.max(1)).ok_or(Error::OutOfMemory)?;

        Ok(Self {
            name,
            mmap: Mmap::with_reserve(reserve)?,
            protection,
            commit_step,
            state: spin::Mutex::new(FrameState::default()),
        })
    }

    /// Hands out `size` bytes aligned to `alignment`, returning their offset.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfMemory`] only once the reservation itself is
    /// exhausted, in which case the allocator is left untouched. Host errors
    /// from committing more memory are passed through.
    pub fn allocate(&self, size: usize, alignment: usize) -> crate::Result<usize> {
        debug_assert!(alignment.is_power_of_two());
        let mut state = self.state.lock();

        let start = round_usize_up_to(state.allocated, alignment).ok_or(Error::OutOfMemory)?;
        let end = start.checked_add(size).ok_or(Error::OutOfMemory)?;
        if end > self.mmap.len() {
            tracing::error!(
                allocator = self.name,
                size,
                allocated = state.allocated,
                reserved = self.mmap.len(),
                "frame allocator exhausted"
            );
            return Err(Error::OutOfMemory);
        }

        if end > state.committed {
            let commit_end = round_usize_up_to(end, self.commit_step)
                .unwrap_or(usize::MAX)
                .min(self.mmap.len());
            self.mmap.commit(state.committed..commit_end, self.protection)?;
            tracing::trace!(allocator = self.name, "committed {:#x}..{commit_end:#x}", state.committed);
            state.committed = commit_end;
        }

        state.allocated = end;
        Ok(start)
    }

    /// Host pointer to the byte at `offset`.
    #[inline]
    pub fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.mmap.len());
        self.mmap.as_mut_ptr().wrapping_add(offset)
    }

    /// Copies `bytes` into previously allocated memory at `offset`.
    ///
    /// # Safety
    ///
    /// `offset..offset + bytes.len()` must come from a single [`FrameAllocator::allocate`]
    /// call and must not be read concurrently.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.state.lock().allocated);
        // SAFETY: ensured by the caller, the range is committed and writable.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr(offset), bytes.len()) }
    }

    /// Moves `value` into freshly allocated memory.
    ///
    /// The value is never dropped, its memory is reclaimed by
    /// [`FrameAllocator::reset`] or [`FrameAllocator::release`].
    ///
    /// # Errors
    ///
    /// See [`FrameAllocator::allocate`].
    pub fn emplace<T>(&self, value: T) -> crate::Result<NonNull<T>> {
        let offset = self.allocate(size_of::<T>(), align_of::<T>())?;
        #[expect(clippy::cast_ptr_alignment, reason = "allocated with the alignment of T")]
        let ptr = self.ptr(offset).cast::<T>();
        // SAFETY: the range was just allocated for a `T` and nobody else knows about it.
        unsafe { ptr.write(value) };
        NonNull::new(ptr).ok_or(Error::OutOfMemory)
    }

    /// Rewinds the allocation offset to zero, keeping committed memory.
    pub fn reset(&mut self) {
        self.state.get_mut().allocated = 0;
    }

    /// Rewinds to zero and hands every committed page back to the host.
    ///
    /// # Errors
    ///
    /// Returns the host error if decommitting fails.
    pub fn release(&mut self) -> crate::Result<()> {
        let state = self.state.get_mut();
        let committed = state.committed;
        *state = FrameState::default();
        self.mmap.decommit(0..committed)
    }

    pub fn reserved(&self) -> usize {
        self.mmap.len()
    }

    pub fn committed(&self) -> usize {
        self.state.lock().committed
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    /// Whether `ptr` points into this allocator's reservation.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.mmap.as_ptr() as usize;
        (base..base + self.mmap.len()).contains(&(ptr as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_page_size;

    #[test]
    fn commits_in_steps() {
        let page = host_page_size();
        let alloc = FrameAllocator::new("test", 8 * page, 2 * page, Protection::ReadWrite).unwrap();
        assert_eq!(alloc.committed(), 0);

        assert_eq!(alloc.allocate(10, 1).unwrap(), 0);
        assert_eq!(alloc.committed(), 2 * page);
        assert_eq!(alloc.allocate(4, 16).unwrap(), 16);
        assert_eq!(alloc.allocated(), 20);

        alloc.allocate(2 * page, 1).unwrap();
        assert_eq!(alloc.committed(), 4 * page);
    }

    #[test]
    fn exhaustion_leaves_state_untouched() {
        let page = host_page_size();
        let alloc = FrameAllocator::new("test", 2 * page, page, Protection::ReadWrite).unwrap();
        alloc.allocate(page, 1).unwrap();

        assert_eq!(alloc.allocate(page + 1, 1), Err(Error::OutOfMemory));
        assert_eq!(alloc.allocated(), page);
        assert_eq!(alloc.committed(), page);

        assert_eq!(alloc.allocate(page, 1).unwrap(), page);
        assert_eq!(alloc.allocate(1, 1), Err(Error::OutOfMemory));
    }

    #[test]
    fn written_bytes_are_readable() {
        let page = host_page_size();
        let alloc = FrameAllocator::new("test", page, page, Protection::ReadWrite).unwrap();
        let offset = alloc.allocate(4, 4).unwrap();
        unsafe { alloc.write(offset, &[1, 2, 3, 4]) };
        let read = unsafe { core::slice::from_raw_parts(alloc.ptr(offset), 4) };
        assert_eq!(read, &[1, 2, 3, 4]);
    }

    #[test]
    fn emplaced_values_are_aligned() {
        let page = host_page_size();
        let alloc = FrameAllocator::new("test", page, page, Protection::ReadWrite).unwrap();
        alloc.allocate(3, 1).unwrap();

        let value = alloc.emplace(0x1122_3344_5566_7788_u64).unwrap();
        assert!(value.is_aligned());
        assert!(alloc.contains(value.as_ptr().cast_const().cast()));
        assert_eq!(unsafe { *value.as_ptr() }, 0x1122_3344_5566_7788);
        assert_eq!(alloc.allocated(), 16);
    }

    #[test]
    fn reset_rewinds() {
        let page = host_page_size();
        let mut alloc = FrameAllocator::new("test", page, page, Protection::ReadWrite).unwrap();
        alloc.allocate(100, 1).unwrap();
        alloc.reset();
        assert_eq!(alloc.allocated(), 0);
        assert_eq!(alloc.committed(), page);
        alloc.release().unwrap();
        assert_eq!(alloc.committed(), 0);
        assert_eq!(alloc.allocate(page, 1).unwrap(), 0);
    }
}
