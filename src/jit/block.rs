use crate::jit::index::CodeBlockIndex;
use crate::Error;
use alloc::boxed::Box;
use core::fmt;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

/// One compiled translation unit.
///
/// Immutable once registered apart from its profiling counters. Self-modifying
/// guest code is handled by invalidating the index and compiling a fresh block.
pub struct CodeBlock {
    address: u32,
    code: *const u8,
    code_size: usize,
    unwind: *const u8,
    unwind_size: usize,
    executions: AtomicU64,
    time_nanos: AtomicU64,
}

// SAFETY: the raw pointers refer to cache owned memory that is never written
// again after the block is published, the counters are atomics.
unsafe impl Send for CodeBlock {}
// SAFETY: see above.
unsafe impl Sync for CodeBlock {}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("address", &format_args!("{:#010x}", self.address))
            .field("code", &self.code)
            .field("code_size", &self.code_size)
            .field("unwind_size", &self.unwind_size)
            .field("executions", &self.executions())
            .finish_non_exhaustive()
    }
}

impl CodeBlock {
    pub(crate) fn new(
        address: u32,
        code: *const u8,
        code_size: usize,
        unwind: *const u8,
        unwind_size: usize,
    ) -> Self {
        Self {
            address,
            code,
            code_size,
            unwind,
            unwind_size,
            executions: AtomicU64::new(0),
            time_nanos: AtomicU64::new(0),
        }
    }

    /// Guest address of the first instruction.
    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Host entry point of the generated code.
    #[inline]
    pub fn entry(&self) -> *const u8 {
        self.code
    }

    pub fn code(&self) -> &[u8] {
        // SAFETY: `code` points at `code_size` committed bytes owned by the
        // cache, which cannot be cleared while `self` is borrowed from it.
        unsafe { core::slice::from_raw_parts(self.code, self.code_size) }
    }

    pub fn unwind_info(&self) -> &[u8] {
        if self.unwind_size == 0 {
            return &[];
        }
        // SAFETY: as for `code`.
        unsafe { core::slice::from_raw_parts(self.unwind, self.unwind_size) }
    }

    pub fn record_execution(&self, elapsed: Duration) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.time_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn total_time(&self) -> Duration {
        Duration::from_nanos(self.time_nanos.load(Ordering::Relaxed))
    }
}

const CHUNK_BITS: usize = 12;
const CHUNK_SIZE: usize = 1 << CHUNK_BITS;

struct Chunk {
    blocks: Box<[AtomicPtr<CodeBlock>]>,
}

impl Chunk {
    fn new() -> Box<Self> {
        Box::new(Self {
            blocks: (0..CHUNK_SIZE).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        })
    }
}

/// Append-only table of [`CodeBlock`]s, addressed by [`CodeBlockIndex`].
///
/// The records themselves live in the code cache's metadata allocator, the
/// store only maps indices to them. Slots live in lazily allocated fixed-size
/// chunks so that handing out a reference never races with growth.
pub struct BlockStore {
    chunks: Box<[AtomicPtr<Chunk>]>,
    capacity: usize,
    next: AtomicUsize,
}

impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl BlockStore {
    pub fn with_capacity(max_blocks: usize) -> Self {
        let max_blocks = max_blocks.min(usize::try_from(i32::MAX).unwrap_or(usize::MAX));
        let chunks = max_blocks.div_ceil(CHUNK_SIZE);
        Self {
            chunks: (0..chunks).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            capacity: max_blocks,
            next: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.next.load(Ordering::Acquire).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `block` and returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] once `capacity` blocks have been pushed.
    ///
    /// # Safety
    ///
    /// `block` must stay valid and unmodified until [`BlockStore::clear`] or
    /// the store is dropped.
    pub unsafe fn push(&self, block: NonNull<CodeBlock>) -> crate::Result<CodeBlockIndex> {
        let slot = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < self.capacity()).then_some(next + 1)
            })
            .map_err(|_| Error::OutOfMemory)?;
        let index = CodeBlockIndex::new(slot).ok_or(Error::OutOfMemory)?;

        let chunk = self.chunk_or_alloc(slot >> CHUNK_BITS);
        chunk.blocks[slot & (CHUNK_SIZE - 1)].store(block.as_ptr(), Ordering::Release);
        Ok(index)
    }

    pub fn get(&self, index: CodeBlockIndex) -> Option<&CodeBlock> {
        let slot = index.as_usize()?;
        let chunk = self.chunks.get(slot >> CHUNK_BITS)?.load(Ordering::Acquire);
        if chunk.is_null() {
            return None;
        }
        // SAFETY: published chunks stay alive until `clear` or drop, both of
        // which take `&mut self`.
        let chunk = unsafe { &*chunk };
        let block = chunk.blocks[slot & (CHUNK_SIZE - 1)].load(Ordering::Acquire);
        // SAFETY: `push` callers keep every record valid until `clear`.
        (!block.is_null()).then(|| unsafe { &*block })
    }

    pub fn iter(&self) -> impl Iterator<Item = &CodeBlock> + '_ {
        (0..self.len()).filter_map(|slot| self.get(CodeBlockIndex::new(slot)?))
    }

    fn chunk_or_alloc(&self, chunk: usize) -> &Chunk {
        let slot = &self.chunks[chunk];
        let current = slot.load(Ordering::Acquire);
        if !current.is_null() {
            // SAFETY: see `get`.
            return unsafe { &*current };
        }

        let fresh = Box::into_raw(Chunk::new());
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            // SAFETY: see `get`.
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // SAFETY: `fresh` lost the race and was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: see `get`.
                unsafe { &*winner }
            }
        }
    }

    /// Forgets every block. The records are reclaimed with their allocator.
    pub fn clear(&mut self) {
        for slot in self.chunks.iter_mut() {
            let chunk = core::mem::replace(slot.get_mut(), ptr::null_mut());
            if !chunk.is_null() {
                // SAFETY: `&mut self` proves no outstanding borrows, the
                // pointer came from `Box::into_raw`.
                drop(unsafe { Box::from_raw(chunk) });
            }
        }
        *self.next.get_mut() = 0;
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(address: u32) -> CodeBlock {
        CodeBlock::new(address, ptr::null(), 0, ptr::null(), 0)
    }

    fn push(store: &BlockStore, address: u32) -> crate::Result<CodeBlockIndex> {
        let record = NonNull::from(Box::leak(Box::new(block(address))));
        unsafe { store.push(record) }
    }

    #[test]
    fn push_and_get() {
        let store = BlockStore::with_capacity(2 * CHUNK_SIZE);
        let a = push(&store, 0x0200_0000).unwrap();
        let b = push(&store, 0x0200_0010).unwrap();
        assert_eq!(a.as_raw(), 0);
        assert_eq!(b.as_raw(), 1);
        assert_eq!(store.get(b).unwrap().address(), 0x0200_0010);
        assert!(store.get(CodeBlockIndex::from_raw(2)).is_none());
        assert!(store.get(CodeBlockIndex::UNCOMPILED).is_none());
    }

    #[test]
    fn capacity_is_enforced() {
        let store = BlockStore::with_capacity(CHUNK_SIZE + 1);
        assert_eq!(store.capacity(), CHUNK_SIZE + 1);
        for address in (0u32..).step_by(4).take(CHUNK_SIZE + 1) {
            push(&store, address).unwrap();
        }
        assert_eq!(push(&store, 0).unwrap_err(), Error::OutOfMemory);
        assert_eq!(store.len(), CHUNK_SIZE + 1);
    }

    #[test]
    fn clear_forgets_blocks() {
        let mut store = BlockStore::with_capacity(16);
        let index = push(&store, 0x100).unwrap();
        store.clear();
        assert!(store.get(index).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn profiling_counters() {
        let b = block(0);
        b.record_execution(Duration::from_micros(3));
        b.record_execution(Duration::from_micros(4));
        assert_eq!(b.executions(), 2);
        assert_eq!(b.total_time(), Duration::from_micros(7));
    }
}
