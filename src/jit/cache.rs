use crate::config::CodeCacheConfig;
use crate::guest_memory::Protection;
use crate::jit::block::{BlockStore, CodeBlock};
use crate::jit::frame_allocator::FrameAllocator;
use crate::jit::index::{CodeBlockIndex, CodeIndex, IndexCell};
use crate::jit::unwind::{host_unwind_registry, UnwindRegistry};
use crate::Error;
use alloc::boxed::Box;
use core::fmt;

/// Alignment of every block's entry point.
pub const CODE_ALIGNMENT: usize = 16;
const UNWIND_ALIGNMENT: usize = 8;

/// Outcome of [`CodeCache::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns compilation of this address and must eventually call
    /// [`CodeCache::set_block_index`] or [`CodeCache::abandon_claim`].
    Won,
    /// Another thread already published a block.
    Compiled(CodeBlockIndex),
    /// Another thread is compiling this address right now.
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatistics {
    pub blocks: usize,
    pub code_committed: usize,
    pub code_allocated: usize,
    pub data_committed: usize,
    pub data_allocated: usize,
}

/// Maps guest addresses to compiled host code and owns the memory it lives in.
pub struct CodeCache {
    index: CodeIndex,
    blocks: BlockStore,
    code: FrameAllocator,
    data: FrameAllocator,
    unwind: Box<dyn UnwindRegistry>,
}

impl fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("index", &self.index)
            .field("blocks", &self.blocks)
            .field("code", &self.code)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl CodeCache {
    /// Creates a cache that registers unwind info with the host unwinder.
    ///
    /// # Errors
    ///
    /// Returns the host error if reserving either arena fails.
    pub fn new(config: &CodeCacheConfig) -> crate::Result<Self> {
        Self::with_unwind_registry(config, host_unwind_registry())
    }

    /// # Errors
    ///
    /// See [`CodeCache::new`].
    #[tracing::instrument(level = "debug", skip(unwind))]
    pub fn with_unwind_registry(
        config: &CodeCacheConfig,
        unwind: Box<dyn UnwindRegistry>,
    ) -> crate::Result<Self> {
        Ok(Self {
            index: CodeIndex::new(),
            blocks: BlockStore::with_capacity(config.max_blocks),
            code: FrameAllocator::new(
                "code",
                config.code_reserve,
                config.commit_step,
                Protection::ReadWriteExecute,
            )?,
            data: FrameAllocator::new(
                "data",
                config.data_reserve,
                config.commit_step,
                Protection::ReadWrite,
            )?,
            unwind,
        })
    }

    /// The index cell for `address`, allocating index tables on first use.
    ///
    /// Generated code may keep the returned cell around and poll it directly.
    #[inline]
    pub fn get_index_pointer(&self, address: u32) -> &IndexCell {
        self.index.cell(address)
    }

    /// The current state of `address`, never allocates.
    #[inline]
    pub fn get_index(&self, address: u32) -> CodeBlockIndex {
        self.index.get(address)
    }

    #[inline]
    pub fn set_block_index(&self, address: u32, index: CodeBlockIndex) {
        self.index.cell(address).store(index);
    }

    #[inline]
    pub fn get_block_by_index(&self, index: CodeBlockIndex) -> Option<&CodeBlock> {
        self.blocks.get(index)
    }

    /// The published block for `address`, if any.
    pub fn lookup(&self, address: u32) -> Option<&CodeBlock> {
        let index = self.get_index(address);
        tracing::trace!("lookup {address:#010x} => {index:?}");
        self.get_block_by_index(index)
    }

    /// Tries to become the compiler of `address`.
    pub fn try_claim(&self, address: u32) -> Claim {
        match self.index.cell(address).try_claim() {
            Ok(()) => Claim::Won,
            Err(CodeBlockIndex::COMPILING) => Claim::InFlight,
            Err(index) => Claim::Compiled(index),
        }
    }

    /// Returns a claimed address to `Uncompiled` after a failed compile.
    pub fn abandon_claim(&self, address: u32) -> bool {
        self.index
            .existing_cell(address)
            .is_some_and(IndexCell::release_claim)
    }

    /// Copies freshly generated code into the cache and returns its index.
    ///
    /// The code goes to the executable allocator, the block record and its
    /// unwind info to the metadata allocator. The block is not reachable
    /// through the address index until the caller publishes it with
    /// [`CodeCache::set_block_index`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for empty code and
    /// [`Error::OutOfMemory`] once either allocator or the block table is
    /// full.
    pub fn register_code_block(
        &self,
        address: u32,
        code: &[u8],
        unwind_info: &[u8],
    ) -> crate::Result<CodeBlockIndex> {
        if code.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let code_offset = self.code.allocate(code.len(), CODE_ALIGNMENT)?;
        // SAFETY: the range was just allocated and nobody else knows about it.
        unsafe { self.code.write(code_offset, code) };
        // TODO flush the instruction cache here once non-x86 hosts are supported
        let code_ptr = self.code.ptr(code_offset).cast_const();

        let unwind_ptr = if unwind_info.is_empty() {
            core::ptr::null()
        } else {
            let offset = self.data.allocate(unwind_info.len(), UNWIND_ALIGNMENT)?;
            // SAFETY: as above.
            unsafe { self.data.write(offset, unwind_info) };
            self.data.ptr(offset).cast_const()
        };

        let block = CodeBlock::new(address, code_ptr, code.len(), unwind_ptr, unwind_info.len());
        let record = self.data.emplace(block)?;
        // SAFETY: the record lives in `data` until `clear` or `free`, both of
        // which clear the block store as well.
        let index = unsafe { self.blocks.push(record)? };

        if !unwind_info.is_empty() {
            // SAFETY: the unwind bytes live in `data` until `clear`, which
            // unregisters everything first.
            let unwind = unsafe { core::slice::from_raw_parts(unwind_ptr, unwind_info.len()) };
            // SAFETY: see above.
            if let Err(err) = unsafe { self.unwind.register(code_ptr, code.len(), unwind) } {
                tracing::warn!("unwind info for block at {address:#010x} rejected: {err}");
            }
        }

        tracing::trace!(
            "registered block {index:?} for {address:#010x} at {code_ptr:p}+{:#x}",
            code.len()
        );
        Ok(index)
    }

    /// Forgets every block whose entry lies in `[address, address + size)`.
    ///
    /// The blocks themselves stay allocated until the next [`CodeCache::clear`].
    pub fn invalidate(&self, address: u32, size: u32) {
        tracing::debug!("invalidating {address:#010x}+{size:#x}");
        self.index.invalidate_range(address, size);
    }

    /// Drops every block and rewinds both allocators.
    pub fn clear(&mut self) {
        tracing::debug!(blocks = self.blocks.len(), "clearing code cache");
        self.unwind.unregister_all();
        self.index.reset();
        self.blocks.clear();
        self.code.reset();
        self.data.reset();
    }

    /// Like [`CodeCache::clear`] but also hands all memory back to the host.
    ///
    /// # Errors
    ///
    /// Returns the host error if decommitting either arena fails.
    pub fn free(&mut self) -> crate::Result<()> {
        self.unwind.unregister_all();
        self.index.release();
        self.blocks.clear();
        self.code.release()?;
        self.data.release()
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            blocks: self.blocks.len(),
            code_committed: self.code.committed(),
            code_allocated: self.code.allocated(),
            data_committed: self.data.committed(),
            data_allocated: self.data.allocated(),
        }
    }

    /// Every registered block, including invalidated ones.
    pub fn blocks(&self) -> impl Iterator<Item = &CodeBlock> + '_ {
        self.blocks.iter()
    }

    /// Whether `ptr` points into generated code.
    pub fn contains_code(&self, ptr: *const u8) -> bool {
        self.code.contains(ptr)
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        self.unwind.unregister_all();
    }
}
