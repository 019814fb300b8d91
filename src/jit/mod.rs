//! The code cache: executable memory for generated code and the index the
//! dispatcher uses to find it by guest address.
//!
//! Compilation of an address follows a lock free claim protocol. A thread that
//! finds an address [`CodeBlockIndex::UNCOMPILED`] tries to move it to
//! [`CodeBlockIndex::COMPILING`] with [`CodeCache::try_claim`]. Only the winner
//! compiles, registers the result with [`CodeCache::register_code_block`] and
//! publishes the index. Everyone else reuses the published block or, while the
//! address is still being compiled, falls back to the interpreter.

mod block;
mod cache;
mod frame_allocator;
mod index;
mod unwind;

pub use block::{BlockStore, CodeBlock};
pub use cache::{CacheStatistics, Claim, CodeCache, CODE_ALIGNMENT};
pub use frame_allocator::FrameAllocator;
pub use index::{CodeBlockIndex, CodeIndex, IndexCell, LEVEL1_SIZE, LEVEL2_SIZE, LEVEL3_SIZE};
pub use unwind::{frame_description_offsets, host_unwind_registry, NoUnwindRegistry, UnwindRegistry};

#[cfg(all(unix, not(miri)))]
pub use unwind::NativeUnwindRegistry;
