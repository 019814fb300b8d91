use crate::host_page_size;

mod arena;
mod mmap;

pub use arena::Arena;
pub use mmap::{Mmap, Protection};

/// Is `bytes` a multiple of the host page size?
pub fn usize_is_multiple_of_host_page_size(bytes: usize) -> bool {
    bytes % host_page_size() == 0
}

/// Rounds `bytes` up to a multiple of `quantum`, which must be a power of two.
///
/// Returns `None` on overflow.
pub fn round_usize_up_to(bytes: usize, quantum: usize) -> Option<usize> {
    debug_assert!(quantum.is_power_of_two());
    bytes
        .checked_add(quantum - 1)
        .map(|val| val & !(quantum - 1))
}

pub fn round_usize_up_to_host_pages(bytes: usize) -> Option<usize> {
    round_usize_up_to(bytes, host_page_size())
}
