use alloc::boxed::Box;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

pub const LEVEL1_BITS: u32 = 8;
pub const LEVEL2_BITS: u32 = 8;
/// Instructions are word aligned so the low two address bits carry no information.
pub const LEVEL3_BITS: u32 = 14;

pub const LEVEL1_SIZE: usize = 1 << LEVEL1_BITS;
pub const LEVEL2_SIZE: usize = 1 << LEVEL2_BITS;
pub const LEVEL3_SIZE: usize = 1 << LEVEL3_BITS;

/// Guest bytes covered by one leaf table.
pub const LEVEL3_SPAN: u32 = 1 << (LEVEL3_BITS + 2);

/// Identifies a compiled [`CodeBlock`](crate::jit::CodeBlock), or one of the
/// two states an address can be in before it has one.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeBlockIndex(i32);

impl CodeBlockIndex {
    /// Nobody has compiled this address yet.
    pub const UNCOMPILED: Self = Self(-1);
    /// A compiler thread has claimed this address and is working on it.
    pub const COMPILING: Self = Self(-2);

    pub(crate) fn new(index: usize) -> Option<Self> {
        i32::try_from(index).ok().map(Self)
    }

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_compiled(self) -> bool {
        self.0 >= 0
    }

    /// The position in block storage, for compiled indices only.
    #[inline]
    pub fn as_usize(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Debug for CodeBlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNCOMPILED => f.write_str("Uncompiled"),
            Self::COMPILING => f.write_str("Compiling"),
            Self(index) => f.debug_tuple("CodeBlockIndex").field(&index).finish(),
        }
    }
}

/// One leaf cell of the index, read directly by the dispatcher on every branch.
#[repr(transparent)]
#[derive(Debug)]
pub struct IndexCell(AtomicI32);

impl IndexCell {
    const fn new() -> Self {
        Self(AtomicI32::new(CodeBlockIndex::UNCOMPILED.0))
    }

    #[inline]
    pub fn load(&self) -> CodeBlockIndex {
        CodeBlockIndex(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, index: CodeBlockIndex) {
        self.0.store(index.0, Ordering::Release);
    }

    /// Attempts the `Uncompiled -> Compiling` transition.
    ///
    /// # Errors
    ///
    /// Returns what the cell held instead if it was not uncompiled.
    #[inline]
    pub fn try_claim(&self) -> Result<(), CodeBlockIndex> {
        self.0
            .compare_exchange(
                CodeBlockIndex::UNCOMPILED.0,
                CodeBlockIndex::COMPILING.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(CodeBlockIndex)
    }

    /// Undoes a claim whose compilation failed.
    #[inline]
    pub fn release_claim(&self) -> bool {
        self.0
            .compare_exchange(
                CodeBlockIndex::COMPILING.0,
                CodeBlockIndex::UNCOMPILED.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Forgets a compiled block, leaving in-flight claims alone.
    fn invalidate(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (raw >= 0).then_some(CodeBlockIndex::UNCOMPILED.0)
            });
    }

    /// Raw pointer for generated code that wants to poll the cell itself.
    #[inline]
    pub fn as_ptr(&self) -> *mut i32 {
        self.0.as_ptr()
    }
}

struct Level3 {
    cells: Box<[IndexCell]>,
}

struct Level2 {
    tables: Box<[AtomicPtr<Level3>]>,
}

impl Level3 {
    fn new() -> Box<Self> {
        Box::new(Self {
            cells: (0..LEVEL3_SIZE).map(|_| IndexCell::new()).collect(),
        })
    }
}

impl Level2 {
    fn new() -> Box<Self> {
        Box::new(Self {
            tables: null_table(LEVEL2_SIZE),
        })
    }
}

impl Drop for Level2 {
    fn drop(&mut self) {
        for slot in self.tables.iter_mut() {
            free_slot(slot);
        }
    }
}

fn null_table<T>(len: usize) -> Box<[AtomicPtr<T>]> {
    (0..len).map(|_| AtomicPtr::new(ptr::null_mut())).collect()
}

fn free_slot<T>(slot: &mut AtomicPtr<T>) {
    let ptr = core::mem::replace(slot.get_mut(), ptr::null_mut());
    if !ptr.is_null() {
        // SAFETY: non-null slots only ever hold pointers produced by `Box::into_raw`
        // in `get_or_publish`, and `&mut` guarantees nobody else can still see it.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Returns the table behind `slot`, allocating and publishing it if there is none.
///
/// Racing allocators all construct a table but only one compare-exchange
/// wins, the losers drop theirs and use the winner's. Readers only ever see
/// null or a fully constructed table.
fn get_or_publish<T>(slot: &AtomicPtr<T>, alloc: impl FnOnce() -> Box<T>) -> &T {
    let current = slot.load(Ordering::Acquire);
    if !current.is_null() {
        // SAFETY: published pointers stay valid until the owning index is dropped
        // or cleared through `&mut`, both of which outlive this shared borrow.
        return unsafe { &*current };
    }

    let fresh = Box::into_raw(alloc());
    match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        // SAFETY: we just published `fresh`, see above for its lifetime.
        Ok(_) => unsafe { &*fresh },
        Err(winner) => {
            // SAFETY: `fresh` was never published so we still own it exclusively.
            drop(unsafe { Box::from_raw(fresh) });
            // SAFETY: see above.
            unsafe { &*winner }
        }
    }
}

fn get_published<T>(slot: &AtomicPtr<T>) -> Option<&T> {
    let current = slot.load(Ordering::Acquire);
    // SAFETY: see `get_or_publish`.
    (!current.is_null()).then(|| unsafe { &*current })
}

#[inline]
fn split(address: u32) -> (usize, usize, usize) {
    (
        (address >> (32 - LEVEL1_BITS)) as usize,
        ((address >> (32 - LEVEL1_BITS - LEVEL2_BITS)) as usize) & (LEVEL2_SIZE - 1),
        ((address >> 2) as usize) & (LEVEL3_SIZE - 1),
    )
}

/// Sparse three level map from guest address to [`CodeBlockIndex`].
pub struct CodeIndex {
    level1: Box<[AtomicPtr<Level2>]>,
}

impl Default for CodeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeIndex")
            .field("leaf_tables", &self.leaf_table_count())
            .finish()
    }
}

impl CodeIndex {
    pub fn new() -> Self {
        Self {
            level1: null_table(LEVEL1_SIZE),
        }
    }

    /// The cell for `address`, allocating intermediate tables on first use.
    pub fn cell(&self, address: u32) -> &IndexCell {
        let (l1, l2, l3) = split(address);
        let level2 = get_or_publish(&self.level1[l1], Level2::new);
        let level3 = get_or_publish(&level2.tables[l2], Level3::new);
        &level3.cells[l3]
    }

    /// Reads the cell for `address` without allocating anything.
    pub fn get(&self, address: u32) -> CodeBlockIndex {
        self.existing_cell(address)
            .map_or(CodeBlockIndex::UNCOMPILED, IndexCell::load)
    }

    pub fn existing_cell(&self, address: u32) -> Option<&IndexCell> {
        let (l1, l2, l3) = split(address);
        let level2 = get_published(&self.level1[l1])?;
        let level3 = get_published(&level2.tables[l2])?;
        Some(&level3.cells[l3])
    }

    /// Forgets every compiled block whose entry lies in `[start, start + size)`.
    pub fn invalidate_range(&self, start: u32, size: u32) {
        let end = u64::from(start) + u64::from(size);
        let mut address = u64::from(start & !3);
        while address < end {
            let table_base = address & !u64::from(LEVEL3_SPAN - 1);
            let table_end = (table_base + u64::from(LEVEL3_SPAN)).min(end);

            let Ok(table_address) = u32::try_from(address) else {
                break;
            };
            let (l1, l2, _) = split(table_address);
            let leaf = get_published(&self.level1[l1])
                .and_then(|level2| get_published(&level2.tables[l2]));
            if let Some(leaf) = leaf {
                while address < table_end {
                    let Ok(cell_address) = u32::try_from(address) else {
                        break;
                    };
                    let (_, _, l3) = split(cell_address);
                    leaf.cells[l3].invalidate();
                    address += 4;
                }
            }
            address = table_end;
        }
    }

    /// Resets every allocated cell to [`CodeBlockIndex::UNCOMPILED`], keeping the tables.
    pub fn reset(&mut self) {
        for level2 in self.level1.iter_mut() {
            let level2 = level2.get_mut();
            if level2.is_null() {
                continue;
            }
            // SAFETY: `&mut self` means no other borrow of the tables exists.
            let level2 = unsafe { &mut **level2 };
            for level3 in level2.tables.iter_mut() {
                let level3 = level3.get_mut();
                if level3.is_null() {
                    continue;
                }
                // SAFETY: as above.
                let level3 = unsafe { &mut **level3 };
                for cell in level3.cells.iter_mut() {
                    *cell.0.get_mut() = CodeBlockIndex::UNCOMPILED.0;
                }
            }
        }
    }

    /// Frees every table.
    pub fn release(&mut self) {
        for slot in self.level1.iter_mut() {
            free_slot(slot);
        }
    }

    pub fn leaf_table_count(&self) -> usize {
        self.level1
            .iter()
            .filter_map(get_published)
            .map(|level2| level2.tables.iter().filter_map(get_published).count())
            .sum()
    }
}

impl Drop for CodeIndex {
    fn drop(&mut self) {
        self.release();
    }
}
