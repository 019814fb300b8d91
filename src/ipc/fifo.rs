use crate::Error;

/// A fixed-capacity circular queue of request references.
///
/// Mirrors the driver's in-memory queue: an empty queue has no pop index, and
/// the queue is full once the push index catches up with the pop index.
#[derive(Debug, Clone)]
pub struct IpcFifo<T: Copy, const N: usize> {
    push_index: usize,
    pop_index: Option<usize>,
    count: usize,
    max_count: usize,
    entries: [Option<T>; N],
}

impl<T: Copy, const N: usize> Default for IpcFifo<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> IpcFifo<T, N> {
    /// Size of the raw structure: four header words and one pointer per slot.
    pub const RAW_SIZE: usize = 0x10 + 4 * N;

    pub const fn new() -> Self {
        Self {
            push_index: 0,
            pop_index: None,
            count: 0,
            max_count: 0,
            entries: [None; N],
        }
    }

    /// Empties the queue, forgetting the high-water mark as well.
    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if all `N` slots are taken.
    pub fn push(&mut self, item: T) -> crate::Result<()> {
        if self.pop_index == Some(self.push_index) {
            return Err(Error::QueueFull);
        }

        self.entries[self.push_index] = Some(item);
        if self.pop_index.is_none() {
            self.pop_index = Some(self.push_index);
        }
        self.push_index = (self.push_index + 1) % N;
        self.count += 1;
        self.max_count = self.max_count.max(self.count);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::QueueEmpty`] if there is nothing to pop.
    pub fn pop(&mut self) -> crate::Result<T> {
        let pop_index = self.pop_index.ok_or(Error::QueueEmpty)?;
        let item = self.entries[pop_index].take().ok_or(Error::QueueEmpty)?;

        self.count -= 1;
        self.pop_index = (self.count != 0).then_some((pop_index + 1) % N);
        Ok(item)
    }

    /// # Errors
    ///
    /// Returns [`Error::QueueEmpty`] if there is nothing queued.
    pub fn peek(&self) -> crate::Result<T> {
        self.pop_index
            .and_then(|index| self.entries[index])
            .ok_or(Error::QueueEmpty)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == N
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// The largest [`IpcFifo::len`] ever observed since the last [`IpcFifo::init`].
    #[inline]
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Raw push index as the hardware structure stores it.
    pub fn raw_push_index(&self) -> i32 {
        i32::try_from(self.push_index).unwrap_or(i32::MAX)
    }

    /// Raw pop index as the hardware structure stores it, `-1` when empty.
    pub fn raw_pop_index(&self) -> i32 {
        self.pop_index
            .map_or(-1, |index| i32::try_from(index).unwrap_or(i32::MAX))
    }
}
