use crate::addr::{PhysAddr, PhysicalRange};
use crate::Error;
use alloc::boxed::Box;
use alloc::vec;

/// An owned slice of the guest physical address space.
///
/// Values are stored big-endian, the way the guest sees them, and every
/// access is bounds-checked against the arena's physical range.
#[derive(Debug)]
pub struct Arena {
    base: PhysAddr,
    bytes: Box<[u8]>,
}

impl Arena {
    pub fn new(base: PhysAddr, size: u32) -> Self {
        Self {
            base,
            bytes: vec![0; size as usize].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn range(&self) -> PhysicalRange {
        PhysicalRange {
            start: self.base,
            size: u32::try_from(self.bytes.len()).unwrap_or(u32::MAX),
        }
    }

    fn offset(&self, addr: PhysAddr, len: usize) -> crate::Result<usize> {
        let offset = addr
            .offset_from(self.base)
            .ok_or(Error::InvalidAddress(addr.get()))? as usize;
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(offset),
            _ => Err(Error::InvalidAddress(addr.get())),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if any of `addr..addr + len` lies
    /// outside of the arena. The same holds for every accessor below.
    pub fn bytes(&self, addr: PhysAddr, len: usize) -> crate::Result<&[u8]> {
        let offset = self.offset(addr, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    pub fn bytes_mut(&mut self, addr: PhysAddr, len: usize) -> crate::Result<&mut [u8]> {
        let offset = self.offset(addr, len)?;
        Ok(&mut self.bytes[offset..offset + len])
    }

    pub fn write_bytes(&mut self, addr: PhysAddr, data: &[u8]) -> crate::Result<()> {
        self.bytes_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, addr: PhysAddr, len: usize, value: u8) -> crate::Result<()> {
        self.bytes_mut(addr, len)?.fill(value);
        Ok(())
    }

    pub fn read_u32(&self, addr: PhysAddr) -> crate::Result<u32> {
        let bytes = self.bytes(addr, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, addr: PhysAddr, value: u32) -> crate::Result<()> {
        self.write_bytes(addr, &value.to_be_bytes())
    }

    pub fn read_u64(&self, addr: PhysAddr) -> crate::Result<u64> {
        let mut raw = [0; 8];
        raw.copy_from_slice(self.bytes(addr, 8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn write_u64(&mut self, addr: PhysAddr, value: u64) -> crate::Result<()> {
        self.write_bytes(addr, &value.to_be_bytes())
    }
}
