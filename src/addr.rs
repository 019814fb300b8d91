//! Guest address newtypes.
//!
//! Guest pointers never become host pointers. Everything that addresses guest
//! memory does so through these 32-bit handles and bounds-checked offset
//! arithmetic.

use core::fmt;

macro_rules! guest_address {
    ($name:ident, $range:ident, $what:literal) => {
        #[doc = concat!("A 32-bit ", $what, " address.")]
        #[repr(transparent)]
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub const NULL: Self = Self(0);

            #[inline]
            pub const fn new(value: u32) -> Self {
                Self(value)
            }

            #[inline]
            pub const fn get(self) -> u32 {
                self.0
            }

            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Returns `self + offset`, or `None` if that would leave the 32-bit address space.
            #[inline]
            pub fn checked_add(self, offset: u32) -> Option<Self> {
                self.0.checked_add(offset).map(Self)
            }

            #[inline]
            pub fn checked_sub(self, offset: u32) -> Option<Self> {
                self.0.checked_sub(offset).map(Self)
            }

            /// Byte distance from `base` to `self`, if `self` is not below `base`.
            #[inline]
            pub fn offset_from(self, base: Self) -> Option<u32> {
                self.0.checked_sub(base.0)
            }

            #[inline]
            pub fn align_up(self, align: u32) -> Option<Self> {
                align_up(self.0, align).map(Self)
            }

            #[inline]
            pub fn align_down(self, align: u32) -> Self {
                Self(align_down(self.0, align))
            }

            #[inline]
            pub fn is_aligned(self, align: u32) -> bool {
                debug_assert!(align.is_power_of_two());
                self.0 & (align - 1) == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        #[doc = concat!("A contiguous range of ", $what, " addresses.")]
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $range {
            pub start: $name,
            pub size: u32,
        }

        impl $range {
            pub const EMPTY: Self = Self {
                start: $name::NULL,
                size: 0,
            };

            #[inline]
            pub const fn new(start: u32, size: u32) -> Self {
                Self {
                    start: $name::new(start),
                    size,
                }
            }

            /// One past the last address, as a 64-bit value since a range may
            /// extend to the very top of the address space.
            #[inline]
            pub const fn end(&self) -> u64 {
                self.start.0 as u64 + self.size as u64
            }

            #[inline]
            pub const fn is_empty(&self) -> bool {
                self.size == 0
            }

            #[inline]
            pub fn contains(&self, addr: $name) -> bool {
                addr >= self.start && u64::from(addr.0) < self.end()
            }

            /// Whether `[start, start + size)` lies fully within this range.
            #[inline]
            pub fn contains_range(&self, start: $name, size: u32) -> bool {
                start >= self.start && u64::from(start.0) + u64::from(size) <= self.end()
            }

            #[inline]
            pub fn overlaps(&self, other: &Self) -> bool {
                !self.is_empty()
                    && !other.is_empty()
                    && u64::from(self.start.0) < other.end()
                    && u64::from(other.start.0) < self.end()
            }
        }

        impl fmt::Display for $range {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}..{:#010x}", self.start, self.end())
            }
        }
    };
}

guest_address!(PhysAddr, PhysicalRange, "physical");
guest_address!(VirtAddr, VirtualRange, "virtual");

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub fn align_up(value: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

#[inline]
pub fn align_down(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_at_top_of_address_space() {
        let range = VirtualRange::new(0xFFFF_0000, 0x1_0000);
        assert_eq!(range.end(), 0x1_0000_0000);
        assert!(range.contains(VirtAddr::new(0xFFFF_FFFF)));
        assert!(range.contains_range(VirtAddr::new(0xFFFF_8000), 0x8000));
        assert!(!range.contains_range(VirtAddr::new(0xFFFF_8000), 0x8001));
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x2000, 0x1000), Some(0x2000));
        assert_eq!(align_up(0xFFFF_FFFF, 0x1000), None);
        assert_eq!(PhysAddr::new(0x1234).align_down(0x100), PhysAddr::new(0x1200));
    }

    #[test]
    fn overlap() {
        let a = PhysicalRange::new(0x1000, 0x1000);
        assert!(a.overlaps(&PhysicalRange::new(0x1FFF, 0x10)));
        assert!(!a.overlaps(&PhysicalRange::new(0x2000, 0x10)));
        assert!(!a.overlaps(&PhysicalRange::EMPTY));
    }
}
