//! Ranges of virtual addresses.
use core::fmt;

use crate::VirtAddr;

/// A range of virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualAddressRange {
    /// The start of the range.
    pub start: VirtAddr,
    /// The size of the range.
    pub size: usize,
}

impl VirtualAddressRange {
    /// Create a new virtual address range with the given start and size.
    pub const fn new(start: VirtAddr, size: usize) -> Self {
        Self { start, size }
    }

    /// Create a new range, returning `None` if the end of the range would not be representable.
    pub fn try_new(start: VirtAddr, size: usize) -> Option<Self> {
        start.checked_add(size)?;
        Some(Self { start, size })
    }

    /// Check if the given address and size are contained within this range.
    pub fn contains(&self, addr: VirtAddr, size: usize) -> bool {
        let Some(end) = addr.checked_add(size) else {
            return false;
        };
        addr >= self.start && end <= self.end()
    }

    /// Check if the given range is contained within this range.
    pub fn contains_range(&self, range: &VirtualAddressRange) -> bool {
        self.contains(range.start, range.size)
    }

    /// Check if any byte of the given range is also part of this range. Empty ranges overlap nothing.
    pub fn overlaps(&self, range: &VirtualAddressRange) -> bool {
        if self.size == 0 || range.size == 0 {
            return false;
        }
        self.start < range.end() && range.start < self.end()
    }

    /// Takes n bytes out of the range, returning a new range with the taken bytes.
    pub fn take(&mut self, size: usize) -> Option<VirtualAddressRange> {
        if size > self.size {
            return None;
        }

        let range = VirtualAddressRange::new(self.start, size);
        self.start = self.start + size;
        self.size -= size;
        Some(range)
    }

    /// Returns the end of the range.
    #[inline(always)]
    pub fn end(&self) -> VirtAddr {
        self.start + self.size
    }

    /// Returns true if the range holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl fmt::Display for VirtualAddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}
