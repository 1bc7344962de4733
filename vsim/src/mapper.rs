//! Bookkeeping of the free parts of the simulated address space.
use vmem::{VirtAddr, VirtualAddressRange};

/// Hands out ranges of a fixed address space. Free ranges are kept in a list and merged on release.
#[derive(Debug)]
pub(crate) struct VirtualAddressMapper {
    unused_ranges: Vec<VirtualAddressRange>,
}

impl VirtualAddressMapper {
    pub fn new(space: VirtualAddressRange) -> Self {
        let mut unused_ranges = Vec::new();
        if !space.is_empty() {
            unused_ranges.push(space);
        }
        Self { unused_ranges }
    }

    /// Allocates `size` bytes aligned to `align` at the lowest address that fits.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<VirtualAddressRange> {
        let (index, candidate) = self
            .unused_ranges
            .iter()
            .enumerate()
            .filter_map(|(i, free)| {
                let start = align_up(free.start, align)?;
                let candidate = VirtualAddressRange::try_new(start, size)?;
                free.contains_range(&candidate).then_some((i, candidate))
            })
            .min_by_key(|(_, candidate)| candidate.start)?;
        self.carve(index, candidate);
        Some(candidate)
    }

    /// Allocates exactly `range` if every byte of it is free.
    pub fn allocate_at(&mut self, range: VirtualAddressRange) -> Option<VirtualAddressRange> {
        let index = self
            .unused_ranges
            .iter()
            .position(|free| free.contains_range(&range))?;
        self.carve(index, range);
        Some(range)
    }

    /// Returns `range` to the free list, merging it with the free ranges on either side.
    pub fn deallocate(&mut self, mut range: VirtualAddressRange) {
        let mut i = 0;
        while i < self.unused_ranges.len() {
            let free = self.unused_ranges[i];
            if free.end() == range.start {
                range = VirtualAddressRange::new(free.start, free.size + range.size);
                self.unused_ranges.swap_remove(i);
            } else if range.end() == free.start {
                range.size += free.size;
                self.unused_ranges.swap_remove(i);
            } else {
                i += 1;
            }
        }
        self.unused_ranges.push(range);
    }

    /// Total number of free bytes.
    pub fn free_bytes(&self) -> usize {
        self.unused_ranges.iter().map(|r| r.size).sum()
    }

    /// Removes `taken` from the free range at `index`, keeping whatever is left on either side.
    fn carve(&mut self, index: usize, taken: VirtualAddressRange) {
        let mut rest = self.unused_ranges.swap_remove(index);
        let before = rest.take(taken.start.offset_from(rest.start).unwrap_or(0));
        rest.take(taken.size);
        for leftover in before.into_iter().chain([rest]) {
            if !leftover.is_empty() {
                self.unused_ranges.push(leftover);
            }
        }
    }
}

fn align_up(addr: VirtAddr, align: usize) -> Option<VirtAddr> {
    if align <= 1 {
        return Some(addr);
    }
    let rem = addr.as_usize() % align;
    if rem == 0 {
        Some(addr)
    } else {
        addr.checked_add(align - rem)
    }
}
