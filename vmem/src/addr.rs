//! Address primitives.

use core::{
    fmt,
    ops::{Add, Deref},
};

/// A device virtual address.
///
/// This is pointer sized, but it is never dereferenced by this crate. Addresses only have meaning to the
/// backend that handed them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// The null address.
    pub const NULL: VirtAddr = VirtAddr(0);

    /// Create a new virtual address from a usize.
    pub const fn new(addr: usize) -> Self {
        VirtAddr(addr)
    }

    /// Get the underlying usize value of the virtual address.
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// Returns true if this is the null address.
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Adds `bytes` to the address, returning `None` on overflow.
    pub const fn checked_add(self, bytes: usize) -> Option<VirtAddr> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(VirtAddr(addr)),
            None => None,
        }
    }

    /// Returns the distance in bytes from `base` to this address, or `None` if `base` is above it.
    pub const fn offset_from(self, base: VirtAddr) -> Option<usize> {
        self.0.checked_sub(base.0)
    }

    /// Returns true if the address is a multiple of `align`. An alignment of zero is never satisfied.
    pub const fn is_aligned_to(&self, align: usize) -> bool {
        align != 0 && self.0 % align == 0
    }
}

impl Deref for VirtAddr {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Add<usize> for VirtAddr {
    type Output = VirtAddr;

    /// Panics on overflow. Use [`VirtAddr::checked_add`] for untrusted offsets.
    fn add(self, rhs: usize) -> Self::Output {
        self.checked_add(rhs).expect("virtual address overflow")
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        VirtAddr(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
