//! Access permissions for mapped ranges.

use core::fmt;

use bitflags::bitflags;

/// The access permitted on a mapped virtual range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum AccessMode {
    /// The range may not be accessed.
    #[default]
    None,
    /// The range may be read but not written.
    Read,
    /// The range may be read and written.
    ReadWrite,
}

bitflags! {
    /// Access flags as understood by a backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct VirtualAccessFlags: u32 {
        /// The range is readable and writable.
        const RW        = 1 << 0;
        /// The range is readable.
        const READ_ONLY = 1 << 1;
    }
}

impl From<AccessMode> for VirtualAccessFlags {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::None => VirtualAccessFlags::empty(),
            AccessMode::Read => VirtualAccessFlags::READ_ONLY,
            AccessMode::ReadWrite => VirtualAccessFlags::RW,
        }
    }
}

impl From<VirtualAccessFlags> for AccessMode {
    /// `RW` wins over `READ_ONLY` if a backend reports both.
    fn from(flags: VirtualAccessFlags) -> Self {
        if flags.contains(VirtualAccessFlags::RW) {
            AccessMode::ReadWrite
        } else if flags.contains(VirtualAccessFlags::READ_ONLY) {
            AccessMode::Read
        } else {
            AccessMode::None
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessMode::None => "none",
            AccessMode::Read => "read",
            AccessMode::ReadWrite => "read_write",
        })
    }
}
