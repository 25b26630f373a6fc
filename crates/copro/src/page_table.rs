//! The owning process's page tables, as seen by the translation miss path.

use bitflags::bitflags;

use crate::shadow::EntryKind;
use crate::{PhysicalAddress, VirtualAddress};

bitflags! {
    /// Protection and cacheability of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageProtection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// The page has been written since it was mapped.
        const DIRTY = 1 << 2;
        const CACHE_INHIBITED = 1 << 3;
        const GUARDED = 1 << 4;
    }
}

/// A translation found in the host page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostMapping {
    /// First address covered by the mapping.
    pub base: VirtualAddress,
    /// Size of the mapping in bytes, a power of two.
    pub size: u64,
    /// Physical address of `base` for a page mapping, or of the page-table page for a
    /// table mapping.
    pub phys: PhysicalAddress,
    pub protection: PageProtection,
    pub kind: EntryKind,
}

impl HostMapping {
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.base && va.as_u64() - self.base.as_u64() < self.size
    }
}

/// An address space's page tables, as far as coprocessor translation cares about them.
pub trait HostPageTable {
    /// Returns the mapping covering `va`, if any.
    fn lookup(&self, va: VirtualAddress) -> Option<HostMapping>;

    /// Records that the page containing `va` was written through a coprocessor translation.
    fn mark_dirty(&self, va: VirtualAddress);

    /// Removes the mapping covering `va`, returning it.
    fn unmap(&self, va: VirtualAddress) -> Option<HostMapping>;

    /// Replaces the protection of the mapping covering `va`. Returns false if unmapped.
    fn protect(&self, va: VirtualAddress, protection: PageProtection) -> bool;
}
