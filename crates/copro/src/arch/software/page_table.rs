//! An emulated host page table for exercising the translation miss path.

use alloc::collections::BTreeMap;

use crate::page_table::{HostMapping, HostPageTable, PageProtection};
use crate::shadow::EntryKind;
use crate::{PhysicalAddress, VirtualAddress};

/// Smallest mapping the emulated page table accepts.
const MIN_MAPPING: u64 = 0x1000;

/// A flat map of non-overlapping mappings keyed by base address.
#[derive(Default)]
pub struct EmulatedPageTable {
    mappings: spin::Mutex<BTreeMap<VirtualAddress, HostMapping>>,
}

impl EmulatedPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `size` bytes at `base` to physical memory at `phys`.
    ///
    /// # Panics
    /// Panics if `size` is not a power of two of at least 4 KiB, if `base` or `phys` is not
    /// aligned to `size`, or if the range overlaps an existing mapping.
    pub fn map(
        &self,
        base: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
        protection: PageProtection,
    ) {
        assert!(phys.is_aligned(size), "physical address must be aligned to the mapping size");
        self.insert(HostMapping {
            base,
            size,
            phys,
            protection,
            kind: EntryKind::Direct,
        });
    }

    /// Maps `size` bytes at `base` through the page-table page at `table`.
    ///
    /// # Panics
    /// Same conditions as [`EmulatedPageTable::map`], except for the alignment of `table`.
    pub fn map_table(
        &self,
        base: VirtualAddress,
        table: PhysicalAddress,
        size: u64,
        protection: PageProtection,
    ) {
        self.insert(HostMapping {
            base,
            size,
            phys: table,
            protection,
            kind: EntryKind::Indirect,
        });
    }

    fn insert(&self, mapping: HostMapping) {
        assert!(
            mapping.size.is_power_of_two() && mapping.size >= MIN_MAPPING,
            "mapping size must be a power of two of at least 4 KiB"
        );
        assert!(
            mapping.base.is_aligned(mapping.size),
            "virtual address must be aligned to the mapping size"
        );

        let mut mappings = self.mappings.lock();
        let end = mapping.base + mapping.size;
        let overlaps = mappings
            .range(..end)
            .next_back()
            .is_some_and(|(_, existing)| existing.base + existing.size > mapping.base);
        assert!(!overlaps, "mapping at {} overlaps an existing mapping", mapping.base);

        mappings.insert(mapping.base, mapping);
    }

    /// Returns the mapping at `base`, if any.
    pub fn mapping(&self, base: VirtualAddress) -> Option<HostMapping> {
        self.mappings.lock().get(&base).copied()
    }

    fn update(&self, va: VirtualAddress, f: impl FnOnce(&mut HostMapping)) -> bool {
        let mut mappings = self.mappings.lock();
        match mappings
            .range_mut(..=va)
            .next_back()
            .filter(|(_, mapping)| mapping.contains(va))
        {
            Some((_, mapping)) => {
                f(mapping);
                true
            }
            None => false,
        }
    }
}

impl HostPageTable for EmulatedPageTable {
    fn lookup(&self, va: VirtualAddress) -> Option<HostMapping> {
        self.mappings
            .lock()
            .range(..=va)
            .next_back()
            .map(|(_, mapping)| *mapping)
            .filter(|mapping| mapping.contains(va))
    }

    fn mark_dirty(&self, va: VirtualAddress) {
        self.update(va, |mapping| mapping.protection |= PageProtection::DIRTY);
    }

    fn unmap(&self, va: VirtualAddress) -> Option<HostMapping> {
        let mut mappings = self.mappings.lock();
        let base = mappings
            .range(..=va)
            .next_back()
            .filter(|(_, mapping)| mapping.contains(va))
            .map(|(base, _)| *base)?;
        mappings.remove(&base)
    }

    fn protect(&self, va: VirtualAddress, protection: PageProtection) -> bool {
        self.update(va, |mapping| mapping.protection = protection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> EmulatedPageTable {
        let table = EmulatedPageTable::new();
        table.map(
            VirtualAddress::new(0x10000),
            PhysicalAddress::new(0x40000),
            0x10000,
            PageProtection::READ,
        );
        table
    }

    #[test]
    fn lookup_finds_covering_mapping() {
        let table = table();
        let mapping = table.lookup(VirtualAddress::new(0x1ffff)).unwrap();
        assert_eq!(mapping.base, VirtualAddress::new(0x10000));
        assert!(table.lookup(VirtualAddress::new(0x20000)).is_none());
        assert!(table.lookup(VirtualAddress::new(0xffff)).is_none());
    }

    #[test]
    fn dirty_and_protect_update_in_place() {
        let table = table();
        table.mark_dirty(VirtualAddress::new(0x10800));
        let mapping = table.mapping(VirtualAddress::new(0x10000)).unwrap();
        assert!(mapping.protection.contains(PageProtection::DIRTY));

        assert!(table.protect(VirtualAddress::new(0x10000), PageProtection::empty()));
        assert!(!table.protect(VirtualAddress::new(0x30000), PageProtection::READ));
        assert!(table.unmap(VirtualAddress::new(0x1f000)).is_some());
        assert!(table.lookup(VirtualAddress::new(0x10000)).is_none());
    }

    #[test]
    fn table_mappings_are_indirect() {
        let table = EmulatedPageTable::new();
        table.map_table(
            VirtualAddress::new(0x100_0000),
            PhysicalAddress::new(0x9000),
            0x100_0000,
            PageProtection::READ | PageProtection::WRITE,
        );
        let mapping = table.lookup(VirtualAddress::new(0x180_0000)).unwrap();
        assert_eq!(mapping.kind, EntryKind::Indirect);
        assert_eq!(mapping.phys, PhysicalAddress::new(0x9000));
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn overlapping_mappings_panic() {
        let table = table();
        table.map(
            VirtualAddress::new(0x18000),
            PhysicalAddress::new(0x8000),
            0x8000,
            PageProtection::READ,
        );
    }
}
