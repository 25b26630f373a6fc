//! The coprocessor-side translation cache.
//!
//! Each unit caches virtual-to-physical translations tagged with the context identifier
//! of the address space they belong to. The cache is not snooped by the host's coherence
//! fabric, so every change that removes a mapping or narrows its permissions has to be
//! followed by an explicit invalidation, and the host may only consider the page table
//! change complete once that invalidation has been acknowledged.
//!
//! Entries are filled on demand from the translation miss path and leave the cache in
//! one of four ways: single-address invalidation, context invalidation, a full flush, or
//! eviction when the cache is full.

use alloc::collections::{BTreeMap, VecDeque};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::page_table::{HostMapping, PageProtection};
use crate::{ContextId, PhysicalAddress, VirtualAddress};

/// Translation sizes the cache can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    Size4K,
    Size64K,
    Size16M,
    Size1G,
}

impl SizeClass {
    /// Every size class, smallest first.
    pub const ALL: [SizeClass; 4] = [
        SizeClass::Size4K,
        SizeClass::Size64K,
        SizeClass::Size16M,
        SizeClass::Size1G,
    ];

    pub const fn bytes(self) -> u64 {
        match self {
            SizeClass::Size4K => 1 << 12,
            SizeClass::Size64K => 1 << 16,
            SizeClass::Size16M => 1 << 24,
            SizeClass::Size1G => 1 << 30,
        }
    }

    /// Returns the largest class whose naturally aligned block around `va` lies entirely
    /// within `mapping`.
    pub fn fitting(mapping: &HostMapping, va: VirtualAddress) -> Option<Self> {
        let start = mapping.base.as_u64();
        let end = start.checked_add(mapping.size)?;

        Self::ALL.into_iter().rev().find(|class| {
            let base = va.align_down(class.bytes()).as_u64();
            base >= start
                && base
                    .checked_add(class.bytes())
                    .is_some_and(|block_end| block_end <= end)
        })
    }
}

/// What an entry translates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    /// Maps the covered range to physical pages.
    Direct,
    /// Points at a host page-table page the coprocessor walks for the covered range.
    Indirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    context_id: ContextId,
    base: VirtualAddress,
    size: SizeClass,
    kind: EntryKind,
}

impl EntryKey {
    fn covers(&self, va: VirtualAddress) -> bool {
        va.align_down(self.size.bytes()) == self.base
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShadowEntry {
    phys: PhysicalAddress,
    protection: PageProtection,
}

/// The kind of access a coprocessor makes through a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Why a translation could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Miss {
    /// No entry covers the address.
    Absent,
    /// An entry exists but does not permit the access.
    Protection,
}

/// A successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowHit {
    /// The translated address for a direct entry, or the page-table page for an indirect one.
    pub phys: PhysicalAddress,
    pub kind: EntryKind,
    pub size: SizeClass,
    pub protection: PageProtection,
}

/// Why [`ShadowTranslationCache::install_if`] did not install an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    /// No size class fits inside the host mapping around the address.
    NoSizeClass,
    /// The translation was invalidated while it was being derived.
    Stale,
}

/// Identifies an issued invalidation; see [`ShadowTranslationCache::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[must_use = "an invalidation is only complete once it has been waited for"]
pub struct InvalidationTicket(u64);

/// Counters describing cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowStats {
    pub installs: u64,
    pub invalidations: u64,
    pub misses: u64,
    pub flushes: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct AtomicStats {
    installs: AtomicU64,
    invalidations: AtomicU64,
    misses: AtomicU64,
    flushes: AtomicU64,
    evictions: AtomicU64,
}

struct ShadowState {
    entries: BTreeMap<EntryKey, ShadowEntry>,
    /// Insertion order, used to pick eviction victims round-robin.
    order: VecDeque<EntryKey>,
}

impl ShadowState {
    fn remove_where(&mut self, mut matches: impl FnMut(&EntryKey) -> bool) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|key, _| !matches(key));
        self.order.retain(|key| !matches(key));
        (before - self.entries.len()) as u64
    }
}

/// The translation cache of one coprocessor unit.
pub struct ShadowTranslationCache {
    capacity: usize,
    state: spin::Mutex<ShadowState>,
    issued: AtomicU64,
    completed: AtomicU64,
    /// Serial of the context owning the untagged entries, or 0. Only changed with `state`
    /// locked.
    untagged_owner: AtomicU64,
    stats: AtomicStats,
}

impl ShadowTranslationCache {
    /// Creates an empty cache holding at most `capacity` entries.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "shadow cache needs at least one entry");
        Self {
            capacity,
            state: spin::Mutex::new(ShadowState {
                entries: BTreeMap::new(),
                order: VecDeque::with_capacity(capacity),
            }),
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            untagged_owner: AtomicU64::new(0),
            stats: AtomicStats::default(),
        }
    }

    /// Looks up the translation the coprocessor would use for `va`.
    ///
    /// Direct entries are preferred over indirect ones, smaller classes over larger ones.
    pub fn translate(
        &self,
        context_id: ContextId,
        va: VirtualAddress,
        access: Access,
    ) -> Result<ShadowHit, Miss> {
        let state = self.state.lock();

        for kind in [EntryKind::Direct, EntryKind::Indirect] {
            for size in SizeClass::ALL {
                let key = EntryKey {
                    context_id,
                    base: va.align_down(size.bytes()),
                    size,
                    kind,
                };
                let Some(entry) = state.entries.get(&key) else {
                    continue;
                };

                if access == Access::Write && !entry.protection.contains(PageProtection::WRITE) {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return Err(Miss::Protection);
                }

                let phys = match kind {
                    EntryKind::Direct => entry.phys + va.offset_in(size.bytes()),
                    EntryKind::Indirect => entry.phys,
                };
                return Ok(ShadowHit {
                    phys,
                    kind,
                    size,
                    protection: entry.protection,
                });
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        Err(Miss::Absent)
    }

    /// Installs the translation of `va` from `mapping` with `protection`.
    ///
    /// Any entry of the same kind already covering `va` for the context is replaced, so
    /// permissions are always those derived at the latest install. Returns `None` if no
    /// size class fits inside the mapping.
    ///
    /// Must be called with interrupts disabled: a half-installed entry must never be seen.
    pub fn install(
        &self,
        context_id: ContextId,
        va: VirtualAddress,
        mapping: &HostMapping,
        protection: PageProtection,
    ) -> Option<ShadowHit> {
        self.install_if(context_id, va, mapping, protection, || true).ok()
    }

    /// Like [`ShadowTranslationCache::install`], but only if `still_current` returns true.
    ///
    /// `still_current` runs with the cache locked, after every invalidation that completed
    /// before it and before any that has not. A miss uses it to refuse a translation read
    /// from the host page table before a concurrent unmap or teardown.
    pub fn install_if(
        &self,
        context_id: ContextId,
        va: VirtualAddress,
        mapping: &HostMapping,
        protection: PageProtection,
        still_current: impl FnOnce() -> bool,
    ) -> Result<ShadowHit, InstallError> {
        let size = SizeClass::fitting(mapping, va).ok_or(InstallError::NoSizeClass)?;
        let base = va.align_down(size.bytes());
        let key = EntryKey {
            context_id,
            base,
            size,
            kind: mapping.kind,
        };
        let entry = ShadowEntry {
            phys: match mapping.kind {
                EntryKind::Direct => mapping.phys + (base - mapping.base),
                EntryKind::Indirect => mapping.phys,
            },
            protection,
        };
        let hit = ShadowHit {
            phys: match mapping.kind {
                EntryKind::Direct => entry.phys + va.offset_in(size.bytes()),
                EntryKind::Indirect => entry.phys,
            },
            kind: mapping.kind,
            size,
            protection,
        };

        let mut state = self.state.lock();
        if !still_current() {
            trace_detail!("shadow install ctx {} {} refused: stale", context_id, va);
            return Err(InstallError::Stale);
        }
        if state.entries.get(&key) == Some(&entry) {
            // A racing miss for the same address got here first.
            return Ok(hit);
        }

        state.remove_where(|k| k.context_id == context_id && k.kind == key.kind && k.covers(va));

        while state.entries.len() >= self.capacity {
            let Some(victim) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&victim);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        state.entries.insert(key, entry);
        state.order.push_back(key);
        self.stats.installs.fetch_add(1, Ordering::Relaxed);

        trace_detail!(
            "shadow install ctx {} {} -> {} ({:?}, {:?}, {:?})",
            context_id,
            base,
            entry.phys,
            size,
            mapping.kind,
            protection
        );

        Ok(hit)
    }

    /// Invalidates every entry of the context covering `va`.
    pub fn invalidate_page(&self, context_id: ContextId, va: VirtualAddress) -> InvalidationTicket {
        trace_detail!("shadow invalidate ctx {} page {}", context_id, va);
        self.invalidate(|key| key.context_id == context_id && key.covers(va))
    }

    /// Invalidates every entry tagged with `context_id`.
    pub fn invalidate_context(&self, context_id: ContextId) -> InvalidationTicket {
        trace_detail!("shadow invalidate ctx {}", context_id);
        self.invalidate(|key| key.context_id == context_id)
    }

    /// Invalidates every entry of every context.
    pub fn flush_all(&self) -> InvalidationTicket {
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.invalidate(|_| true)
    }

    /// Returns the serial of the context owning the untagged entries, or 0 if none does.
    pub fn untagged_owner(&self) -> u64 {
        self.untagged_owner.load(Ordering::Acquire)
    }

    /// Hands the untagged entries to `owner`, invalidating any left by a previous owner.
    ///
    /// Without context identifiers the unit cannot tell address spaces apart, so it may
    /// only hold translations of one of them at a time.
    pub fn bind_untagged(&self, owner: u64) -> InvalidationTicket {
        let mut state = self.state.lock();
        let previous = self.untagged_owner.swap(owner, Ordering::AcqRel);
        if previous == owner {
            return self.invalidate_locked(&mut state, |_| false);
        }
        trace_detail!("shadow untagged owner {} -> {}", previous, owner);
        self.invalidate_locked(&mut state, |key| key.context_id.is_none())
    }

    /// Takes ownership of the untagged entries if nobody holds it; returns true if `owner`
    /// holds it now.
    pub fn claim_untagged(&self, owner: u64) -> bool {
        let _state = self.state.lock();
        match self
            .untagged_owner
            .compare_exchange(0, owner, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == owner,
        }
    }

    /// Gives up `owner`'s untagged entries, if it still holds them.
    pub fn release_untagged(&self, owner: u64) -> InvalidationTicket {
        let mut state = self.state.lock();
        if self.untagged_owner.load(Ordering::Acquire) != owner {
            return self.invalidate_locked(&mut state, |_| false);
        }
        self.untagged_owner.store(0, Ordering::Release);
        self.invalidate_locked(&mut state, |key| key.context_id.is_none())
    }

    fn invalidate(&self, matches: impl FnMut(&EntryKey) -> bool) -> InvalidationTicket {
        let mut state = self.state.lock();
        self.invalidate_locked(&mut state, matches)
    }

    fn invalidate_locked(
        &self,
        state: &mut ShadowState,
        matches: impl FnMut(&EntryKey) -> bool,
    ) -> InvalidationTicket {
        // Tickets are issued and completed under the lock, so completion is in order.
        let ticket = self.issued.fetch_add(1, Ordering::AcqRel) + 1;
        let removed = state.remove_where(matches);
        self.completed.store(ticket, Ordering::Release);
        self.stats.invalidations.fetch_add(removed, Ordering::Relaxed);
        InvalidationTicket(ticket)
    }

    /// Returns true once the invalidation identified by `ticket` has completed.
    pub fn is_complete(&self, ticket: InvalidationTicket) -> bool {
        self.completed.load(Ordering::Acquire) >= ticket.0
    }

    /// Spins until the invalidation identified by `ticket` has completed.
    pub fn wait(&self, ticket: InvalidationTicket) {
        while !self.is_complete(ticket) {
            spin_loop();
        }
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of cached entries tagged with `context_id`.
    pub fn entries_for(&self, context_id: ContextId) -> usize {
        self.state
            .lock()
            .entries
            .keys()
            .filter(|key| key.context_id == context_id)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ShadowStats {
        ShadowStats {
            installs: self.stats.installs.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX_A: ContextId = ContextId::new(1);
    const CTX_B: ContextId = ContextId::new(2);

    fn rw() -> PageProtection {
        PageProtection::READ | PageProtection::WRITE | PageProtection::DIRTY
    }

    fn page(base: u64, phys: u64, size: u64) -> HostMapping {
        HostMapping {
            base: VirtualAddress::new(base),
            size,
            phys: PhysicalAddress::new(phys),
            protection: rw(),
            kind: EntryKind::Direct,
        }
    }

    #[test]
    fn size_class_matches_mapping() {
        let va = VirtualAddress::new(0x4012_3456);
        assert_eq!(
            SizeClass::fitting(&page(0x4012_3000, 0, 0x1000), va),
            Some(SizeClass::Size4K)
        );
        assert_eq!(
            SizeClass::fitting(&page(0x4000_0000, 0, 1 << 21), va),
            Some(SizeClass::Size64K)
        );
        assert_eq!(
            SizeClass::fitting(&page(0x4000_0000, 0, 1 << 30), va),
            Some(SizeClass::Size1G)
        );
        // Smaller than the smallest class.
        assert_eq!(SizeClass::fitting(&page(0x4012_3000, 0, 0x800), va), None);
    }

    #[test]
    fn install_then_translate() {
        let cache = ShadowTranslationCache::new(8);
        let mapping = page(0x10_0000, 0x8000_0000, 0x1_0000);
        let va = VirtualAddress::new(0x10_1234);

        let hit = cache.install(CTX_A, va, &mapping, rw()).unwrap();
        assert_eq!(hit.size, SizeClass::Size64K);
        assert_eq!(hit.phys, PhysicalAddress::new(0x8000_1234));

        let again = cache.translate(CTX_A, VirtualAddress::new(0x10_fff0), Access::Write);
        assert_eq!(again.map(|h| h.phys), Ok(PhysicalAddress::new(0x8000_fff0)));
        assert_eq!(cache.translate(CTX_B, va, Access::Read), Err(Miss::Absent));
    }

    #[test]
    fn invalidated_entry_refaults_as_absent() {
        let cache = ShadowTranslationCache::new(8);
        let va = VirtualAddress::new(0x2000);
        cache.install(CTX_A, va, &page(0x2000, 0x9000, 0x1000), rw());

        let ticket = cache.invalidate_page(CTX_A, va + 0x10);
        cache.wait(ticket);

        assert!(cache.is_complete(ticket));
        assert_eq!(cache.translate(CTX_A, va, Access::Read), Err(Miss::Absent));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn write_through_read_only_entry_misses() {
        let cache = ShadowTranslationCache::new(8);
        let va = VirtualAddress::new(0x3000);
        cache.install(CTX_A, va, &page(0x3000, 0x5000, 0x1000), PageProtection::READ);

        assert!(cache.translate(CTX_A, va, Access::Read).is_ok());
        assert_eq!(cache.translate(CTX_A, va, Access::Write), Err(Miss::Protection));

        // Reinstalling re-derives the permissions instead of stacking a second entry.
        cache.install(CTX_A, va, &page(0x3000, 0x5000, 0x1000), rw());
        assert!(cache.translate(CTX_A, va, Access::Write).is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn duplicate_install_is_not_counted() {
        let cache = ShadowTranslationCache::new(8);
        let va = VirtualAddress::new(0x3000);
        let mapping = page(0x3000, 0x5000, 0x1000);
        cache.install(CTX_A, va, &mapping, rw());
        cache.install(CTX_A, va, &mapping, rw());
        assert_eq!(cache.stats().installs, 1);
    }

    #[test]
    fn context_invalidation_is_scoped() {
        let cache = ShadowTranslationCache::new(16);
        for i in 0..4 {
            let base = 0x1_0000 + i * 0x1000;
            cache.install(CTX_A, VirtualAddress::new(base), &page(base, base, 0x1000), rw());
            cache.install(CTX_B, VirtualAddress::new(base), &page(base, base, 0x1000), rw());
        }

        let ticket = cache.invalidate_context(CTX_A);
        cache.wait(ticket);

        assert_eq!(cache.entries_for(CTX_A), 0);
        assert_eq!(cache.entries_for(CTX_B), 4);
    }

    #[test]
    fn flush_removes_everything() {
        let cache = ShadowTranslationCache::new(16);
        cache.install(CTX_A, VirtualAddress::new(0x1000), &page(0x1000, 0, 0x1000), rw());
        cache.install(CTX_B, VirtualAddress::new(0x1000), &page(0x1000, 0, 0x1000), rw());

        let ticket = cache.flush_all();
        cache.wait(ticket);

        assert!(cache.is_empty());
        assert_eq!(cache.stats().flushes, 1);
    }

    #[test]
    fn full_cache_evicts_oldest() {
        let cache = ShadowTranslationCache::new(2);
        for base in [0x1000u64, 0x2000, 0x3000] {
            cache.install(CTX_A, VirtualAddress::new(base), &page(base, base, 0x1000), rw());
        }

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.translate(CTX_A, VirtualAddress::new(0x1000), Access::Read),
            Err(Miss::Absent)
        );
        assert!(cache.translate(CTX_A, VirtualAddress::new(0x3000), Access::Read).is_ok());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn indirect_entries_return_table_address() {
        let cache = ShadowTranslationCache::new(4);
        let mapping = HostMapping {
            base: VirtualAddress::new(0x4000_0000),
            size: 1 << 24,
            phys: PhysicalAddress::new(0x7_0000),
            protection: PageProtection::READ,
            kind: EntryKind::Indirect,
        };
        let va = VirtualAddress::new(0x4012_3456);
        cache.install(CTX_A, va, &mapping, PageProtection::READ);

        let hit = cache.translate(CTX_A, va, Access::Read).unwrap();
        assert_eq!(hit.kind, EntryKind::Indirect);
        assert_eq!(hit.size, SizeClass::Size16M);
        assert_eq!(hit.phys, PhysicalAddress::new(0x7_0000));
    }

    #[test]
    fn install_is_refused_once_stale() {
        let cache = ShadowTranslationCache::new(4);
        let va = VirtualAddress::new(0x5000);
        let mapping = page(0x5000, 0x6000, 0x1000);

        assert_eq!(
            cache.install_if(CTX_A, va, &mapping, rw(), || false),
            Err(InstallError::Stale)
        );
        assert!(cache.is_empty());
        assert_eq!(cache.stats().installs, 0);

        let tiny = page(0x5000, 0x6000, 0x800);
        assert_eq!(
            cache.install_if(CTX_A, va, &tiny, rw(), || true),
            Err(InstallError::NoSizeClass)
        );
        assert!(cache.install_if(CTX_A, va, &mapping, rw(), || true).is_ok());
    }

    #[test]
    fn untagged_entries_follow_their_owner() {
        let cache = ShadowTranslationCache::new(8);
        let va = VirtualAddress::new(0x1000);
        cache.install(ContextId::NONE, va, &page(0x1000, 0x9000, 0x1000), rw());
        cache.install(CTX_A, va, &page(0x1000, 0x9000, 0x1000), rw());

        assert!(cache.claim_untagged(10));
        assert!(!cache.claim_untagged(11));
        assert_eq!(cache.untagged_owner(), 10);

        // Rebinding to the same owner keeps its entries.
        let ticket = cache.bind_untagged(10);
        cache.wait(ticket);
        assert_eq!(cache.entries_for(ContextId::NONE), 1);

        let ticket = cache.bind_untagged(11);
        cache.wait(ticket);
        assert_eq!(cache.untagged_owner(), 11);
        assert_eq!(
            cache.translate(ContextId::NONE, va, Access::Read),
            Err(Miss::Absent)
        );
        // Tagged entries are untouched.
        assert_eq!(cache.entries_for(CTX_A), 1);

        cache.install(ContextId::NONE, va, &page(0x1000, 0x9000, 0x1000), rw());
        let ticket = cache.release_untagged(10);
        cache.wait(ticket);
        assert_eq!(cache.entries_for(ContextId::NONE), 1);

        let ticket = cache.release_untagged(11);
        cache.wait(ticket);
        assert_eq!(cache.entries_for(ContextId::NONE), 0);
        assert_eq!(cache.untagged_owner(), 0);
    }

    #[test]
    fn tickets_complete_in_order() {
        let cache = ShadowTranslationCache::new(4);
        let first = cache.flush_all();
        let second = cache.invalidate_context(CTX_A);
        assert!(first < second);
        assert!(cache.is_complete(first));
        assert!(cache.is_complete(second));
    }
}
