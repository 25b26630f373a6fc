//! Per-address-space coprocessor state.
//!
//! Each address space carries a capability mask recording every coprocessor type it has
//! ever been authorized to use, plus the context identifier its cached translations are
//! tagged with. Bits are only ever added while the address space is alive, which is what
//! lets readers test them without taking the lock: a stale read can only ever miss a
//! grant, never report one that did not happen.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::cpu::{AtomicCpuMask, CpuId, CpuMask};
use crate::error::{CoproError, Resource, Result};
use crate::unit::CoprocessorUnit;

/// A coprocessor type, one bit in a [`CapabilityMask`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoprocessorType(u8);

impl CoprocessorType {
    /// Number of distinct coprocessor types.
    pub const COUNT: usize = 64;

    /// Creates a coprocessor type.
    ///
    /// # Panics
    /// Panics if `index` is not below [`CoprocessorType::COUNT`].
    pub const fn new(index: u8) -> Self {
        assert!((index as usize) < Self::COUNT, "coprocessor type out of range");
        Self(index)
    }

    /// Creates a coprocessor type, returning `None` if `index` is out of range.
    pub const fn try_new(index: u8) -> Option<Self> {
        if (index as usize) < Self::COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    const fn bit(self) -> u64 {
        1 << self.0
    }
}

impl fmt::Debug for CoprocessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoprocessorType({})", self.0)
    }
}

impl fmt::Display for CoprocessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of coprocessor types.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityMask(u64);

impl CapabilityMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, ty: CoprocessorType) -> bool {
        self.0 & ty.bit() != 0
    }

    /// Returns this mask with `ty` added.
    pub const fn with(self, ty: CoprocessorType) -> Self {
        Self(self.0 | ty.bit())
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every type in `other` is also in `self`.
    pub const fn is_superset_of(self, other: CapabilityMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl fmt::Debug for CapabilityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityMask({:#018x})", self.0)
    }
}

/// Identifier that tags an address space's cached coprocessor translations.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u32);

impl ContextId {
    /// No identifier assigned, or identifiers are not tracked on this configuration.
    pub const NONE: Self = Self(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("ContextId(NONE)")
        } else {
            write!(f, "ContextId({})", self.0)
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consistent view of a context's mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub capabilities: CapabilityMask,
    pub context_id: ContextId,
    /// Number of capability grants applied so far.
    pub generation: u64,
}

/// The result of a capability grant.
///
/// A grant only becomes reliable on other CPUs once every CPU running the address space
/// has reloaded its context registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a grant must be propagated to every CPU running the address space"]
pub struct Grant {
    transitioned: bool,
    snapshot: ContextSnapshot,
}

impl Grant {
    /// Returns true if this grant set the bit, false if it was already set.
    pub fn transitioned(&self) -> bool {
        self.transitioned
    }

    /// Returns the context state immediately after the grant.
    pub fn snapshot(&self) -> ContextSnapshot {
        self.snapshot
    }
}

/// What a translation miss read before consulting the host page table.
///
/// An invalidation of the context, or a change of its identifier, makes every earlier
/// stamp stale; see [`AddressSpaceContext::is_current`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationStamp {
    context_id: ContextId,
    sequence: u64,
}

impl TranslationStamp {
    /// The identifier translations derived under this stamp are tagged with.
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// State only touched with the mutation lock held.
struct LockedState {
    /// Units that may hold translations tagged with this context's identifier.
    attached: Vec<Arc<CoprocessorUnit>>,
}

/// Coprocessor state owned by one address space.
pub struct AddressSpaceContext {
    capabilities: AtomicU64,
    context_id: AtomicU32,
    generation: AtomicU64,
    active_cpus: AtomicCpuMask,
    /// Bumped under the mutation lock before every invalidation of this context.
    invalidations: AtomicU64,
    retired: AtomicBool,
    serial: u64,
    mutation_lock: spin::Mutex<LockedState>,
}

impl AddressSpaceContext {
    /// Creates an empty context with room to track `unit_capacity` attached units.
    pub fn new(unit_capacity: usize) -> Result<Self> {
        let mut attached = Vec::new();
        attached
            .try_reserve_exact(unit_capacity)
            .map_err(|_| CoproError::OutOfMemory(Resource::ContextState))?;

        Ok(Self {
            capabilities: AtomicU64::new(0),
            context_id: AtomicU32::new(ContextId::NONE.0),
            generation: AtomicU64::new(0),
            active_cpus: AtomicCpuMask::new(),
            invalidations: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            mutation_lock: spin::Mutex::new(LockedState { attached }),
        })
    }

    /// Returns true if the address space has been granted `ty`.
    ///
    /// Lock-free; pairs with the release store in [`AddressSpaceContext::grant_capability`].
    pub fn has_capability(&self, ty: CoprocessorType) -> bool {
        self.capabilities().contains(ty)
    }

    pub fn capabilities(&self) -> CapabilityMask {
        CapabilityMask(self.capabilities.load(Ordering::Acquire))
    }

    pub fn context_id(&self) -> ContextId {
        ContextId(self.context_id.load(Ordering::Acquire))
    }

    /// Returns a number unique to this context for the lifetime of the system.
    ///
    /// Unlike the context identifier it is never zero and never reused, so it can name
    /// the owner of untagged translations.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Returns true once the context has been torn down.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Reads the state a translation miss derives its entry from.
    pub fn translation_stamp(&self) -> TranslationStamp {
        let sequence = self.invalidations.load(Ordering::Acquire);
        TranslationStamp {
            context_id: self.context_id(),
            sequence,
        }
    }

    /// Returns true if nothing has invalidated the context or changed its identifier since
    /// `stamp` was taken.
    pub fn is_current(&self, stamp: TranslationStamp) -> bool {
        self.invalidations.load(Ordering::Acquire) == stamp.sequence
            && self.context_id() == stamp.context_id
    }

    /// Returns the CPUs currently running this address space.
    pub fn active_cpus(&self) -> CpuMask {
        self.active_cpus.load()
    }

    /// Returns the capability mask, context id and grant generation under the lock.
    pub fn snapshot(&self) -> ContextSnapshot {
        let _guard = self.mutation_lock.lock();
        self.snapshot_locked()
    }

    fn snapshot_locked(&self) -> ContextSnapshot {
        ContextSnapshot {
            capabilities: self.capabilities(),
            context_id: self.context_id(),
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    /// Grants `ty` without assigning a context identifier.
    pub fn grant_capability(&self, ty: CoprocessorType) -> Grant {
        match self.grant_capability_with(ty, || Ok(ContextId::NONE)) {
            Ok(grant) => grant,
            Err(_) => unreachable!("grant without identifier allocation cannot fail"),
        }
    }

    /// Grants `ty`, first assigning a context identifier from `allocate_id` if the
    /// context has none.
    ///
    /// The capability is re-checked with the lock held, so racing grants of the same type
    /// produce exactly one 0 -> 1 transition.
    pub(crate) fn grant_capability_with(
        &self,
        ty: CoprocessorType,
        allocate_id: impl FnOnce() -> Result<ContextId>,
    ) -> Result<Grant> {
        let _guard = self.mutation_lock.lock();

        if self.has_capability(ty) {
            return Ok(Grant {
                transitioned: false,
                snapshot: self.snapshot_locked(),
            });
        }

        if self.context_id().is_none() {
            let id = allocate_id()?;
            self.context_id.store(id.0, Ordering::Release);
        }

        self.capabilities.fetch_or(ty.bit(), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        log::debug!("granted coprocessor type {} to context {}", ty, self.context_id());

        Ok(Grant {
            transitioned: true,
            snapshot: self.snapshot_locked(),
        })
    }

    /// Records that `unit` may now hold translations for this context.
    pub(crate) fn attach_unit(&self, unit: &Arc<CoprocessorUnit>) -> Result<()> {
        let mut state = self.mutation_lock.lock();
        if state.attached.iter().any(|u| Arc::ptr_eq(u, unit)) {
            return Ok(());
        }
        state
            .attached
            .try_reserve(1)
            .map_err(|_| CoproError::OutOfMemory(Resource::ContextState))?;
        state.attached.push(unit.clone());
        Ok(())
    }

    /// Starts an invalidation of this context's translations.
    ///
    /// Every stamp taken before this call becomes stale. Returns the identifier to
    /// invalidate and the units that may hold translations under it.
    pub(crate) fn begin_invalidation(&self) -> (ContextId, Vec<Arc<CoprocessorUnit>>) {
        let state = self.mutation_lock.lock();
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        (self.context_id(), state.attached.clone())
    }

    /// Detaches every unit and clears the context identifier, returning both for teardown.
    ///
    /// Every stamp taken before this call becomes stale.
    pub(crate) fn retire(&self) -> (ContextId, Vec<Arc<CoprocessorUnit>>) {
        let mut state = self.mutation_lock.lock();
        self.retired.store(true, Ordering::Release);
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        let id = ContextId(self.context_id.swap(ContextId::NONE.0, Ordering::AcqRel));
        (id, core::mem::take(&mut state.attached))
    }

    pub(crate) fn mark_active(&self, cpu: CpuId) {
        self.active_cpus.insert(cpu);
    }

    pub(crate) fn mark_inactive(&self, cpu: CpuId) {
        self.active_cpus.remove(cpu);
    }
}

impl fmt::Debug for AddressSpaceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpaceContext")
            .field("capabilities", &self.capabilities())
            .field("context_id", &self.context_id())
            .field("active_cpus", &self.active_cpus())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_is_empty() {
        let ctx = AddressSpaceContext::new(4).unwrap();
        assert!(ctx.capabilities().is_empty());
        assert!(ctx.context_id().is_none());
        assert_eq!(ctx.snapshot().generation, 0);
    }

    #[test]
    fn grants_are_monotonic() {
        let ctx = AddressSpaceContext::new(0).unwrap();
        let types = [3u8, 0, 63, 3, 17, 0];
        let mut seen = CapabilityMask::empty();

        for index in types {
            let ty = CoprocessorType::new(index);
            let before = ctx.capabilities();
            let grant = ctx.grant_capability(ty);
            assert_eq!(grant.transitioned(), !before.contains(ty));

            seen = seen.with(ty);
            assert!(ctx.capabilities().is_superset_of(before));
            assert_eq!(ctx.capabilities(), seen);
        }
        assert_eq!(ctx.snapshot().generation, 4);
    }

    #[test]
    fn grant_assigns_identifier_once() {
        let ctx = AddressSpaceContext::new(0).unwrap();
        let mut calls = 0;
        let _ = ctx.grant_capability_with(CoprocessorType::new(1), || {
            calls += 1;
            Ok(ContextId::new(7))
        })
        .unwrap();
        let _ = ctx.grant_capability_with(CoprocessorType::new(2), || {
            calls += 1;
            Ok(ContextId::new(8))
        })
        .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(ctx.context_id(), ContextId::new(7));
    }

    #[test]
    fn failed_identifier_allocation_grants_nothing() {
        let ctx = AddressSpaceContext::new(0).unwrap();
        let result = ctx.grant_capability_with(CoprocessorType::new(1), || {
            Err(CoproError::OutOfMemory(Resource::ContextIds))
        });

        assert_eq!(result, Err(CoproError::OutOfMemory(Resource::ContextIds)));
        assert!(!ctx.has_capability(CoprocessorType::new(1)));
    }

    #[test]
    fn retire_clears_identifier_but_keeps_capabilities() {
        let ctx = AddressSpaceContext::new(0).unwrap();
        let _ = ctx
            .grant_capability_with(CoprocessorType::new(5), || Ok(ContextId::new(3)))
            .unwrap();

        let (id, units) = ctx.retire();
        assert_eq!(id, ContextId::new(3));
        assert!(units.is_empty());
        assert!(ctx.context_id().is_none());
        assert!(ctx.is_retired());
        assert!(ctx.has_capability(CoprocessorType::new(5)));
    }

    #[test]
    fn invalidation_and_identifier_change_stale_the_stamp() {
        let ctx = AddressSpaceContext::new(0).unwrap();
        let before_grant = ctx.translation_stamp();
        let _ = ctx
            .grant_capability_with(CoprocessorType::new(1), || Ok(ContextId::new(4)))
            .unwrap();
        assert!(!ctx.is_current(before_grant));

        let stamp = ctx.translation_stamp();
        assert_eq!(stamp.context_id(), ContextId::new(4));
        assert!(ctx.is_current(stamp));

        let (id, units) = ctx.begin_invalidation();
        assert_eq!(id, ContextId::new(4));
        assert!(units.is_empty());
        assert!(!ctx.is_current(stamp));

        let stamp = ctx.translation_stamp();
        let _ = ctx.retire();
        assert!(!ctx.is_current(stamp));
    }

    #[test]
    fn serials_are_unique_and_non_zero() {
        let a = AddressSpaceContext::new(0).unwrap();
        let b = AddressSpaceContext::new(0).unwrap();
        assert_ne!(a.serial(), 0);
        assert_ne!(a.serial(), b.serial());
    }

    #[test]
    fn concurrent_grants_transition_once() {
        use std::sync::Barrier;

        let ctx = AddressSpaceContext::new(0).unwrap();
        let barrier = Barrier::new(8);
        let ty = CoprocessorType::new(9);

        let transitions: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        ctx.grant_capability(ty).transitioned() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(transitions, 1);
        assert_eq!(ctx.snapshot().generation, 1);
    }
}
