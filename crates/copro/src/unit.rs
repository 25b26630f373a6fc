//! Coprocessor units and their enumeration.
//!
//! A unit is one device instance. It exposes a number of virtual-function slots, each
//! with fixed regions inside the unit's reserved memory window, and owns the shadow
//! translation cache for every address space that has used it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{CoproError, Result};
use crate::shadow::ShadowTranslationCache;
use crate::CoprocessorType;

/// Maximum number of virtual-function slots a unit can expose.
pub const MAX_SLOTS: u16 = 64;

/// A region of a unit's reserved memory window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Unit-wide control registers, present once.
    Control,
    /// Per-slot request queue.
    Queue,
    /// Per-slot completion area.
    Completion,
}

/// Layout of a unit's reserved memory window.
///
/// The control region comes first, followed by one queue region per slot and then one
/// completion region per slot. Every offset is a pure function of the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub control_size: u64,
    pub queue_size: u64,
    pub completion_size: u64,
    pub slots: u16,
}

impl RegionLayout {
    /// Returns the offset of `region` for slot `slot` within the window.
    ///
    /// The control region is shared, so `slot` is ignored for it.
    pub const fn offset(&self, region: Region, slot: u16) -> Result<u64> {
        if matches!(region, Region::Control) {
            return Ok(0);
        }
        if slot >= self.slots {
            return Err(CoproError::InvalidSlot(slot));
        }
        let slot = slot as u64;
        let queues = self.control_size;
        let completions = queues + self.slots as u64 * self.queue_size;

        Ok(match region {
            Region::Control => 0,
            Region::Queue => queues + slot * self.queue_size,
            Region::Completion => completions + slot * self.completion_size,
        })
    }

    /// Returns the size of one instance of `region`.
    pub const fn region_size(&self, region: Region) -> u64 {
        match region {
            Region::Control => self.control_size,
            Region::Queue => self.queue_size,
            Region::Completion => self.completion_size,
        }
    }

    /// Returns the size of the whole window.
    pub const fn total_size(&self) -> u64 {
        self.control_size + self.slots as u64 * (self.queue_size + self.completion_size)
    }
}

/// Static description of a unit supplied by the driver that found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitConfig {
    pub coprocessor_type: CoprocessorType,
    pub layout: RegionLayout,
}

/// A claimed virtual-function slot.
#[derive(Debug, PartialEq, Eq)]
pub struct VfSlot(u16);

impl VfSlot {
    pub fn index(&self) -> u16 {
        self.0
    }
}

/// One coprocessor device instance.
pub struct CoprocessorUnit {
    index: u32,
    config: UnitConfig,
    claimed: spin::Mutex<u64>,
    shadow: ShadowTranslationCache,
}

impl CoprocessorUnit {
    fn new(index: u32, config: UnitConfig, shadow_capacity: usize) -> Self {
        assert!(
            config.layout.slots <= MAX_SLOTS,
            "unit cannot expose more than {MAX_SLOTS} slots"
        );
        Self {
            index,
            config,
            claimed: spin::Mutex::new(0),
            shadow: ShadowTranslationCache::new(shadow_capacity),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn coprocessor_type(&self) -> CoprocessorType {
        self.config.coprocessor_type
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.config.layout
    }

    pub fn max_slots(&self) -> u16 {
        self.config.layout.slots
    }

    pub fn shadow(&self) -> &ShadowTranslationCache {
        &self.shadow
    }

    /// Claims the lowest free virtual-function slot.
    pub fn claim_slot(&self) -> Result<VfSlot> {
        let mut claimed = self.claimed.lock();
        let free = !*claimed & slot_mask(self.max_slots());
        if free == 0 {
            return Err(CoproError::SlotsExhausted(self.index));
        }
        let slot = free.trailing_zeros() as u16;
        *claimed |= 1 << slot;
        Ok(VfSlot(slot))
    }

    /// Returns a slot claimed from this unit.
    pub fn release_slot(&self, slot: VfSlot) {
        let mut claimed = self.claimed.lock();
        debug_assert!(*claimed & (1 << slot.0) != 0, "slot {} not claimed", slot.0);
        *claimed &= !(1 << slot.0);
    }

    /// Returns the number of claimed slots.
    pub fn slots_in_use(&self) -> u16 {
        self.claimed.lock().count_ones() as u16
    }
}

impl fmt::Debug for CoprocessorUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoprocessorUnit")
            .field("index", &self.index)
            .field("coprocessor_type", &self.config.coprocessor_type)
            .field("slots", &self.config.layout.slots)
            .finish_non_exhaustive()
    }
}

const fn slot_mask(slots: u16) -> u64 {
    if slots >= 64 {
        u64::MAX
    } else {
        (1 << slots) - 1
    }
}

/// The units known to the system, indexed in registration order.
pub struct UnitRegistry {
    units: spin::RwLock<Vec<Arc<CoprocessorUnit>>>,
    shadow_capacity: usize,
}

impl UnitRegistry {
    pub fn new(shadow_capacity: usize) -> Self {
        Self {
            units: spin::RwLock::new(Vec::new()),
            shadow_capacity,
        }
    }

    /// Registers a unit and returns it. Its index is the number of units registered before it.
    pub fn register(&self, config: UnitConfig) -> Arc<CoprocessorUnit> {
        let mut units = self.units.write();
        let index = units.len() as u32;
        let unit = Arc::new(CoprocessorUnit::new(index, config, self.shadow_capacity));
        units.push(unit.clone());

        log::info!(
            "registered coprocessor unit {} (type {}, {} slots, window {:#x} bytes)",
            index,
            config.coprocessor_type,
            config.layout.slots,
            config.layout.total_size()
        );
        unit
    }

    pub fn get_unit(&self, index: u32) -> Result<Arc<CoprocessorUnit>> {
        self.units
            .read()
            .get(index as usize)
            .cloned()
            .ok_or(CoproError::NoSuchUnit(index))
    }

    pub fn get_unit_count(&self) -> u32 {
        self.units.read().len() as u32
    }

    /// Returns every unit of `ty`.
    pub fn units_of_type(&self, ty: CoprocessorType) -> Vec<Arc<CoprocessorUnit>> {
        self.units
            .read()
            .iter()
            .filter(|unit| unit.coprocessor_type() == ty)
            .cloned()
            .collect()
    }

    /// Returns a snapshot of every registered unit.
    pub fn all(&self) -> Vec<Arc<CoprocessorUnit>> {
        self.units.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: RegionLayout = RegionLayout {
        control_size: 0x1000,
        queue_size: 0x4000,
        completion_size: 0x800,
        slots: 4,
    };

    fn config(ty: u8) -> UnitConfig {
        UnitConfig {
            coprocessor_type: CoprocessorType::new(ty),
            layout: LAYOUT,
        }
    }

    #[test]
    fn regions_are_stacked() {
        assert_eq!(LAYOUT.offset(Region::Control, 0), Ok(0));
        assert_eq!(LAYOUT.offset(Region::Queue, 0), Ok(0x1000));
        assert_eq!(LAYOUT.offset(Region::Queue, 3), Ok(0x1000 + 3 * 0x4000));
        assert_eq!(LAYOUT.offset(Region::Completion, 0), Ok(0x1000 + 4 * 0x4000));
        assert_eq!(
            LAYOUT.offset(Region::Completion, 2),
            Ok(0x1000 + 4 * 0x4000 + 2 * 0x800)
        );
        assert_eq!(LAYOUT.total_size(), 0x1000 + 4 * (0x4000 + 0x800));
    }

    #[test]
    fn regions_do_not_overlap() {
        let mut spans = Vec::new();
        spans.push((0, LAYOUT.control_size));
        for slot in 0..LAYOUT.slots {
            for region in [Region::Queue, Region::Completion] {
                let start = LAYOUT.offset(region, slot).unwrap();
                spans.push((start, start + LAYOUT.region_size(region)));
            }
        }
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
        assert_eq!(spans.last().unwrap().1, LAYOUT.total_size());
    }

    #[test]
    fn offset_rejects_out_of_range_slot() {
        assert_eq!(
            LAYOUT.offset(Region::Queue, 4),
            Err(CoproError::InvalidSlot(4))
        );
    }

    #[test]
    fn registry_indexes_in_order() {
        let registry = UnitRegistry::new(8);
        let a = registry.register(config(1));
        let b = registry.register(config(2));
        registry.register(config(1));

        assert_eq!(registry.get_unit_count(), 3);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert!(Arc::ptr_eq(&registry.get_unit(1).unwrap(), &b));
        assert_eq!(registry.get_unit(3).unwrap_err(), CoproError::NoSuchUnit(3));
        assert_eq!(registry.units_of_type(CoprocessorType::new(1)).len(), 2);
    }

    #[test]
    fn slots_are_bounded() {
        let registry = UnitRegistry::new(8);
        let unit = registry.register(config(1));

        let slots: Vec<_> = (0..4).map(|_| unit.claim_slot().unwrap()).collect();
        assert_eq!(unit.claim_slot(), Err(CoproError::SlotsExhausted(0)));
        assert_eq!(unit.slots_in_use(), 4);

        let mut slots = slots.into_iter();
        let first = slots.next().unwrap();
        assert_eq!(first.index(), 0);
        unit.release_slot(first);
        assert_eq!(unit.claim_slot().map(|s| s.index()), Ok(0));
    }
}
