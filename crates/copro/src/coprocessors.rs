//! The coprocessor subsystem.
//!
//! [`Coprocessors`] owns the unit registry and the context identifier pool, and exposes
//! the hooks the process-management layer calls: context creation and teardown, context
//! switch, work submission, fault handling and page-table change notification.
//!
//! Authorization is granted lazily. An address space starts with no coprocessor types;
//! the first dispatch of a type is rejected, the rejection is turned into a grant that
//! is pushed to every CPU running the address space, and the dispatch is retried once.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::CoproConfig;
use crate::context::AddressSpaceContext;
use crate::context_id::ContextIdAllocator;
use crate::crb::CoprocessorRequestBlock;
use crate::dispatch::{Attempt, Outcome, dispatch};
use crate::error::{CoproError, Result};
use crate::fault::{FaultRecord, FaultResolution};
use crate::page_table::{HostMapping, HostPageTable, PageProtection};
use crate::platform::Platform;
use crate::shadow::{
    Access, InstallError, InvalidationTicket, ShadowHit, ShadowTranslationCache,
};
use crate::unit::{CoprocessorUnit, UnitConfig, UnitRegistry};
use crate::{CapabilityMask, CoprocessorType, VirtualAddress};

/// Coprocessor state shared by every address space on one machine.
pub struct Coprocessors<P: Platform> {
    platform: P,
    config: CoproConfig,
    context_ids: ContextIdAllocator,
    units: UnitRegistry,
}

impl<P: Platform> Coprocessors<P> {
    pub fn new(platform: P, config: CoproConfig) -> Self {
        Self {
            platform,
            context_ids: ContextIdAllocator::new(config.context_ids),
            units: UnitRegistry::new(config.shadow_capacity),
            config,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &CoproConfig {
        &self.config
    }

    pub fn context_ids(&self) -> &ContextIdAllocator {
        &self.context_ids
    }

    pub fn units(&self) -> &UnitRegistry {
        &self.units
    }

    /// Registers a unit found by a driver.
    pub fn register_unit(&self, config: UnitConfig) -> Arc<CoprocessorUnit> {
        self.units.register(config)
    }

    pub fn get_unit(&self, index: u32) -> Result<Arc<CoprocessorUnit>> {
        self.units.get_unit(index)
    }

    pub fn get_unit_count(&self) -> u32 {
        self.units.get_unit_count()
    }

    /// Creates the coprocessor state of a new address space.
    pub fn context_init(&self) -> Result<Arc<AddressSpaceContext>> {
        let ctx = AddressSpaceContext::new(self.units.get_unit_count() as usize)?;
        Ok(Arc::new(ctx))
    }

    /// Tears down the coprocessor state of an address space that is going away.
    ///
    /// Every translation tagged with the context's identifier is invalidated on every unit
    /// that may hold one, and the identifier is returned to the pool only once all of
    /// those invalidations have completed. Without identifiers, the context's untagged
    /// entries are dropped from every unit it still owns.
    pub fn context_destroy(&self, ctx: &AddressSpaceContext) {
        let (context_id, units) = ctx.retire();

        if self.config.context_ids.is_tracked() {
            self.invalidate_units(&units, |shadow| shadow.invalidate_context(context_id));
        } else {
            let serial = ctx.serial();
            self.invalidate_units(&self.units.all(), |shadow| shadow.release_untagged(serial));
        }

        self.context_ids.release(context_id);
        log::info!(
            "destroyed coprocessor context {} ({} units invalidated)",
            context_id,
            units.len()
        );
    }

    /// Returns true if the address space has ever been granted `ty`.
    pub fn context_used(&self, ctx: &AddressSpaceContext, ty: CoprocessorType) -> bool {
        ctx.has_capability(ty)
    }

    /// Switches the current CPU to `ctx`.
    ///
    /// Without context identifiers every unit is handed to `ctx`, dropping the untagged
    /// translations of whichever address space used it before.
    pub fn activate(&self, ctx: &AddressSpaceContext) {
        ctx.mark_active(self.platform.current_cpu());
        if !self.config.context_ids.is_tracked() {
            let serial = ctx.serial();
            self.invalidate_units(&self.units.all(), |shadow| shadow.bind_untagged(serial));
        }
        self.sync_registers(ctx);
    }

    /// Records that the current CPU no longer runs `ctx`.
    pub fn deactivate(&self, ctx: &AddressSpaceContext) {
        ctx.mark_inactive(self.platform.current_cpu());
    }

    /// Dispatches `crb` from the current CPU, which must be running `ctx`.
    ///
    /// A rejection goes through fault-driven enablement and is retried exactly once; a
    /// second rejection means no coprocessor of the type exists. `Busy` is returned as
    /// [`CoproError::Busy`] without retrying; pass [`Attempt::Retry`] when resubmitting
    /// the same block.
    pub fn submit(
        &self,
        ctx: &AddressSpaceContext,
        crb: &CoprocessorRequestBlock,
        attempt: Attempt,
    ) -> Result<()> {
        debug_assert!(
            ctx.active_cpus().contains(self.platform.current_cpu()),
            "submitting for a context that is not running on this cpu"
        );

        let control_word = crb.control_word();
        let address = crb.address();
        // Capabilities only grow, so whatever was loaded before the dispatch was loaded
        // when the hardware checked it.
        let observed = self.platform.loaded_capabilities();

        match dispatch(&self.platform, control_word, address, attempt)? {
            Outcome::Started => return Ok(()),
            Outcome::Busy => return Err(CoproError::Busy),
            Outcome::NotFound => {}
        }

        let ty = control_word.coprocessor_type();
        self.enable(ctx, ty, observed)?;

        match dispatch(&self.platform, control_word, address, Attempt::Retry)? {
            Outcome::Started => Ok(()),
            Outcome::Busy => Err(CoproError::Busy),
            Outcome::NotFound => {
                log::warn!("no coprocessor of type {} after authorization", ty);
                Err(CoproError::NoDevice(ty))
            }
        }
    }

    /// Resolves a coprocessor authorization fault reported by a trap.
    ///
    /// On success the faulting dispatch may be retried.
    pub fn handle_fault(
        &self,
        ctx: &AddressSpaceContext,
        record: &FaultRecord,
    ) -> Result<FaultResolution> {
        let ty = record.coprocessor_type(self.config.hint_policy)?;
        self.enable(ctx, ty, record.loaded)
    }

    /// Grants `ty` to `ctx` after a rejected dispatch on the current CPU.
    ///
    /// `observed` is the capability register the current CPU had loaded when the dispatch
    /// was rejected. If it already contained `ty` the hardware was authorized and the type
    /// does not exist, which is reported as [`CoproError::NoDevice`].
    pub fn enable(
        &self,
        ctx: &AddressSpaceContext,
        ty: CoprocessorType,
        observed: CapabilityMask,
    ) -> Result<FaultResolution> {
        if observed.contains(ty) {
            log::warn!("coprocessor type {} rejected while authorized", ty);
            return Err(CoproError::NoDevice(ty));
        }

        let grant = ctx.grant_capability_with(ty, || self.context_ids.allocate())?;
        if grant.transitioned() {
            // Every CPU running the address space must reload before any of them returns
            // to dispatching, or it faults again on a grant it has not seen.
            self.platform
                .cross_call(ctx.active_cpus(), &|| self.sync_registers_if_running(ctx));
            log::debug!(
                "propagated coprocessor type {} (generation {}) to {:?}",
                ty,
                grant.snapshot().generation,
                ctx.active_cpus()
            );
            Ok(FaultResolution::Granted)
        } else {
            // Someone else granted it; their broadcast may not have reached us yet.
            self.sync_registers(ctx);
            Ok(FaultResolution::Refreshed)
        }
    }

    fn sync_registers(&self, ctx: &AddressSpaceContext) {
        self.platform
            .load_context_registers(ctx.capabilities(), ctx.context_id());
    }

    fn sync_registers_if_running(&self, ctx: &AddressSpaceContext) {
        if ctx.active_cpus().contains(self.platform.current_cpu()) {
            self.sync_registers(ctx);
        }
    }

    /// Fills `unit`'s translation cache after the coprocessor missed on `va` for `ctx`.
    ///
    /// Permissions are re-derived from the host page table on every miss; a clean
    /// writable page is installed read-only so that the first write misses again and is
    /// recorded as dirty.
    ///
    /// If the context is invalidated between reading the host page table and installing
    /// the entry, nothing is installed and the host page table is read again. A torn-down
    /// context, or one that has no identifier yet while identifiers are tracked, gets
    /// [`CoproError::NoTranslation`]. Without identifiers a unit serves one address space
    /// at a time, and a miss for another one gets [`CoproError::Busy`].
    pub fn handle_translation_miss(
        &self,
        ctx: &AddressSpaceContext,
        unit: &Arc<CoprocessorUnit>,
        page_table: &impl HostPageTable,
        va: VirtualAddress,
        access: Access,
    ) -> Result<ShadowHit> {
        let tracked = self.config.context_ids.is_tracked();
        let serial = ctx.serial();

        loop {
            let stamp = ctx.translation_stamp();
            if ctx.is_retired() || (tracked && stamp.context_id().is_none()) {
                return Err(CoproError::NoTranslation(va));
            }
            if !tracked && !unit.shadow().claim_untagged(serial) {
                return Err(CoproError::Busy);
            }

            let mapping = page_table
                .lookup(va)
                .ok_or(CoproError::NoTranslation(va))?;
            let protection =
                derive_protection(&mapping, access).ok_or(CoproError::ProtectionFault(va))?;
            ctx.attach_unit(unit)?;

            let installed = self.platform.without_interrupts(|| {
                unit.shadow()
                    .install_if(stamp.context_id(), va, &mapping, protection, || {
                        ctx.is_current(stamp)
                            && (tracked || unit.shadow().untagged_owner() == serial)
                    })
            });

            match installed {
                Ok(hit) => {
                    if access == Access::Write {
                        page_table.mark_dirty(va);
                    }
                    return Ok(hit);
                }
                Err(InstallError::NoSizeClass) => return Err(CoproError::NoTranslation(va)),
                Err(InstallError::Stale) => {
                    trace_detail!("translation of {} invalidated during miss, retrying", va);
                }
            }
        }
    }

    /// Invalidates `ctx`'s translations of `va` on every unit that may hold one.
    ///
    /// Call after unmapping the page or narrowing its protection; the change is complete
    /// when this returns, and no miss that read the old mapping can install it afterwards.
    pub fn invalidate_page(&self, ctx: &AddressSpaceContext, va: VirtualAddress) {
        let (context_id, units) = ctx.begin_invalidation();
        self.invalidate_units(&units, |shadow| shadow.invalidate_page(context_id, va));
    }

    /// Removes the host mapping covering `va` and every cached translation of it.
    pub fn unmap_page(
        &self,
        ctx: &AddressSpaceContext,
        page_table: &impl HostPageTable,
        va: VirtualAddress,
    ) -> Option<HostMapping> {
        let mapping = page_table.unmap(va)?;
        self.invalidate_page(ctx, va);
        Some(mapping)
    }

    /// Changes the protection of the host mapping covering `va` and drops every cached
    /// translation of it, so the next coprocessor access re-derives its permissions.
    pub fn protect_page(
        &self,
        ctx: &AddressSpaceContext,
        page_table: &impl HostPageTable,
        va: VirtualAddress,
        protection: PageProtection,
    ) -> bool {
        if !page_table.protect(va, protection) {
            return false;
        }
        self.invalidate_page(ctx, va);
        true
    }

    /// Flushes every translation on one unit.
    pub fn flush_unit(&self, index: u32) -> Result<()> {
        let unit = self.units.get_unit(index)?;
        self.invalidate_units(core::slice::from_ref(&unit), |shadow| shadow.flush_all());
        log::debug!("flushed coprocessor unit {}", index);
        Ok(())
    }

    /// Flushes every translation on every unit.
    pub fn flush_all(&self) {
        let units = self.units.all();
        self.invalidate_units(&units, |shadow| shadow.flush_all());
        log::debug!("flushed {} coprocessor units", units.len());
    }

    /// Issues an invalidation on every unit, then waits for all of them.
    ///
    /// Interrupts stay disabled on the current CPU throughout, so a translation miss
    /// taken here cannot spin on a cache lock this CPU already holds.
    fn invalidate_units(
        &self,
        units: &[Arc<CoprocessorUnit>],
        issue: impl Fn(&ShadowTranslationCache) -> InvalidationTicket,
    ) {
        self.platform.without_interrupts(|| {
            let tickets: Vec<_> = units.iter().map(|unit| issue(unit.shadow())).collect();
            for (unit, ticket) in units.iter().zip(tickets) {
                unit.shadow().wait(ticket);
            }
        });
    }
}

/// Works out the permissions of a new cache entry, or `None` if the access is not allowed.
fn derive_protection(mapping: &HostMapping, access: Access) -> Option<PageProtection> {
    let host = mapping.protection;
    if !host.contains(PageProtection::READ) {
        return None;
    }

    match access {
        Access::Write if !host.contains(PageProtection::WRITE) => None,
        Access::Write => Some(host | PageProtection::DIRTY),
        Access::Read if host.contains(PageProtection::DIRTY) => Some(host),
        Access::Read => Some(host - PageProtection::WRITE),
    }
}
