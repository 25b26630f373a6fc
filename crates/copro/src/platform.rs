//! The hardware seam.
//!
//! Everything that touches an instruction, a CPU-local register or another CPU goes
//! through [`Platform`]. The `arch` module provides the real implementation for the
//! target and, under test or `software-emulation`, a scale model of it.

use core::sync::atomic::{Ordering, fence};

use crate::cpu::{CpuId, CpuMask};
use crate::crb::ControlWord;
use crate::dispatch::ConditionField;
use crate::{CapabilityMask, ContextId, VirtualAddress};

/// Hardware operations needed to dispatch work and keep coprocessor state coherent.
pub trait Platform: Sync {
    /// Executes the dispatch instruction on the current CPU and returns its raw condition.
    ///
    /// Authorization is checked by hardware against the current CPU's loaded capability
    /// register, not against any in-memory context.
    fn dispatch(&self, control_word: ControlWord, crb: VirtualAddress) -> ConditionField;

    /// Makes every store the coprocessor must observe visible before a first dispatch.
    fn publish_barrier(&self) {
        fence(Ordering::Release);
    }

    /// Returns the CPU this code is running on.
    fn current_cpu(&self) -> CpuId;

    /// Returns the capability register currently loaded on this CPU.
    fn loaded_capabilities(&self) -> CapabilityMask;

    /// Loads the coprocessor context registers of the current CPU.
    fn load_context_registers(&self, capabilities: CapabilityMask, context_id: ContextId);

    /// Runs `action` on every CPU in `targets`, each time with that CPU current.
    ///
    /// Must not return until every target has completed `action`.
    fn cross_call(&self, targets: CpuMask, action: &(dyn Fn() + Sync));

    /// Runs `f` with interrupts disabled on the current CPU.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R;
}
