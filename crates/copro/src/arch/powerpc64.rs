//! 64-bit Power processors with the store-indexed coprocessor dispatch instruction.
//!
//! Dispatch, the capability register and the context-identifier register are handled
//! here directly. Knowing which CPU is running and interrupting other CPUs belong to the
//! kernel, which supplies them as [`SmpHooks`].

use core::arch::asm;

use crate::cpu::{CpuId, CpuMask};
use crate::crb::ControlWord;
use crate::dispatch::ConditionField;
use crate::platform::Platform;
use crate::{CapabilityMask, ContextId, VirtualAddress};

/// Available coprocessor register.
const SPRN_ACOP: u32 = 31;
/// Process identifier register, which tags coprocessor translations.
const SPRN_PID: u32 = 48;
/// External interrupt enable bit of the machine state register.
const MSR_EE: u64 = 1 << 15;

/// Kernel services the hardware platform depends on.
#[derive(Clone, Copy)]
pub struct SmpHooks {
    /// Returns the CPU the caller is running on.
    pub current_cpu: fn() -> CpuId,
    /// Sends an inter-processor interrupt that runs the action on every CPU in the mask,
    /// the caller included if present, and waits until each of them has finished it.
    pub call_function_many: fn(CpuMask, &(dyn Fn() + Sync)),
}

/// The real machine.
pub struct HardwarePlatform {
    smp: SmpHooks,
}

impl HardwarePlatform {
    pub const fn new(smp: SmpHooks) -> Self {
        Self { smp }
    }
}

/// The capability register numbers types from its most significant bit.
fn acop_from_mask(mask: CapabilityMask) -> u64 {
    mask.bits().reverse_bits()
}

fn mask_from_acop(acop: u64) -> CapabilityMask {
    CapabilityMask::from_bits(acop.reverse_bits())
}

impl Platform for HardwarePlatform {
    fn dispatch(&self, control_word: ControlWord, crb: VirtualAddress) -> ConditionField {
        let cr: u64;
        // SAFETY: The instruction reads the 128-byte block at `crb`, which the caller keeps
        // alive and aligned. Only CR0 is changed, and it is read back immediately.
        unsafe {
            asm!(
                "icswx. {ccw}, 0, {crb}",
                "mfcr {cr}",
                ccw = in(reg) control_word.into_bits() as u64,
                crb = in(reg) crb.as_u64(),
                cr = lateout(reg) cr,
                options(nostack),
            );
        }
        // CR0 is the most significant nibble of the 32-bit condition register.
        ConditionField::from_bits(((cr >> 28) & 0xf) as u8)
    }

    fn publish_barrier(&self) {
        // SAFETY: A full memory barrier has no other effect.
        unsafe { asm!("sync", options(nostack, preserves_flags)) };
    }

    fn current_cpu(&self) -> CpuId {
        (self.smp.current_cpu)()
    }

    fn loaded_capabilities(&self) -> CapabilityMask {
        let acop: u64;
        // SAFETY: Reading ACOP has no side effects.
        unsafe {
            asm!(
                "mfspr {acop}, {spr}",
                acop = out(reg) acop,
                spr = const SPRN_ACOP,
                options(nomem, nostack, preserves_flags),
            );
        }
        mask_from_acop(acop)
    }

    fn load_context_registers(&self, capabilities: CapabilityMask, context_id: ContextId) {
        // SAFETY: Both registers only affect coprocessor dispatch and translation from this
        // CPU. The identifier is written first so a newly authorized type never dispatches
        // under a stale identifier.
        unsafe {
            asm!(
                "mtspr {pid_spr}, {pid}",
                "mtspr {acop_spr}, {acop}",
                "isync",
                pid = in(reg) context_id.as_u32() as u64,
                acop = in(reg) acop_from_mask(capabilities),
                pid_spr = const SPRN_PID,
                acop_spr = const SPRN_ACOP,
                options(nostack, preserves_flags),
            );
        }
    }

    fn cross_call(&self, targets: CpuMask, action: &(dyn Fn() + Sync)) {
        if !targets.is_empty() {
            (self.smp.call_function_many)(targets, action);
        }
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        let msr: u64;
        // SAFETY: Clearing EE only masks external interrupts on this CPU; it is restored
        // below to its previous value.
        unsafe {
            asm!(
                "mfmsr {msr}",
                "andc {tmp}, {msr}, {ee}",
                "mtmsrd {tmp}, 1",
                msr = out(reg) msr,
                tmp = out(reg) _,
                ee = in(reg) MSR_EE,
                options(nostack, preserves_flags),
            );
        }

        let result = f();

        // SAFETY: Restores the interrupt state read above.
        unsafe { asm!("mtmsrd {msr}, 1", msr = in(reg) msr, options(nostack, preserves_flags)) };
        result
    }
}
