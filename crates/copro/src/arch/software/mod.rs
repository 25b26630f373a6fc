//! Software emulation of a coprocessor-capable machine.
//!
//! The emulated machine is a scale model of the real one:
//! - A fixed number of CPUs, each with its own capability and context-identifier
//!   registers. Threads "run on" a CPU through [`EmulatedPlatform::run_on`].
//! - A coprocessor fabric that checks authorization against the issuing CPU's registers,
//!   exactly like the hardware does, and never blocks.
//! - Cross-CPU calls that run the action synchronously with each target made current.
//!
//! Counters on every CPU let tests observe barriers, cross calls and interrupt-free
//! sections without hardware.

mod fabric;
mod logger;
mod page_table;

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};

use alloc::vec::Vec;

use crate::cpu::{CpuId, CpuMask, MAX_CPUS};
use crate::crb::ControlWord;
use crate::dispatch::ConditionField;
use crate::platform::Platform;
use crate::{CapabilityMask, ContextId, VirtualAddress};

pub use fabric::{EmulatedFabric, StartedRequest};
pub use logger::TestLogger;
pub use page_table::EmulatedPageTable;

std::thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
}

/// Registers and counters of one emulated CPU.
#[derive(Default)]
pub struct EmulatedCpu {
    capabilities: AtomicU64,
    context_id: AtomicU32,
    register_loads: AtomicU64,
    cross_calls: AtomicU64,
    interrupts_disabled: AtomicBool,
    interrupt_free_sections: AtomicU64,
}

impl EmulatedCpu {
    /// Returns the loaded capability register.
    pub fn capabilities(&self) -> CapabilityMask {
        CapabilityMask::from_bits(self.capabilities.load(Ordering::Acquire))
    }

    /// Returns the loaded context-identifier register.
    pub fn context_id(&self) -> ContextId {
        ContextId::new(self.context_id.load(Ordering::Acquire))
    }

    pub fn register_loads(&self) -> u64 {
        self.register_loads.load(Ordering::Relaxed)
    }

    /// Returns the number of cross calls this CPU has run and acknowledged.
    pub fn cross_calls(&self) -> u64 {
        self.cross_calls.load(Ordering::Relaxed)
    }

    pub fn interrupts_disabled(&self) -> bool {
        self.interrupts_disabled.load(Ordering::Acquire)
    }

    pub fn interrupt_free_sections(&self) -> u64 {
        self.interrupt_free_sections.load(Ordering::Relaxed)
    }
}

/// An emulated machine.
pub struct EmulatedPlatform {
    cpus: Vec<EmulatedCpu>,
    fabric: EmulatedFabric,
    barriers: AtomicU64,
}

impl EmulatedPlatform {
    /// Creates a machine with `cpu_count` CPUs and no coprocessor instances.
    ///
    /// # Panics
    /// Panics if `cpu_count` is zero or larger than [`MAX_CPUS`].
    pub fn new(cpu_count: usize) -> Self {
        assert!(
            cpu_count > 0 && cpu_count <= MAX_CPUS,
            "emulated cpu count out of range"
        );
        Self {
            cpus: (0..cpu_count).map(|_| EmulatedCpu::default()).collect(),
            fabric: EmulatedFabric::new(),
            barriers: AtomicU64::new(0),
        }
    }

    pub fn fabric(&self) -> &EmulatedFabric {
        &self.fabric
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// # Panics
    /// Panics if `cpu` does not exist on this machine.
    pub fn cpu(&self, cpu: CpuId) -> &EmulatedCpu {
        self.cpus
            .get(cpu.index() as usize)
            .unwrap_or_else(|| panic!("no emulated {cpu:?}"))
    }

    /// Returns the number of publish barriers issued.
    pub fn barriers(&self) -> u64 {
        self.barriers.load(Ordering::Relaxed)
    }

    /// Runs `f` on the calling thread with `cpu` as the current CPU.
    ///
    /// The previous current CPU is restored afterwards, even if `f` panics.
    pub fn run_on<R>(&self, cpu: CpuId, f: impl FnOnce() -> R) -> R {
        // Validate before switching.
        self.cpu(cpu);

        struct Restore(u32);
        impl Drop for Restore {
            fn drop(&mut self) {
                CURRENT_CPU.with(|current| current.set(self.0));
            }
        }

        let _restore = Restore(CURRENT_CPU.with(|current| current.replace(cpu.index())));
        f()
    }

    fn current(&self) -> &EmulatedCpu {
        self.cpu(self.current_cpu())
    }
}

impl Platform for EmulatedPlatform {
    fn dispatch(&self, control_word: ControlWord, crb: VirtualAddress) -> ConditionField {
        let loaded = self.current().capabilities();
        self.fabric.dispatch(control_word, crb, loaded).encode()
    }

    fn publish_barrier(&self) {
        fence(Ordering::Release);
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    fn current_cpu(&self) -> CpuId {
        CpuId::new(CURRENT_CPU.with(Cell::get))
    }

    fn loaded_capabilities(&self) -> CapabilityMask {
        self.current().capabilities()
    }

    fn load_context_registers(&self, capabilities: CapabilityMask, context_id: ContextId) {
        let cpu = self.current();
        cpu.context_id.store(context_id.as_u32(), Ordering::Release);
        cpu.capabilities.store(capabilities.bits(), Ordering::Release);
        cpu.register_loads.fetch_add(1, Ordering::Relaxed);
    }

    fn cross_call(&self, targets: CpuMask, action: &(dyn Fn() + Sync)) {
        for target in targets.iter() {
            self.run_on(target, action);
            self.cpu(target).cross_calls.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        let cpu = self.current();
        let was_disabled = cpu.interrupts_disabled.swap(true, Ordering::AcqRel);
        cpu.interrupt_free_sections.fetch_add(1, Ordering::Relaxed);
        let result = f();
        cpu.interrupts_disabled.store(was_disabled, Ordering::Release);
        result
    }
}
