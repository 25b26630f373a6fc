#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![cfg_attr(target_arch = "powerpc64", feature(asm_experimental_arch))]

//! # Copro
//!
//! Copro manages user-space access to on-chip coprocessors that are driven by a
//! store-indexed dispatch instruction. It provides:
//!
//! - The dispatch protocol and its three-way outcome.
//! - Per-address-space capability contexts, granted lazily on the first rejected dispatch
//!   and propagated to every CPU running the address space.
//! - Coprocessor context identifiers and unit enumeration.
//! - A per-unit shadow translation cache kept coherent with the host page tables.
//! - Software emulation of the hardware for testing in non-kernel environments.

extern crate alloc;

/// Trace logging that is compiled out of release builds unless `detailed-logging` is on.
macro_rules! trace_detail {
    ($($arg:tt)*) => {
        #[cfg(any(debug_assertions, feature = "detailed-logging"))]
        log::trace!($($arg)*);
    };
}

mod address;
pub mod arch;
mod config;
mod context;
mod context_id;
mod coprocessors;
mod cpu;
mod crb;
mod dispatch;
mod error;
mod fault;
mod page_table;
mod platform;
mod shadow;
mod unit;

pub use address::{PhysicalAddress, VirtualAddress};
pub use config::{ContextIdPolicy, CoproConfig, HintPolicy};
pub use context::{
    AddressSpaceContext, CapabilityMask, ContextId, ContextSnapshot, CoprocessorType, Grant,
    TranslationStamp,
};
pub use context_id::ContextIdAllocator;
pub use coprocessors::Coprocessors;
pub use cpu::{AtomicCpuMask, CpuId, CpuMask, MAX_CPUS};
pub use crb::{CRB_ALIGN, CRB_SIZE, ControlWord, CoprocessorRequestBlock, CrbAddress};
pub use dispatch::{Attempt, ConditionField, Outcome, dispatch};
pub use error::{CoproError, Resource, Result, errno};
pub use fault::{FaultRecord, FaultResolution, FaultSyndrome};
pub use page_table::{HostMapping, HostPageTable, PageProtection};
pub use platform::Platform;
pub use shadow::{
    Access, EntryKind, InstallError, InvalidationTicket, Miss, ShadowHit, ShadowStats,
    ShadowTranslationCache, SizeClass,
};
pub use unit::{
    CoprocessorUnit, MAX_SLOTS, Region, RegionLayout, UnitConfig, UnitRegistry, VfSlot,
};
