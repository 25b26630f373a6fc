//! Architecture-specific implementations of [`Platform`](crate::Platform).
//!
//! The hardware implementation is compiled on targets that have the dispatch instruction.
//! Tests and the `software-emulation` feature get an emulated machine instead.

#[cfg(target_arch = "powerpc64")]
mod powerpc64;
#[cfg(target_arch = "powerpc64")]
pub use powerpc64::{HardwarePlatform, SmpHooks};

#[cfg(any(test, feature = "software-emulation"))]
pub mod software;
