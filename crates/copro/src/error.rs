//! Errors surfaced by dispatch, capability enablement and translation maintenance.

use core::fmt;

use crate::{CoprocessorType, VirtualAddress};

/// Result type used throughout the crate.
pub type Result<T> = core::result::Result<T, CoproError>;

/// Negative error codes returned to callers that speak the C calling convention.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

/// The resource that ran out when [`CoproError::OutOfMemory`] is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// The context identifier pool is empty.
    ContextIds,
    /// Per-context bookkeeping could not be allocated.
    ContextState,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::ContextIds => f.write_str("context identifiers"),
            Resource::ContextState => f.write_str("context state"),
        }
    }
}

/// Errors that can occur while issuing work to a coprocessor or maintaining its translations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CoproError {
    /// No idle instance of the requested type; the caller decides whether to retry.
    #[error("no idle coprocessor instance")]
    Busy,
    /// No coprocessor of the requested type exists, even with authorization granted.
    #[error("no coprocessor of type {0}")]
    NoDevice(CoprocessorType),
    /// A bounded resource was exhausted.
    #[error("out of {0}")]
    OutOfMemory(Resource),
    /// A request block address is not 128-byte aligned.
    #[error("request block at {0} is not 128-byte aligned")]
    Misaligned(VirtualAddress),
    /// A fault did not identify a coprocessor type and none could be supplied.
    #[error("fault does not identify a coprocessor type")]
    UnknownType,
    /// A fault record was not raised by a coprocessor authorization failure.
    #[error("fault is not a coprocessor authorization fault")]
    NotCoprocessorFault,
    /// The owning process has no mapping for the address.
    #[error("no translation for {0}")]
    NoTranslation(VirtualAddress),
    /// The access is not permitted by the page's protection.
    #[error("access to {0} violates page protection")]
    ProtectionFault(VirtualAddress),
    /// No unit is registered at the index.
    #[error("no coprocessor unit at index {0}")]
    NoSuchUnit(u32),
    /// A virtual-function slot index is outside the unit's slot count.
    #[error("virtual function slot {0} out of range")]
    InvalidSlot(u16),
    /// Every virtual-function slot of the unit is claimed.
    #[error("all virtual function slots of unit {0} are in use")]
    SlotsExhausted(u32),
    /// The dispatch instruction reported a condition outside its three outcomes.
    #[error("unrecognized dispatch condition {0:#x}")]
    InvalidCondition(u8),
}

impl CoproError {
    /// Returns the negative error code for this error.
    pub const fn errno(self) -> i32 {
        -match self {
            CoproError::Busy => errno::EBUSY,
            CoproError::NoDevice(_) => errno::ENODEV,
            CoproError::OutOfMemory(_) => errno::ENOMEM,
            CoproError::Misaligned(_)
            | CoproError::UnknownType
            | CoproError::NotCoprocessorFault
            | CoproError::InvalidSlot(_) => errno::EINVAL,
            CoproError::NoTranslation(_) | CoproError::ProtectionFault(_) => errno::EFAULT,
            CoproError::NoSuchUnit(_) => errno::ENODEV,
            CoproError::SlotsExhausted(_) => errno::ENOSPC,
            CoproError::InvalidCondition(_) => errno::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(CoproError::Busy.errno(), -errno::EBUSY);
        assert_eq!(
            CoproError::NoDevice(CoprocessorType::new(3)).errno(),
            -errno::ENODEV
        );
        assert_eq!(
            CoproError::OutOfMemory(Resource::ContextIds).errno(),
            -errno::ENOMEM
        );
    }

    #[test]
    fn messages() {
        let err = CoproError::Misaligned(VirtualAddress::new(0x1040));
        assert_eq!(err.to_string(), "request block at 0x1040 is not 128-byte aligned");
        assert_eq!(
            CoproError::OutOfMemory(Resource::ContextIds).to_string(),
            "out of context identifiers"
        );
    }
}
