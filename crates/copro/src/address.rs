//! Address types shared by the dispatch path and the shadow translation cache.
//!
//! Coprocessors are handed the same effective addresses the owning process uses, and
//! resolve them through their own translation cache, so both sides of a translation are
//! always 64 bits wide regardless of the host's pointer width.

use core::fmt;
use core::ops::{Add, Sub};

/// Macro to define common address type functionality.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Returns true if the address is a multiple of `align`, which must be a power of two.
            #[inline]
            pub const fn is_aligned(self, align: u64) -> bool {
                debug_assert!(align.is_power_of_two());
                self.0 & (align - 1) == 0
            }

            /// Rounds the address down to a multiple of `align`, which must be a power of two.
            #[inline]
            pub const fn align_down(self, align: u64) -> Self {
                debug_assert!(align.is_power_of_two());
                Self(self.0 & !(align - 1))
            }

            /// Returns the offset of this address within an `align`-sized block.
            #[inline]
            pub const fn offset_in(self, align: u64) -> u64 {
                debug_assert!(align.is_power_of_two());
                self.0 & (align - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    VirtualAddress,
    "An effective address in the owning process's address space."
);
impl_address_common!(
    PhysicalAddress,
    "A physical address as seen by the coprocessor after translation."
);

impl VirtualAddress {
    /// Creates an address from a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        let va = VirtualAddress::new(0x1_2345);
        assert!(!va.is_aligned(0x1000));
        assert_eq!(va.align_down(0x1000), VirtualAddress::new(0x1_2000));
        assert_eq!(va.offset_in(0x1000), 0x345);
        assert!(VirtualAddress::new(0x4000).is_aligned(128));
    }

    #[test]
    fn formatting() {
        let pa = PhysicalAddress::new(0xdead_0000);
        assert_eq!(format!("{pa}"), "0xdead0000");
        assert_eq!(format!("{pa:?}"), "PhysicalAddress(0xdead0000)");
    }

    #[test]
    fn arithmetic() {
        let base = VirtualAddress::new(0x1000);
        let end = base + 0x80;
        assert_eq!(end - base, 0x80);
    }
}
