//! CPU identifiers and the sets used to target cross-CPU calls.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of CPUs a [`CpuMask`] can describe.
pub const MAX_CPUS: usize = 64;

/// Index of a host CPU.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Creates a CPU id.
    ///
    /// # Panics
    /// Panics if `index` is not below [`MAX_CPUS`].
    pub const fn new(index: u32) -> Self {
        assert!((index as usize) < MAX_CPUS, "cpu index out of range");
        Self(index)
    }

    /// Returns the raw CPU index.
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// A set of CPUs.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.0) != 0
    }

    /// Returns this set with `cpu` added.
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | (1 << cpu.0))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates over the CPUs in the set, lowest index first.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut remaining = self.0;
        core::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let index = remaining.trailing_zeros();
            remaining &= remaining - 1;
            Some(CpuId(index))
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A [`CpuMask`] updated concurrently as CPUs switch address spaces.
#[derive(Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn insert(&self, cpu: CpuId) {
        self.0.fetch_or(1 << cpu.0, Ordering::AcqRel);
    }

    pub fn remove(&self, cpu: CpuId) {
        self.0.fetch_and(!(1 << cpu.0), Ordering::AcqRel);
    }

    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_iteration_is_ordered() {
        let mask = CpuMask::empty()
            .with(CpuId::new(5))
            .with(CpuId::new(0))
            .with(CpuId::new(63));
        let cpus: Vec<_> = mask.iter().map(CpuId::index).collect();
        assert_eq!(cpus, [0, 5, 63]);
        assert_eq!(mask.len(), 3);
    }

    #[test]
    fn atomic_mask_tracks_membership() {
        let mask = AtomicCpuMask::new();
        mask.insert(CpuId::new(2));
        mask.insert(CpuId::new(3));
        mask.remove(CpuId::new(2));
        assert!(!mask.load().contains(CpuId::new(2)));
        assert!(mask.load().contains(CpuId::new(3)));
    }

    #[test]
    #[should_panic(expected = "cpu index out of range")]
    fn cpu_index_bounds() {
        let _ = CpuId::new(64);
    }
}
