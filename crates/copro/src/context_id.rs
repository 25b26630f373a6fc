//! Allocation of context identifiers.
//!
//! Identifiers come from a small bounded pool and are handed out lowest-first, so an
//! identifier released at context teardown is the next one reused.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::ContextIdPolicy;
use crate::context::ContextId;
use crate::error::{CoproError, Resource, Result};

struct IdBitmap {
    words: Vec<u64>,
    in_use: usize,
}

/// A bounded pool of context identifiers.
pub struct ContextIdAllocator {
    policy: ContextIdPolicy,
    bitmap: spin::Mutex<IdBitmap>,
}

impl ContextIdAllocator {
    /// Creates a pool according to `policy`.
    ///
    /// # Panics
    /// Panics if a tracked range is empty or includes [`ContextId::NONE`].
    pub fn new(policy: ContextIdPolicy) -> Self {
        let ids = match policy {
            ContextIdPolicy::Tracked { min, max } => {
                assert!(min != ContextId::NONE.as_u32(), "context id 0 is reserved");
                assert!(min <= max, "empty context id range");
                (max - min) as usize + 1
            }
            ContextIdPolicy::Untracked => 0,
        };

        Self {
            policy,
            bitmap: spin::Mutex::new(IdBitmap {
                words: vec![0; ids.div_ceil(64)],
                in_use: 0,
            }),
        }
    }

    /// Allocates the lowest free identifier.
    ///
    /// Returns [`ContextId::NONE`] when identifiers are not tracked.
    pub fn allocate(&self) -> Result<ContextId> {
        let ContextIdPolicy::Tracked { min, max } = self.policy else {
            return Ok(ContextId::NONE);
        };
        let count = (max - min) as usize + 1;

        let mut guard = self.bitmap.lock();
        let bitmap = &mut *guard;
        for (word_index, word) in bitmap.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let offset = word_index * 64 + bit;
            if offset >= count {
                break;
            }
            *word |= 1 << bit;
            bitmap.in_use += 1;

            let id = ContextId::new(min + offset as u32);
            log::debug!("allocated context id {}", id);
            return Ok(id);
        }

        log::warn!("context id pool exhausted ({} in use)", count);
        Err(CoproError::OutOfMemory(Resource::ContextIds))
    }

    /// Returns an identifier to the pool. Releasing [`ContextId::NONE`] does nothing.
    ///
    /// # Panics
    /// Panics if `id` is outside the pool's range.
    pub fn release(&self, id: ContextId) {
        if id.is_none() {
            return;
        }
        let ContextIdPolicy::Tracked { min, max } = self.policy else {
            panic!("released context id {id} on an untracked configuration");
        };
        assert!(
            (min..=max).contains(&id.as_u32()),
            "context id {id} outside pool"
        );

        let offset = (id.as_u32() - min) as usize;
        let mut guard = self.bitmap.lock();
        let bitmap = &mut *guard;
        let word = &mut bitmap.words[offset / 64];
        let mask = 1u64 << (offset % 64);
        debug_assert!(*word & mask != 0, "context id {id} released twice");
        if *word & mask != 0 {
            *word &= !mask;
            bitmap.in_use -= 1;
        }
        log::debug!("released context id {}", id);
    }

    /// Returns the number of identifiers currently allocated.
    pub fn in_use(&self) -> usize {
        self.bitmap.lock().in_use
    }

    pub fn policy(&self) -> ContextIdPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(min: u32, max: u32) -> ContextIdAllocator {
        ContextIdAllocator::new(ContextIdPolicy::Tracked { min, max })
    }

    #[test]
    fn allocates_lowest_first() {
        let ids = pool(1, 100);
        assert_eq!(ids.allocate(), Ok(ContextId::new(1)));
        assert_eq!(ids.allocate(), Ok(ContextId::new(2)));
        assert_eq!(ids.allocate(), Ok(ContextId::new(3)));
        assert_eq!(ids.in_use(), 3);
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let ids = pool(10, 12);
        for _ in 0..3 {
            ids.allocate().unwrap();
        }
        assert_eq!(
            ids.allocate(),
            Err(CoproError::OutOfMemory(Resource::ContextIds))
        );
    }

    #[test]
    fn released_id_is_reused() {
        let ids = pool(1, 2);
        let a = ids.allocate().unwrap();
        let b = ids.allocate().unwrap();
        ids.release(a);
        assert_eq!(ids.allocate(), Ok(a));
        assert_ne!(a, b);
        assert_eq!(ids.in_use(), 2);
    }

    #[test]
    fn pool_spanning_several_words() {
        let ids = pool(1, 130);
        let all: Vec<_> = (0..130).map(|_| ids.allocate().unwrap()).collect();
        assert_eq!(all.last(), Some(&ContextId::new(130)));
        assert!(ids.allocate().is_err());

        ids.release(ContextId::new(70));
        assert_eq!(ids.allocate(), Ok(ContextId::new(70)));
    }

    #[test]
    fn untracked_hands_out_none() {
        let ids = ContextIdAllocator::new(ContextIdPolicy::Untracked);
        assert_eq!(ids.allocate(), Ok(ContextId::NONE));
        ids.release(ContextId::NONE);
        assert_eq!(ids.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "context id 0 is reserved")]
    fn range_may_not_include_none() {
        let _ = pool(0, 4);
    }
}
