//! The synchronous dispatch protocol.
//!
//! Dispatch hands a request block to an idle coprocessor of the type named in the control
//! word. The instruction never blocks; it reports one of exactly three outcomes through a
//! condition field, and only [`Outcome::decode`] knows that encoding.

use bitfield_struct::bitfield;

use crate::crb::{ControlWord, CrbAddress};
use crate::error::{CoproError, Result, errno};
use crate::platform::Platform;

/// Condition field set by the dispatch instruction.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct ConditionField {
    /// Summary overflow copy. Not part of the outcome.
    pub so: bool,
    /// Rejected: no authorized coprocessor of the type.
    pub eq: bool,
    /// No idle instance of the type.
    pub gt: bool,
    /// Request initiated.
    pub lt: bool,
    #[bits(4)]
    _rsvd: u8,
}

/// The result of one dispatch attempt, ordered success < busy < not-found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Outcome {
    /// The coprocessor accepted the request and began working on it.
    Started,
    /// No idle instance was available; retry without re-issuing the barrier.
    Busy,
    /// No coprocessor of the type exists, or the address space is not authorized for it.
    NotFound,
}

impl Outcome {
    /// Decodes the condition field of a dispatch.
    ///
    /// Exactly one of the three outcome bits must be set.
    pub fn decode(condition: ConditionField) -> Result<Self> {
        match (condition.lt(), condition.gt(), condition.eq()) {
            (true, false, false) => Ok(Outcome::Started),
            (false, true, false) => Ok(Outcome::Busy),
            (false, false, true) => Ok(Outcome::NotFound),
            _ => Err(CoproError::InvalidCondition(condition.into_bits())),
        }
    }

    /// Encodes the outcome as the dispatch instruction reports it.
    pub fn encode(self) -> ConditionField {
        let condition = ConditionField::new();
        match self {
            Outcome::Started => condition.with_lt(true),
            Outcome::Busy => condition.with_gt(true),
            Outcome::NotFound => condition.with_eq(true),
        }
    }

    /// Returns 0, `-EBUSY` or `-ENODEV`.
    pub const fn errno(self) -> i32 {
        match self {
            Outcome::Started => 0,
            Outcome::Busy => -errno::EBUSY,
            Outcome::NotFound => -errno::ENODEV,
        }
    }
}

/// Whether a dispatch is the first attempt of a request or a retry of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// The request's data is new; publish it before dispatching.
    First,
    /// Nothing was written since the previous attempt; skip the barrier.
    Retry,
}

/// Issues one dispatch of the request block at `crb` on the current CPU.
///
/// A raw address from a caller goes through [`CrbAddress::new`] first, which rejects a
/// misaligned block with [`CoproError::Misaligned`].
pub fn dispatch<P: Platform>(
    platform: &P,
    control_word: ControlWord,
    crb: CrbAddress,
    attempt: Attempt,
) -> Result<Outcome> {
    if attempt == Attempt::First {
        platform.publish_barrier();
    }

    let outcome = Outcome::decode(platform.dispatch(control_word, crb.as_virtual()))?;

    trace_detail!(
        "dispatch {:#010x} crb {} ({:?}): {:?}",
        control_word.into_bits(),
        crb.as_virtual(),
        attempt,
        outcome
    );

    Ok(outcome)
}
