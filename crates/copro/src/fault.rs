//! Decoding of coprocessor authorization faults.
//!
//! When a dispatch is rejected the hardware may raise a trap whose syndrome says the
//! coprocessor type was unavailable. Some variants also report which type in a reserved
//! field; others leave it empty, and the type has to come from the request that was
//! attempted instead.

use bitfield_struct::bitfield;

use crate::config::HintPolicy;
use crate::crb::ControlWord;
use crate::error::{CoproError, Result};
use crate::{CapabilityMask, CoprocessorType};

/// Syndrome word reported with a coprocessor fault.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct FaultSyndrome {
    /// Coprocessor type hint, meaningful only when `hint_valid` is set.
    #[bits(6)]
    pub hint: u8,
    pub hint_valid: bool,
    #[bits(7)]
    _rsvd: u8,
    /// The fault was raised because the coprocessor type is unavailable.
    pub unavailable_type: bool,
    #[bits(17)]
    _rsvd2: u32,
}

/// Everything the trap handler captured about a coprocessor fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub syndrome: FaultSyndrome,
    /// Control word of the faulting request, if the handler could recover it.
    pub control_word: Option<ControlWord>,
    /// Capability register loaded on the faulting CPU when the fault was raised.
    pub loaded: CapabilityMask,
}

impl FaultRecord {
    /// Works out which coprocessor type the fault is about.
    pub fn coprocessor_type(&self, policy: HintPolicy) -> Result<CoprocessorType> {
        if !self.syndrome.unavailable_type() {
            return Err(CoproError::NotCoprocessorFault);
        }

        let hinted = self
            .syndrome
            .hint_valid()
            .then(|| CoprocessorType::new(self.syndrome.hint()));
        let attempted = self.control_word.map(ControlWord::coprocessor_type);

        let ty = match policy {
            HintPolicy::Advisory => hinted.or(attempted),
            HintPolicy::Trusted => hinted,
            HintPolicy::Ignored => attempted,
        };

        if hinted.is_some() && attempted.is_some() && hinted != attempted {
            log::warn!(
                "fault hint {:?} disagrees with attempted type {:?}",
                hinted,
                attempted
            );
        }

        ty.ok_or(CoproError::UnknownType)
    }
}

/// How a fault was resolved before the dispatch is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// This fault granted the type and propagated it to every CPU running the context.
    Granted,
    /// The type was already granted; only this CPU's registers were stale and reloaded.
    Refreshed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(syndrome: FaultSyndrome, control_word: Option<ControlWord>) -> FaultRecord {
        FaultRecord {
            syndrome,
            control_word,
            loaded: CapabilityMask::empty(),
        }
    }

    fn unavailable() -> FaultSyndrome {
        FaultSyndrome::new().with_unavailable_type(true)
    }

    #[test]
    fn unavailable_bit_position() {
        assert_eq!(unavailable().into_bits(), 0x4000);
    }

    #[test]
    fn other_faults_are_not_ours() {
        let fault = record(FaultSyndrome::new(), Some(ControlWord::from_bits(0x1)));
        assert_eq!(
            fault.coprocessor_type(HintPolicy::Advisory),
            Err(CoproError::NotCoprocessorFault)
        );
    }

    #[test]
    fn advisory_prefers_valid_hint() {
        let syndrome = unavailable().with_hint(9).with_hint_valid(true);
        let cw = ControlWord::for_type(CoprocessorType::new(4), 0);
        let fault = record(syndrome, Some(cw));
        assert_eq!(
            fault.coprocessor_type(HintPolicy::Advisory),
            Ok(CoprocessorType::new(9))
        );
        assert_eq!(
            fault.coprocessor_type(HintPolicy::Ignored),
            Ok(CoprocessorType::new(4))
        );
    }

    #[test]
    fn invalid_hint_bits_are_ignored() {
        // Variants without a hint may leave garbage in the field.
        let syndrome = unavailable().with_hint(31);
        let cw = ControlWord::for_type(CoprocessorType::new(2), 0);
        let fault = record(syndrome, Some(cw));
        assert_eq!(
            fault.coprocessor_type(HintPolicy::Advisory),
            Ok(CoprocessorType::new(2))
        );
    }

    #[test]
    fn no_hint_falls_back_to_attempted_request() {
        let cw = ControlWord::for_type(CoprocessorType::new(6), 0);
        let fault = record(unavailable(), Some(cw));
        assert_eq!(
            fault.coprocessor_type(HintPolicy::Advisory),
            Ok(CoprocessorType::new(6))
        );
        assert_eq!(
            fault.coprocessor_type(HintPolicy::Trusted),
            Err(CoproError::UnknownType)
        );
    }

    #[test]
    fn no_hint_and_no_request_is_unknown() {
        let fault = record(unavailable(), None);
        for policy in [HintPolicy::Advisory, HintPolicy::Trusted, HintPolicy::Ignored] {
            assert_eq!(fault.coprocessor_type(policy), Err(CoproError::UnknownType));
        }
    }
}
