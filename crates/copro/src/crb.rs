//! Coprocessor request blocks and the control word that describes them.

use core::fmt;

use bitfield_struct::bitfield;
use static_assertions::{const_assert_eq, const_assert};

use crate::error::{CoproError, Result};
use crate::{CoprocessorType, VirtualAddress};

/// Size of a request block in bytes.
pub const CRB_SIZE: usize = 128;

/// Required alignment of a request block.
pub const CRB_ALIGN: u64 = 128;

/// The 4-byte control word passed alongside a request block.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ControlWord {
    /// Type-specific directive.
    #[bits(16)]
    pub directive: u16,
    /// Index of the coprocessor type the request is for.
    #[bits(6)]
    pub type_index: u8,
    #[bits(10)]
    _rsvd: u16,
}

impl ControlWord {
    /// Builds a control word for `ty` carrying `directive`.
    pub fn for_type(ty: CoprocessorType, directive: u16) -> Self {
        Self::new()
            .with_type_index(ty.index())
            .with_directive(directive)
    }

    /// Returns the coprocessor type the request targets.
    pub fn coprocessor_type(self) -> CoprocessorType {
        // Six bits always fit.
        CoprocessorType::new(self.type_index())
    }
}

/// A request block: the control word followed by type-specific payload.
///
/// The coprocessor reads the block after a successful dispatch, so it must stay alive and
/// unmodified until the caller knows the request has completed.
#[repr(C, align(128))]
#[derive(Clone)]
pub struct CoprocessorRequestBlock {
    /// Control word, big-endian as the coprocessor reads it.
    ccw: [u8; 4],
    payload: [u8; CRB_SIZE - 4],
}

const_assert_eq!(core::mem::size_of::<CoprocessorRequestBlock>(), CRB_SIZE);
const_assert_eq!(core::mem::align_of::<CoprocessorRequestBlock>() as u64, CRB_ALIGN);
const_assert!(CRB_ALIGN.is_power_of_two());

impl CoprocessorRequestBlock {
    /// Creates a block with `control_word` and a zeroed payload.
    pub fn new(control_word: ControlWord) -> Self {
        Self {
            ccw: control_word.into_bits().to_be_bytes(),
            payload: [0; CRB_SIZE - 4],
        }
    }

    pub fn control_word(&self) -> ControlWord {
        ControlWord::from_bits(u32::from_be_bytes(self.ccw))
    }

    pub fn set_control_word(&mut self, control_word: ControlWord) {
        self.ccw = control_word.into_bits().to_be_bytes();
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Returns the address the dispatch instruction is given for this block.
    pub fn address(&self) -> CrbAddress {
        CrbAddress(VirtualAddress::from_ptr(self))
    }
}

impl fmt::Debug for CoprocessorRequestBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoprocessorRequestBlock")
            .field("control_word", &self.control_word())
            .finish_non_exhaustive()
    }
}

/// An address known to satisfy the request block alignment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CrbAddress(VirtualAddress);

impl CrbAddress {
    /// Checks the alignment of an address supplied by a caller.
    pub fn new(address: VirtualAddress) -> Result<Self> {
        if address.is_aligned(CRB_ALIGN) {
            Ok(Self(address))
        } else {
            Err(CoproError::Misaligned(address))
        }
    }

    pub fn as_virtual(self) -> VirtualAddress {
        self.0
    }
}

impl fmt::Debug for CrbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CrbAddress({:#x})", self.0.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_word_layout() {
        let cw = ControlWord::from_bits(0x1);
        assert_eq!(cw.directive(), 1);
        assert_eq!(cw.coprocessor_type(), CoprocessorType::new(0));

        let cw = ControlWord::for_type(CoprocessorType::new(0x2a), 0xbeef);
        assert_eq!(cw.into_bits(), 0x002a_beef);
    }

    #[test]
    fn block_stores_control_word_big_endian() {
        let cw = ControlWord::for_type(CoprocessorType::new(3), 0x0102);
        let crb = CoprocessorRequestBlock::new(cw);
        assert_eq!(crb.ccw, [0x00, 0x03, 0x01, 0x02]);
        assert_eq!(crb.control_word(), cw);
        assert_eq!(crb.payload().len(), CRB_SIZE - 4);
    }

    #[test]
    fn block_address_is_aligned() {
        let blocks = vec![
            CoprocessorRequestBlock::new(ControlWord::new()),
            CoprocessorRequestBlock::new(ControlWord::new()),
        ];
        for crb in &blocks {
            assert!(crb.address().as_virtual().is_aligned(CRB_ALIGN));
        }
    }

    #[test]
    fn misaligned_address_is_rejected() {
        let va = VirtualAddress::new(0x1008);
        assert_eq!(CrbAddress::new(va), Err(CoproError::Misaligned(va)));
        assert!(CrbAddress::new(VirtualAddress::new(0x1080)).is_ok());
    }
}
