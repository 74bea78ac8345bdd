use crate::consts::tokens;

use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub always_zero, _: 7;
}

impl R1Response {
    /// Card is initialized and no error flag is set.
    pub const READY_STATE: R1Response = R1Response(0x00);
    /// Card is in the identification (idle) state.
    pub const IN_IDLE_STATE: R1Response = R1Response(0x01);
    /// Nothing was clocked out by the card yet.
    pub const NO_RESPONSE: R1Response = R1Response(0xFF);

    /// A real R1 always has the most significant bit cleared.
    pub fn is_valid(&self) -> bool {
        !self.always_zero()
    }

    /// Raw response byte.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for R1Response {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "R1({=u8:#x})", self.0)
    }
}

bitfield! {
    /// Second byte of the R2 response to SEND_STATUS.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R2Response(u8);
    impl Debug;
    pub card_locked, _: 0;
    pub wp_erase_skip, _: 1;
    pub error, _: 2;
    pub card_controller_error, _: 3;
    pub ecc_failed, _: 4;
    pub wp_violation, _: 5;
    pub erase_param, _: 6;
    pub out_of_range, _: 7;
}

impl R2Response {
    /// No status flag is set.
    pub const NORMAL_STATE: R2Response = R2Response(0x00);

    /// Whether any flag reports a failure of the previous operation.
    pub fn has_error(&self) -> bool {
        self.0 != Self::NORMAL_STATE.0
    }

    /// Raw response byte.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for R2Response {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "R2({=u8:#x})", self.0)
    }
}

bitfield! {
    /// Data error token sent by the card instead of a read start token.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DataErrorToken(u8);
    impl Debug;
    pub error, _: 0;
    pub card_controller_error, _: 1;
    pub ecc_failed, _: 2;
    pub out_of_range, _: 3;
}

impl DataErrorToken {
    /// Recognizes an error token: high nibble clear and at least one flag set.
    pub fn parse(byte: u8) -> Option<DataErrorToken> {
        if byte != 0 && byte & !tokens::DATA_ERROR_MASK == 0 {
            Some(DataErrorToken(byte))
        } else {
            None
        }
    }

    /// Raw token byte.
    pub fn bits(&self) -> u8 {
        self.0
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for DataErrorToken {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "DataErrorToken({=u8:#x})", self.0)
    }
}

/// Card answer to a written data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataResponse {
    /// Data accepted, programming started.
    Accepted,
    /// Data rejected due to a CRC error.
    CrcError,
    /// Data rejected due to a write error.
    WriteError,
}

impl DataResponse {
    /// Decodes a data response byte, masked to its low five bits.
    pub fn parse(byte: u8) -> Option<DataResponse> {
        match byte & tokens::DATA_RES_MASK {
            tokens::DATA_RES_ACCEPTED => Some(DataResponse::Accepted),
            tokens::DATA_RES_CRC_ERROR => Some(DataResponse::CrcError),
            tokens::DATA_RES_WRITE_ERROR => Some(DataResponse::WriteError),
            _ => None,
        }
    }
}

/// R3 OCR payload.
pub type R3OcrPayload = [u8; 4];

/// R7 payload of SEND_IF_COND.
pub type R7Payload = [u8; 4];
