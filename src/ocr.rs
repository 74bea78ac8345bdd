use crate::response::R3OcrPayload;

use bitfield::bitfield;

bitfield! {
    /// Raw view over the 32 OCR bits, most significant byte first.
    struct OcrBits(u32);
    u16, voltage_window, _: 23, 15;
    low_voltage_range, _: 7;
    switching_to_18v_accepted, _: 24;
    uhs2_card_status, _: 29;
    card_capacity_status, _: 30;
    power_up_complete, _: 31;
}

/// Operation Conditions Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ocr {
    /// Card finished its power up routine (inverted busy bit).
    pub power_up_complete: bool,
    /// Card Capacity Status: set for SDHC and SDXC cards.
    pub card_capacity_status: bool,
    /// UHS-II interface is supported.
    pub uhs2_card_status: bool,
    /// Switching to 1.8V accepted (S18A).
    pub switching_to_18v_accepted: bool,
    /// Supported VDD window, bit 0 is 2.7-2.8V and bit 8 is 3.5-3.6V.
    pub voltage_window: u16,
    /// Reserved for the low voltage range.
    pub low_voltage_range: bool,
}

impl Ocr {
    /// Whether the card operates at `millivolts` (2700..=3599).
    pub fn supports_voltage(&self, millivolts: u16) -> bool {
        match millivolts {
            2700..=3599 => self.voltage_window & (1 << ((millivolts - 2700) / 100)) != 0,
            _ => false,
        }
    }
}

impl From<R3OcrPayload> for Ocr {
    fn from(raw: R3OcrPayload) -> Self {
        let bits = OcrBits(u32::from_be_bytes(raw));

        Ocr {
            power_up_complete: bits.power_up_complete(),
            card_capacity_status: bits.card_capacity_status(),
            uhs2_card_status: bits.uhs2_card_status(),
            switching_to_18v_accepted: bits.switching_to_18v_accepted(),
            voltage_window: bits.voltage_window(),
            low_voltage_range: bits.low_voltage_range(),
        }
    }
}
