use embedded_hal::blocking::spi::Transfer;

/// SPI clock divider applied to the peripheral bus clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Prescaler {
    Div2,
    Div4,
    Div8,
    Div16,
    Div32,
    Div64,
    Div128,
    Div256,
}

impl Prescaler {
    /// Division factor.
    pub fn divider(self) -> u32 {
        match self {
            Prescaler::Div2 => 2,
            Prescaler::Div4 => 4,
            Prescaler::Div8 => 8,
            Prescaler::Div16 => 16,
            Prescaler::Div32 => 32,
            Prescaler::Div64 => 64,
            Prescaler::Div128 => 128,
            Prescaler::Div256 => 256,
        }
    }

    /// Resulting SCK frequency for a given bus clock.
    pub fn sck_hz(self, bus_clock_hz: u32) -> u32 {
        bus_clock_hz / self.divider()
    }
}

/// Named SPI clock profiles used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusSpeed {
    /// Card identification, SCK kept under 400 kHz.
    Initialization,
    /// Data transfer, SCK kept under 50 MHz.
    Transfer,
}

impl BusSpeed {
    /// Picks the divider step for the bus clock.
    pub fn prescaler(self, bus_clock_hz: u32) -> Prescaler {
        match self {
            BusSpeed::Initialization => match bus_clock_hz {
                50_000_000..=u32::MAX => Prescaler::Div256,
                24_000_000..=49_999_999 => Prescaler::Div128,
                12_000_000..=23_999_999 => Prescaler::Div64,
                6_000_000..=11_999_999 => Prescaler::Div32,
                _ => Prescaler::Div16,
            },
            BusSpeed::Transfer => match bus_clock_hz {
                50_000_000..=u32::MAX => Prescaler::Div4,
                _ => Prescaler::Div2,
            },
        }
    }
}

/// SPI bus that can change its clock divider.
///
/// The SD protocol needs a slow clock while the card is identified and a
/// fast one afterwards; HAL SPI drivers usually fix the frequency at
/// construction, so this is the one capability the driver asks for on top
/// of [`Transfer`].
pub trait SpiClock: Transfer<u8> {
    /// Applies the divider. Called with the card unselected or between
    /// commands, never mid-transfer.
    fn set_prescaler(&mut self, prescaler: Prescaler) -> Result<(), Self::Error>;
}
