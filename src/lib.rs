//! SD card block driver written in Embedded Rust, speaking the SD SPI protocol.
//!
//! This crate turns a byte oriented SPI bus into an addressable block device:
//! it negotiates card initialization, reads and writes single or multiple
//! 512-byte blocks with CRC protection, recovers from errors in the middle of
//! multiple block writes and decodes the OCR, CID and CSD registers.
//!
//! The driver is synchronous. Every wait is busy polling bounded either by a
//! retry count or by a millisecond budget measured with a [`Clock`].

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

mod fmt;

mod bus;
mod cid;
mod clock;
mod config;
mod consts;
mod crc;
mod csd;
mod disk;
mod ocr;
mod response;

#[cfg(test)]
mod sim;

pub use crate::{
    bus::{BusSpeed, Prescaler, SpiClock},
    cid::{Cid, CidData},
    clock::Clock,
    config::{DefaultSdCardConfig, SdCardConfig},
    consts::BLOCK_SIZE,
    crc::{crc16, Crc7, CRC7},
    csd::{CapacityProvider, Csd, CsdCommon, CsdData, CsdV1, CsdV2},
    disk::SdCardDisk,
    ocr::Ocr,
    response::{DataErrorToken, DataResponse, R1Response, R2Response, R3OcrPayload},
};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    clock::Deadline,
    consts::{commands, tokens},
    response::R7Payload,
};

use core::marker::PhantomData;
use embedded_hal::blocking::spi::Transfer;
use size::Size;
use switch_hal::OutputSwitch;

/// Capacity above which a block addressed card is an SDXC card.
const SDXC_MIN_CAPACITY: u64 = 34_360_000_000;

/// [`SdCard`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// No valid R1 after this command.
    NoResponse(u8),
    /// The card kept the line in a given state past the time budget.
    Timeout(Wait),
    /// R1 differs from the expected one.
    UnexpectedResponse { cmd: u8, r1: R1Response },
    /// The expected data token never showed up.
    TokenTimeout(u8),
    /// The card answered a read with a data error token.
    DataErrorToken(DataErrorToken),
    /// SEND_IF_COND echo does not match the requested voltage and pattern.
    VoltageMismatch,
    /// SEND_STATUS reported a failure after a write.
    StatusError(R2Response),
    /// CRC mismatch on a received block (card, host).
    CrcMismatch { card: u16, host: u16 },
    /// The card rejected a written block because of its CRC.
    DataCrcRejected,
    /// The card failed to program a written block.
    WriteRejected,
    /// Can't perform this operation before the card is initialized.
    NotInitialized,
    /// Buffer length is not the block count times the block size.
    InvalidBuffer,
    /// Block address does not fit the card.
    AddressOutOfRange,
}

/// What a timed out wait was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wait {
    /// Data response token after a written block.
    DataResponse,
    /// Card releasing the busy line.
    Busy,
    /// Line going idle after STOP_TRANSMISSION.
    StopTransfer,
    /// ACMD41 reporting the end of card initialization.
    Ready,
}

/// Error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// Byte level I/O did not complete.
    Transport,
    /// The card answered outside the protocol.
    Protocol,
    /// Data block CRC failed, re-issuing the block may help.
    DataIntegrity,
    /// The card could not program the data.
    WriteProgram,
    /// Rejected before touching the bus.
    Usage,
}

impl<T, S> Error<T, S> {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::SelectError(_) | Error::NoResponse(_) | Error::Timeout(_) => {
                ErrorKind::Transport
            }
            Error::UnexpectedResponse { .. }
            | Error::TokenTimeout(_)
            | Error::DataErrorToken(_)
            | Error::VoltageMismatch
            | Error::StatusError(_) => ErrorKind::Protocol,
            Error::CrcMismatch { .. } | Error::DataCrcRejected => ErrorKind::DataIntegrity,
            Error::WriteRejected => ErrorKind::WriteProgram,
            Error::NotInitialized | Error::InvalidBuffer | Error::AddressOutOfRange => {
                ErrorKind::Usage
            }
        }
    }
}

/// Error type of a [`SdCard`] built on `Spi` and `Cs`.
pub type SdCardError<Spi, Cs> =
    Error<<Spi as Transfer<u8>>::Error, <Cs as OutputSwitch>::Error>;

/// Card operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Not initialized or after an error.
    Inactive,
    /// After GO_IDLE_STATE, until ACMD41 completes.
    Identification,
    /// Initialized and ready for data transfer.
    Transfer,
}

impl Mode {
    fn allows(self, next: Mode) -> bool {
        match (self, next) {
            (_, Mode::Inactive) | (_, Mode::Identification) => true,
            (Mode::Identification, Mode::Transfer) | (Mode::Transfer, Mode::Transfer) => true,
            (Mode::Inactive, Mode::Transfer) => false,
        }
    }
}

/// Card state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Not initialized or after an error.
    Inactive,
    /// Answered GO_IDLE_STATE.
    Idle,
    /// Powered up with the dummy clocks, about to be reset.
    Ready,
    /// Initialized, no transfer in progress.
    Standby,
    /// Host is writing data to the card.
    Sending,
    /// Host is reading data from the card.
    Receiving,
}

impl State {
    fn allows(self, next: State) -> bool {
        match (self, next) {
            (_, State::Inactive) | (_, State::Ready) => true,
            (State::Ready, State::Idle) | (State::Idle, State::Standby) => true,
            (State::Standby, State::Sending) | (State::Standby, State::Receiving) => true,
            (State::Sending, State::Standby) | (State::Receiving, State::Standby) => true,
            (_, State::Idle) | (_, State::Standby) | (_, State::Sending) | (_, State::Receiving) => {
                false
            }
        }
    }
}

/// Physical layer specification version reported by SEND_IF_COND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpecVersion {
    /// Version 1.x, SEND_IF_COND is an illegal command.
    V1,
    /// Version 2.00 or later.
    V2,
}

/// Card capacity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CapacityClass {
    /// Standard capacity, byte addressed.
    Sdsc,
    /// High capacity, block addressed.
    Sdhc,
    /// Extended capacity, block addressed.
    Sdxc,
}

/// Block geometry, known once the CSD has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    /// Block size in bytes.
    pub block_size: usize,
    /// Capacity in bytes.
    pub capacity_bytes: u64,
}

impl Geometry {
    /// Capacity in blocks.
    pub fn block_count(&self) -> u64 {
        self.capacity_bytes / self.block_size as u64
    }
}

/// SD Card SPI driver.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Clk` - Tick source bounding the waits.
/// `Config` - Config implementation of driver config trait.
///
/// The session owns the bus for its whole lifetime. Any transport or protocol
/// error leaves it [`Mode::Inactive`] and [`SdCard::init`] must run again.
pub struct SdCard<Spi, Cs, Clk, Config = DefaultSdCardConfig>
where
    Spi: SpiClock,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdCardConfig,
{
    spi: Spi,
    cs: Cs,
    clock: Clk,
    bus_clock_hz: u32,
    mode: Mode,
    state: State,
    spec_version: SpecVersion,
    capacity_class: CapacityClass,
    last_r1: R1Response,
    last_r2: R2Response,
    geometry: Option<Geometry>,
    raw_ocr: R3OcrPayload,
    raw_cid: CidData,
    raw_csd: CsdData,
    written_blocks: Option<u32>,
    config: PhantomData<Config>,
}

impl<Spi, Cs, Clk, Config> SdCard<Spi, Cs, Clk, Config>
where
    Spi: SpiClock,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdCardConfig,
{
    /// Creates a new [`SdCard<Spi, Cs, Clk, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `clock` - tick source.
    /// `bus_clock_hz` - frequency of the bus feeding the SPI peripheral.
    pub fn new(spi: Spi, cs: Cs, clock: Clk, bus_clock_hz: u32) -> Self {
        SdCard {
            spi,
            cs,
            clock,
            bus_clock_hz,
            mode: Mode::Inactive,
            state: State::Inactive,
            spec_version: SpecVersion::V1,
            capacity_class: CapacityClass::Sdsc,
            last_r1: R1Response::NO_RESPONSE,
            last_r2: R2Response::NORMAL_STATE,
            geometry: None,
            raw_ocr: Default::default(),
            raw_cid: Default::default(),
            raw_csd: Default::default(),
            written_blocks: None,
            config: PhantomData::<Config>,
        }
    }

    /// Releases the bus.
    pub fn free(self) -> (Spi, Cs, Clk) {
        (self.spi, self.cs, self.clock)
    }

    /// Card operating mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Card state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Negotiated physical layer version.
    pub fn spec_version(&self) -> SpecVersion {
        self.spec_version
    }

    /// Capacity class, decides byte or block addressing.
    pub fn capacity_class(&self) -> CapacityClass {
        self.capacity_class
    }

    /// Last R1 received, also after a failed operation.
    pub fn last_r1(&self) -> R1Response {
        self.last_r1
    }

    /// Last status read with SEND_STATUS.
    pub fn last_r2(&self) -> R2Response {
        self.last_r2
    }

    /// Blocks the card reported as written by the last SEND_NUM_WR_BLOCKS.
    pub fn last_written_block_count(&self) -> Option<u32> {
        self.written_blocks
    }

    /// Whether the card is initialized and ready for data transfer.
    pub fn is_initialized(&self) -> bool {
        self.mode == Mode::Transfer
    }

    /// Block geometry, `None` until the CSD is read.
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> Option<usize> {
        self.geometry.map(|geometry| geometry.block_size)
    }

    /// Card capacity in bytes.
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.geometry.map(|geometry| geometry.capacity_bytes)
    }

    /// Card capacity.
    pub fn capacity(&self) -> Option<Size> {
        self.capacity_bytes().map(Size::from_bytes)
    }

    /// Raw OCR as read by READ_OCR.
    pub fn raw_ocr(&self) -> &R3OcrPayload {
        &self.raw_ocr
    }

    /// Raw CID as read by SEND_CID.
    pub fn raw_cid(&self) -> &CidData {
        &self.raw_cid
    }

    /// Raw CSD as read by SEND_CSD.
    pub fn raw_csd(&self) -> &CsdData {
        &self.raw_csd
    }

    /// Decoded OCR snapshot. Only read from version 2 cards.
    pub fn ocr(&self) -> Ocr {
        Ocr::from(self.raw_ocr)
    }

    /// Decoded CID snapshot.
    pub fn cid(&self) -> Cid {
        Cid::from(self.raw_cid)
    }

    /// Decoded CSD snapshot, layout picked by the negotiated spec version.
    pub fn csd(&self) -> Csd {
        match self.spec_version {
            SpecVersion::V1 => Csd::V1(CsdV1::from(self.raw_csd)),
            SpecVersion::V2 => Csd::V2(CsdV2::from(self.raw_csd)),
        }
    }

    /// Forgets the session. The card must be initialized again.
    pub fn reset(&mut self) {
        info!("SD reset invoked");
        self.transition(Mode::Inactive, State::Inactive);
        self.geometry = None;
    }

    /// Moves the session, the only place `mode` and `state` change.
    ///
    /// Illegal moves panic in debug builds only; release builds apply them.
    fn transition(&mut self, mode: Mode, state: State) {
        debug_assert!(
            self.mode.allows(mode) && self.state.allows(state),
            "invalid SD transition"
        );
        trace!(
            "SD {:?}/{:?} -> {:?}/{:?}",
            self.mode,
            self.state,
            mode,
            state
        );

        self.mode = mode;
        self.state = state;
    }

    /// Error handler: the card is left unselected and inactive.
    fn fail(&mut self, err: SdCardError<Spi, Cs>) -> SdCardError<Spi, Cs> {
        error!("SD operation failed: {:?}", err.kind());

        self.transition(Mode::Inactive, State::Inactive);
        if self.unselect().is_err() {
            warn!("SD couldn't release chip select");
        }

        err
    }

    /// Activate chip select.
    fn select(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        self.cs.on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    fn unselect(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        self.cs.off().map_err(Error::SelectError)
    }

    /// CS scope. A failure inside runs the error handler.
    fn cs_scope<R, F>(&mut self, f: F) -> Result<R, SdCardError<Spi, Cs>>
    where
        F: FnOnce(&mut Self) -> Result<R, SdCardError<Spi, Cs>>,
    {
        let result = match self.select() {
            Ok(()) => f(self),
            Err(err) => Err(err),
        };

        match result {
            Ok(value) => match self.unselect() {
                Ok(()) => Ok(value),
                Err(err) => Err(self.fail(err)),
            },
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Applies a bus clock profile.
    fn set_speed(&mut self, speed: BusSpeed) -> Result<(), SdCardError<Spi, Cs>> {
        let prescaler = speed.prescaler(self.bus_clock_hz);
        debug!(
            "SD bus speed {:?}: {:?}, {} Hz",
            speed,
            prescaler,
            prescaler.sck_hz(self.bus_clock_hz)
        );

        self.spi.set_prescaler(prescaler).map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    fn receive(&mut self) -> Result<u8, SdCardError<Spi, Cs>> {
        self.spi
            .transfer(&mut [tokens::AVAILABLE])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a slice from the SD card.
    fn receive_slice(&mut self, data: &mut [u8]) -> Result<(), SdCardError<Spi, Cs>> {
        data.fill(tokens::AVAILABLE);
        self.spi
            .transfer(data)
            .map(|_| ())
            .map_err(Error::Transport)
    }

    /// Send a slice to the SD card.
    fn send_slice(&mut self, data: &[u8]) -> Result<(), SdCardError<Spi, Cs>> {
        let mut scratch = [0u8; 32];

        for chunk in data.chunks(scratch.len()) {
            let words = &mut scratch[..chunk.len()];
            words.copy_from_slice(chunk);
            self.spi.transfer(words).map_err(Error::Transport)?;
        }

        Ok(())
    }

    /// Send `count` dummy bytes, 8 clocks each.
    fn skip_bytes(&mut self, count: usize) -> Result<(), SdCardError<Spi, Cs>> {
        for _ in 0..count {
            self.receive()?;
        }

        Ok(())
    }

    /// Send a token to the SD card.
    fn send_token(&mut self, token: u8) -> Result<(), SdCardError<Spi, Cs>> {
        self.send_slice(&[token])
    }

    /// Wait for token, accepting the first byte with no bit outside of it.
    fn wait_for_token(&mut self, token: u8) -> Result<(), SdCardError<Spi, Cs>> {
        for _ in 0..Config::TOKEN_ATTEMPTS {
            let byte = self.receive()?;

            if let Some(error_token) = DataErrorToken::parse(byte) {
                warn!("SD data error token: {:#x}", error_token.bits());
                return Err(Error::DataErrorToken(error_token));
            }
            if byte & !token == 0 {
                return Ok(());
            }
        }

        Err(Error::TokenTimeout(token))
    }

    /// Poll until the card releases the line.
    fn wait_available_state(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        self.wait_line_idle(Wait::Busy)
    }

    fn wait_line_idle(&mut self, wait: Wait) -> Result<(), SdCardError<Spi, Cs>> {
        let deadline = Deadline::start(&self.clock, Config::TIMEOUT_MS);

        while self.receive()? != tokens::AVAILABLE {
            if deadline.expired(&self.clock) {
                return Err(Error::Timeout(wait));
            }
        }

        Ok(())
    }

    /// Poll R1 and compare it with the expected one.
    fn receive_r1(&mut self, cmd: u8, expected: R1Response) -> Result<(), SdCardError<Spi, Cs>> {
        for _ in 0..Config::READ_R1_ATTEMPTS {
            let r1 = R1Response(self.receive()?);

            if r1.is_valid() {
                self.last_r1 = r1;

                return if r1 == expected {
                    Ok(())
                } else {
                    debug!("SD CMD{} answered {:?}, expected {:?}", cmd, r1, expected);
                    Err(Error::UnexpectedResponse { cmd, r1 })
                };
            }
        }

        Err(Error::NoResponse(cmd))
    }

    /// Send command.
    fn send_command(
        &mut self,
        cmd: u8,
        arg: u32,
        expected: R1Response,
    ) -> Result<(), SdCardError<Spi, Cs>> {
        trace!("SD CMD{} arg {:#x}", cmd, arg);

        let mut frame = [0u8; 6];
        frame[0] = commands::CMD_BASE | (cmd & commands::CMD_INDEX_MASK);
        frame[1..5].copy_from_slice(&arg.to_be_bytes());

        let crc_index = frame.len() - 1;
        frame[crc_index] = (CRC7.compute(&frame[..crc_index]) << 1) | 0x01;

        self.send_slice(&frame)?;
        self.receive_r1(cmd, expected)
    }

    /// Send application command, escaped by APP_CMD.
    fn send_app_command(
        &mut self,
        acmd: u8,
        arg: u32,
        expected: R1Response,
    ) -> Result<(), SdCardError<Spi, Cs>> {
        let app_cmd_response = match self.mode {
            Mode::Transfer => R1Response::READY_STATE,
            Mode::Inactive | Mode::Identification => R1Response::IN_IDLE_STATE,
        };

        self.send_command(commands::CMD55, 0x0000_0000, app_cmd_response)?;
        self.send_command(acmd, arg, expected)
    }

    /// Read data block and check its CRC.
    fn read_data(&mut self, data: &mut [u8]) -> Result<(), SdCardError<Spi, Cs>> {
        self.receive_slice(data)?;

        let mut crc = [0u8; 2];
        self.receive_slice(&mut crc)?;

        let card_crc = u16::from_be_bytes(crc);
        let host_crc = crc16(data);

        if card_crc != host_crc {
            warn!("SD block CRC mismatch, card: {:#x}, host: {:#x}", card_crc, host_crc);
            return Err(Error::CrcMismatch {
                card: card_crc,
                host: host_crc,
            });
        }

        Ok(())
    }

    /// Write data block with its CRC and wait until it is programmed.
    fn write_data(&mut self, data: &[u8]) -> Result<(), SdCardError<Spi, Cs>> {
        let host_crc = crc16(data);

        self.send_slice(data)?;
        self.send_slice(&host_crc.to_be_bytes())?;

        let deadline = Deadline::start(&self.clock, Config::TIMEOUT_MS);
        let response = loop {
            if let Some(response) = DataResponse::parse(self.receive()?) {
                break response;
            }
            if deadline.expired(&self.clock) {
                return Err(Error::Timeout(Wait::DataResponse));
            }
        };

        match response {
            DataResponse::Accepted => self.wait_available_state(),
            DataResponse::CrcError => Err(Error::DataCrcRejected),
            DataResponse::WriteError => Err(Error::WriteRejected),
        }
    }

    /// STOP_TRANSMISSION, then wait for the line to go idle.
    ///
    /// The R1 of CMD12 follows a stuff byte and is not trusted.
    fn stop_transfer(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        match self.send_command(commands::CMD12, 0x0000_0000, R1Response::READY_STATE) {
            Ok(()) | Err(Error::UnexpectedResponse { .. }) | Err(Error::NoResponse(_)) => {}
            Err(err) => return Err(err),
        }

        self.wait_line_idle(Wait::StopTransfer)
    }

    /// SEND_STATUS into `last_r2`.
    fn status(&mut self) -> Result<R2Response, SdCardError<Spi, Cs>> {
        self.send_command(commands::CMD13, 0x0000_0000, R1Response::READY_STATE)?;
        self.last_r2 = R2Response(self.receive()?);

        Ok(self.last_r2)
    }

    /// SEND_STATUS, failing on any reported flag.
    fn check_status(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        let r2 = self.status()?;

        if r2.has_error() {
            warn!("SD status after write: {:?}", r2);
            Err(Error::StatusError(r2))
        } else {
            Ok(())
        }
    }

    /// SEND_NUM_WR_BLOCKS into `written_blocks`.
    fn query_written_blocks(&mut self) -> Result<u32, SdCardError<Spi, Cs>> {
        self.send_app_command(commands::ACMD22, 0x0000_0000, R1Response::READY_STATE)?;
        self.wait_for_token(tokens::DATA_START_BLOCK)?;

        let mut count = [0u8; 4];
        self.read_data(&mut count)?;

        let blocks = u32::from_be_bytes(count);
        self.written_blocks = Some(blocks);

        Ok(blocks)
    }

    /// Put the card in identification mode.
    fn go_idle_state(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        info!("Entering SPI mode");

        self.send_command(commands::CMD0, 0x0000_0000, R1Response::IN_IDLE_STATE)?;
        self.transition(Mode::Identification, State::Idle);

        Ok(())
    }

    /// Verify SD Memory Card interface operating condition.
    fn check_voltage(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        info!("Verifying SD Memory Card interface operating condition");

        match self.send_command(
            commands::CMD8,
            commands::CMD8_VOLTAGE_CHECK,
            R1Response::IN_IDLE_STATE,
        ) {
            Ok(()) => {}
            Err(Error::UnexpectedResponse { .. }) if self.last_r1.illegal_command() => {
                self.spec_version = SpecVersion::V1;
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let mut r7: R7Payload = Default::default();
        self.receive_slice(&mut r7)?;

        if u16::from_be_bytes([r7[2], r7[3]]) != commands::CMD8_VOLTAGE_CHECK as u16 {
            warn!("SD SEND_IF_COND echo: {:#x} {:#x}", r7[2], r7[3]);
            return Err(Error::VoltageMismatch);
        }

        self.spec_version = SpecVersion::V2;

        Ok(())
    }

    /// Poll ACMD41 until the card leaves the idle state.
    fn go_transfer_mode(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        info!("Sending host capacity support information and activates");

        let arg = match self.spec_version {
            SpecVersion::V1 => 0x0000_0000,
            SpecVersion::V2 => commands::ACMD41_HCS,
        };

        match self.send_app_command(commands::ACMD41, arg, R1Response::IN_IDLE_STATE) {
            Ok(()) => {}
            Err(Error::UnexpectedResponse {
                cmd: commands::ACMD41,
                r1: R1Response::READY_STATE,
            }) => {}
            Err(err) => return Err(err),
        }

        let deadline = Deadline::start(&self.clock, Config::TIMEOUT_MS);
        while self.last_r1 != R1Response::READY_STATE {
            if deadline.expired(&self.clock) {
                return Err(Error::Timeout(Wait::Ready));
            }

            match self.send_app_command(commands::ACMD41, 0x0000_0000, R1Response::READY_STATE) {
                Ok(()) => {}
                Err(Error::UnexpectedResponse {
                    cmd: commands::ACMD41,
                    ..
                }) => {}
                Err(err) => return Err(err),
            }
        }

        self.transition(Mode::Transfer, State::Standby);

        Ok(())
    }

    /// Read OCR, a set CCS bit means a block addressed card.
    fn read_ocr(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        self.send_command(commands::CMD58, 0x0000_0000, R1Response::READY_STATE)?;

        let mut ocr: R3OcrPayload = Default::default();
        self.receive_slice(&mut ocr)?;
        self.raw_ocr = ocr;

        if self.ocr().card_capacity_status {
            self.capacity_class = CapacityClass::Sdhc;
        }

        Ok(())
    }

    /// Read CID.
    fn read_cid(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        self.send_command(commands::CMD10, 0x0000_0000, R1Response::READY_STATE)?;
        self.wait_for_token(tokens::DATA_START_BLOCK)?;

        let mut cid: CidData = Default::default();
        self.read_data(&mut cid)?;
        self.raw_cid = cid;

        Ok(())
    }

    /// Read CSD and derive the block geometry.
    fn read_csd(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        self.send_command(commands::CMD9, 0x0000_0000, R1Response::READY_STATE)?;
        self.wait_for_token(tokens::DATA_START_BLOCK)?;

        let mut csd: CsdData = Default::default();
        self.read_data(&mut csd)?;
        self.raw_csd = csd;

        let capacity_bytes = match self.csd() {
            Csd::V2(csd) => {
                let capacity = csd.card_capacity_bytes();
                if capacity > SDXC_MIN_CAPACITY {
                    self.capacity_class = CapacityClass::Sdxc;
                }
                capacity
            }
            Csd::V1(csd) => {
                self.send_command(
                    commands::CMD16,
                    BLOCK_SIZE as u32,
                    R1Response::READY_STATE,
                )?;
                csd.card_capacity_bytes()
            }
        };

        self.geometry = Some(Geometry {
            block_size: BLOCK_SIZE,
            capacity_bytes,
        });

        Ok(())
    }

    /// Slow clock and dummy bytes with the card unselected.
    fn power_up(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        self.set_speed(BusSpeed::Initialization)?;
        self.unselect()?;
        self.skip_bytes(Config::INIT_DUMMY_BYTES)?;

        self.capacity_class = CapacityClass::Sdsc;
        self.transition(Mode::Identification, State::Ready);

        Ok(())
    }

    fn init_sequence(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        self.power_up()?;
        self.select()?;
        self.go_idle_state()?;
        self.check_voltage()?;
        self.go_transfer_mode()?;

        if self.spec_version == SpecVersion::V2 {
            self.read_ocr()?;
        }

        self.set_speed(BusSpeed::Transfer)?;
        self.read_cid()?;
        self.read_csd()?;
        self.unselect()?;

        Ok(())
    }

    /// Initialize SD.
    ///
    /// Runs the whole power up negotiation. On failure the session is left
    /// inactive and the last R1 is kept for inspection.
    pub fn init(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        info!("SD initialize started");

        self.geometry = None;
        self.written_blocks = None;
        self.raw_ocr = Default::default();
        self.raw_cid = Default::default();
        self.raw_csd = Default::default();

        match self.init_sequence() {
            Ok(()) => {
                let cid = self.cid();
                info!(
                    "SD successfully initialized, version: {:?}, class: {:?}, capacity: {} bytes, manufacturer: {:#x}, serial: {:#x}",
                    self.spec_version,
                    self.capacity_class,
                    self.capacity_bytes().unwrap_or_default(),
                    cid.manufacturer_id,
                    cid.serial_number
                );
                Ok(())
            }
            Err(err) => {
                error!("Failed to initialize SD");
                Err(self.fail(err))
            }
        }
    }

    /// Validates a transfer request and translates the block address to the
    /// command argument.
    fn prepare_transfer(
        &self,
        address: u32,
        buf_len: usize,
        count: usize,
    ) -> Result<u32, SdCardError<Spi, Cs>> {
        let geometry = match (self.mode, self.geometry) {
            (Mode::Transfer, Some(geometry)) => geometry,
            _ => return Err(Error::NotInitialized),
        };

        if count == 0 || Some(buf_len) != count.checked_mul(geometry.block_size) {
            error!(
                "SD invalid buffer, length: {}, blocks: {}, block size: {}",
                buf_len, count, geometry.block_size
            );
            return Err(Error::InvalidBuffer);
        }

        if u64::from(address) + count as u64 > geometry.block_count() {
            return Err(Error::AddressOutOfRange);
        }

        match self.capacity_class {
            CapacityClass::Sdsc => address
                .checked_mul(geometry.block_size as u32)
                .ok_or(Error::AddressOutOfRange),
            CapacityClass::Sdhc | CapacityClass::Sdxc => Ok(address),
        }
    }

    /// Read one block.
    pub fn read_block(
        &mut self,
        address: u32,
        buf: &mut [u8],
    ) -> Result<(), SdCardError<Spi, Cs>> {
        let arg = self.prepare_transfer(address, buf.len(), 1)?;

        self.cs_scope(|s| {
            s.transition(Mode::Transfer, State::Receiving);
            s.send_command(commands::CMD17, arg, R1Response::READY_STATE)?;
            s.wait_for_token(tokens::DATA_START_BLOCK)?;
            s.read_data(buf)?;
            s.transition(Mode::Transfer, State::Standby);

            Ok(())
        })
    }

    /// Read `count` consecutive blocks into `buf`.
    pub fn read_multiple_blocks(
        &mut self,
        address: u32,
        buf: &mut [u8],
        count: usize,
    ) -> Result<(), SdCardError<Spi, Cs>> {
        let arg = self.prepare_transfer(address, buf.len(), count)?;
        let block_size = buf.len() / count;

        self.cs_scope(|s| {
            s.transition(Mode::Transfer, State::Receiving);
            s.send_command(commands::CMD18, arg, R1Response::READY_STATE)?;

            for chunk in buf.chunks_mut(block_size) {
                s.wait_for_token(tokens::DATA_START_BLOCK)?;
                s.read_data(chunk)?;
            }

            s.stop_transfer()?;
            s.transition(Mode::Transfer, State::Standby);

            Ok(())
        })
    }

    /// Write one block.
    pub fn write_block(&mut self, address: u32, buf: &[u8]) -> Result<(), SdCardError<Spi, Cs>> {
        let arg = self.prepare_transfer(address, buf.len(), 1)?;

        self.cs_scope(|s| {
            s.transition(Mode::Transfer, State::Sending);
            s.send_command(commands::CMD24, arg, R1Response::READY_STATE)?;
            s.send_token(tokens::DATA_START_BLOCK)?;

            if let Err(err) = s.write_data(buf) {
                if s.status().is_err() {
                    warn!("SD status unavailable after failed write");
                }
                return Err(err);
            }

            s.wait_available_state()?;
            s.check_status()?;
            s.transition(Mode::Transfer, State::Standby);

            Ok(())
        })
    }

    /// Write `count` consecutive blocks from `buf`.
    ///
    /// When the card rejects a block, the transfer is stopped and the count
    /// of blocks the card did program is queried before the error is
    /// returned; see [`SdCard::last_written_block_count`].
    pub fn write_multiple_blocks(
        &mut self,
        address: u32,
        buf: &[u8],
        count: usize,
    ) -> Result<(), SdCardError<Spi, Cs>> {
        let arg = self.prepare_transfer(address, buf.len(), count)?;
        let block_size = buf.len() / count;

        self.written_blocks = None;

        self.cs_scope(|s| {
            s.transition(Mode::Transfer, State::Sending);
            s.send_command(commands::CMD25, arg, R1Response::READY_STATE)?;
            s.skip_bytes(1)?;

            for block in buf.chunks(block_size) {
                s.send_token(tokens::WRITE_MULTIPLE)?;

                match s.write_data(block) {
                    Ok(()) => {}
                    Err(err @ (Error::DataCrcRejected | Error::WriteRejected)) => {
                        s.recover_multiple_write();
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                }
            }

            s.send_token(tokens::STOP_TRAN)?;
            s.skip_bytes(1)?;
            s.wait_available_state()?;
            s.transition(Mode::Transfer, State::Standby);
            s.check_status()
        })
    }

    /// Stops a rejected multiple block write and records how much of it landed.
    fn recover_multiple_write(&mut self) {
        if self.stop_transfer().is_err() {
            warn!("SD stop transfer failed during write recovery");
        }

        match self.query_written_blocks() {
            Ok(blocks) => warn!("SD write interrupted after {} blocks", blocks),
            Err(err) => warn!("SD written blocks unavailable: {:?}", err.kind()),
        }
    }

    /// Read card status into [`SdCard::last_r2`].
    pub fn read_status(&mut self) -> Result<R2Response, SdCardError<Spi, Cs>> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        self.cs_scope(|s| s.status())
    }

    /// Query the number of blocks written by the last multiple block write.
    pub fn written_block_count(&mut self) -> Result<u32, SdCardError<Spi, Cs>> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        self.cs_scope(|s| s.query_written_blocks())
    }

    /// Wait until the card is not busy.
    pub fn sync(&mut self) -> Result<(), SdCardError<Spi, Cs>> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        self.cs_scope(|s| s.wait_available_state())
    }
}
