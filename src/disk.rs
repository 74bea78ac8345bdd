use crate::{
    Clock, DefaultSdCardConfig, DiskioDevice, DiskioError, Error, IoctlCmd, Lba, SdCard,
    SdCardConfig, SdCardError, SpiClock, Status, StatusFlag,
};

use core::cell::RefCell;
use switch_hal::OutputSwitch;

/// Error type alias.
type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// [`DiskioDevice`] on top of a [`SdCard`].
///
/// The device trait reads and writes through a shared reference, so the
/// session sits behind a [`RefCell`].
pub struct SdCardDisk<Spi, Cs, Clk, Config = DefaultSdCardConfig>
where
    Spi: SpiClock,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdCardConfig,
{
    card: RefCell<SdCard<Spi, Cs, Clk, Config>>,
    status: Status,
}

impl<Spi, Cs, Clk, Config> SdCardDisk<Spi, Cs, Clk, Config>
where
    Spi: SpiClock,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdCardConfig,
{
    /// Creates a new [`SdCardDisk`] over an uninitialized card.
    pub fn new(card: SdCard<Spi, Cs, Clk, Config>) -> Self {
        SdCardDisk {
            card: RefCell::new(card),
            status: StatusFlag::NotInitialized.into(),
        }
    }

    /// Returns the wrapped card.
    pub fn into_inner(self) -> SdCard<Spi, Cs, Clk, Config> {
        self.card.into_inner()
    }

    /// Validate initialized and get the block size.
    fn validate_initialized(&self) -> Result<usize, DiskioError<ErrorFor<Self>>> {
        if self.status.contains(StatusFlag::NotInitialized) {
            return Err(DiskioError::NotInitialized);
        }

        self.card
            .borrow()
            .block_size()
            .ok_or(DiskioError::NotInitialized)
    }

    /// Validate buffer for read/write, returns the block count.
    fn validate_buffer_len(
        buf_len: usize,
        block_size: usize,
    ) -> Result<usize, DiskioError<ErrorFor<Self>>> {
        if buf_len == 0 || buf_len % block_size != 0 {
            error!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, block_size
            );
            Err(DiskioError::InvalidArgument)
        } else {
            Ok(buf_len / block_size)
        }
    }

    /// Convert lba.
    fn convert_lba(lba: Lba) -> Result<u32, DiskioError<ErrorFor<Self>>> {
        u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)
    }

    fn map_error(err: SdCardError<Spi, Cs>) -> DiskioError<ErrorFor<Self>> {
        match err {
            Error::NotInitialized => DiskioError::NotInitialized,
            Error::InvalidBuffer | Error::AddressOutOfRange => DiskioError::InvalidArgument,
            err => DiskioError::Hardware(err),
        }
    }
}

impl<Spi, Cs, Clk, Config> DiskioDevice for SdCardDisk<Spi, Cs, Clk, Config>
where
    Spi: SpiClock,
    Cs: OutputSwitch,
    Clk: Clock,
    Config: SdCardConfig,
{
    type HardwareError = SdCardError<Spi, Cs>;

    fn status(&self) -> Status {
        if self.status.contains(StatusFlag::NotInitialized) || self.card.borrow().is_initialized()
        {
            self.status
        } else {
            StatusFlag::ErrorOccured | StatusFlag::NotInitialized
        }
    }

    fn reset(&mut self) {
        self.card.get_mut().reset();
        self.status = StatusFlag::NotInitialized.into();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.contains(StatusFlag::NotInitialized) && self.card.get_mut().is_initialized()
        {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        let result = self.card.get_mut().init();

        self.status = match &result {
            Ok(()) => Status::default(),
            Err(_) => StatusFlag::ErrorOccured | StatusFlag::NotInitialized,
        };

        result.map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let block_size = self.validate_initialized()?;
        let block_count = Self::validate_buffer_len(buf.len(), block_size)?;
        let address = Self::convert_lba(lba)?;

        let mut card = self.card.borrow_mut();
        let result = if block_count == 1 {
            card.read_block(address, buf)
        } else {
            card.read_multiple_blocks(address, buf, block_count)
        };

        result.map_err(Self::map_error)
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        let block_size = self.validate_initialized()?;
        let block_count = Self::validate_buffer_len(buf.len(), block_size)?;
        let address = Self::convert_lba(lba)?;

        let mut card = self.card.borrow_mut();
        let result = if block_count == 1 {
            card.write_block(address, buf)
        } else {
            card.write_multiple_blocks(address, buf, block_count)
        };

        result.map_err(Self::map_error)
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => {
                self.validate_initialized()?;
                self.card.borrow_mut().sync().map_err(Self::map_error)
            }
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = self.validate_initialized()?;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
