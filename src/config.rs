/// Represents config for [`SdCard`](crate::SdCard).
pub trait SdCardConfig {
    /// Max polls to read R1 after a command frame.
    const READ_R1_ATTEMPTS: usize;
    /// Max polls to observe a data token.
    const TOKEN_ATTEMPTS: usize;
    /// Budget in milliseconds for busy, data-response, stop-transfer and
    /// ACMD41 readiness waits.
    const TIMEOUT_MS: u32;
    /// Count of dummy bytes sent with the card unselected on power-up.
    const INIT_DUMMY_BYTES: usize;
}

/// Default implementation of [`SdCardConfig`](crate::SdCardConfig).
pub struct DefaultSdCardConfig;

impl SdCardConfig for DefaultSdCardConfig {
    const READ_R1_ATTEMPTS: usize = 10;
    const TOKEN_ATTEMPTS: usize = 100;
    const TIMEOUT_MS: u32 = 1000;
    const INIT_DUMMY_BYTES: usize = 9;
}
