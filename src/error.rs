use thiserror::Error;

/// Errors raised inside the programmer.
///
/// None of these cross the USB boundary: the dispatcher turns them into a
/// status code or an endpoint stall for the command being served.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The SPI peripheral reported a failure.
    #[error("spi transfer failed")]
    Spi,
    /// The SPI peripheral never became ready within the spin budget.
    #[error("spi transfer timed out")]
    SpiTimeout,
    /// The flash kept its write-in-progress bit set past the poll budget.
    #[error("flash stayed busy")]
    FlashBusy,
    /// A bulk endpoint FIFO did not drain or fill in time.
    #[error("usb fifo timed out on endpoint {0}")]
    UsbTimeout(u8),
    /// The endpoint is halted and must be cleared by the host first.
    #[error("endpoint {0} is stalled")]
    Stalled(u8),
    /// Bulk traffic was attempted before SET_CONFIGURATION.
    #[error("device is not configured")]
    NotConfigured,
}

/// Why an SFDP image was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SfdpError {
    #[error("missing SFDP signature")]
    BadSignature,
    #[error("unsupported SFDP major revision {0}")]
    UnsupportedRevision(u8),
    #[error("no JEDEC basic flash parameter table")]
    NoBasicTable,
    #[error("invalid parameter in basic flash parameter table")]
    InvalidParams,
    #[error("spi read of SFDP data failed")]
    Read(Error),
}

impl From<Error> for SfdpError {
    fn from(e: Error) -> Self {
        SfdpError::Read(e)
    }
}

/// Why a protocol frame could not be decoded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("frame for opcode 0x{opcode:02x} is {len} bytes, expected {expected}")]
    Truncated { opcode: u8, len: usize, expected: usize },
    #[error("invalid value 0x{value:02x} for opcode 0x{opcode:02x}")]
    InvalidField { opcode: u8, value: u8 },
}

pub type Result<T> = core::result::Result<T, Error>;
