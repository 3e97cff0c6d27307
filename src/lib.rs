//! Device side of a USB-attached SPI flash programmer.
//!
//! Three pieces cooperate:
//!
//! - [`usb::UsbCore`] owns the USB device controller. Its interrupt handler
//!   runs enumeration on EP0 and only records which bulk endpoints have work.
//! - [`dispatcher::Dispatcher`] runs in the main loop, decodes the host's
//!   [`protocol`] requests and drives the flash through [`spi_flash`].
//! - [`chip`] turns a JEDEC ID into erase and page geometry, falling back to
//!   [`sfdp`] tables and then to conservative defaults.
//!
//! Hardware sits behind the traits in [`hal`]. The `rp2040` feature provides
//! the board implementation used by the firmware binary.
#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod bus;
pub mod chip;
pub mod config;
pub mod control;
pub mod descriptors;
pub mod dispatcher;
pub mod error;
pub mod hal;
pub mod protocol;
pub mod sfdp;
pub mod spi_flash;
pub mod usb;

#[cfg(feature = "rp2040")]
pub mod rp2040;

#[cfg(test)]
mod testing;

pub use chip::{ChipSource, FlashChip};
pub use config::Timeouts;
pub use dispatcher::{Dispatcher, TargetSelection};
pub use error::{DecodeError, Error, Result, SfdpError};
pub use hal::{Chip, SpiTransport, UsbPeripheral};
pub use spi_flash::SpiFlash;
pub use usb::{DeviceState, UsbCore};
