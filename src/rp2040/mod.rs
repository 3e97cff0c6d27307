//! RP2040 board support.
//!
//! Pin map:
//!
//! | Signal           | GPIO |
//! |------------------|------|
//! | SPI0 SCK         | 18   |
//! | SPI0 MOSI        | 19   |
//! | SPI0 MISO        | 16   |
//! | CS local 1       | 17   |
//! | CS local 2       | 20   |
//! | CS external      | 21   |
//! | Target reset (n) | 22   |

mod usb;

pub use usb::Rp2040Usb;

use embassy_rp::gpio::{Level, Output};
use embassy_rp::peripherals::{SPI0, USB};
use embassy_rp::spi::{self, Blocking, Spi};
use embassy_rp::Peripherals;

use crate::bus::HalSpi;
use crate::config::Timeouts;
use crate::descriptors::Descriptors;
use crate::dispatcher::Dispatcher;
use crate::spi_flash::SpiFlash;
use crate::usb::UsbCore;

/// SPI clock for all three flash slots.
pub const SPI_FREQ_HZ: u32 = 30_000_000;

pub type FlashBus = HalSpi<Spi<'static, SPI0, Blocking>, Output<'static>>;
pub type BoardUsb = UsbCore<Rp2040Usb>;
pub type BoardDispatcher = Dispatcher<FlashBus, Output<'static>>;

/// Claim the board peripherals and build the USB core and dispatcher.
///
/// The USB core is returned detached; call [`UsbCore::attach`] once its
/// interrupt can be serviced.
pub fn init(p: Peripherals, timeouts: Timeouts) -> (BoardUsb, BoardDispatcher) {
    let mut config = spi::Config::default();
    config.frequency = SPI_FREQ_HZ;
    config.phase = spi::Phase::CaptureOnFirstTransition;
    config.polarity = spi::Polarity::IdleLow;
    let bus = Spi::new_blocking(p.SPI0, p.PIN_18, p.PIN_19, p.PIN_16, config);

    let cs = [
        Output::new(p.PIN_17, Level::High),
        Output::new(p.PIN_20, Level::High),
        Output::new(p.PIN_21, Level::High),
    ];
    let reset = Output::new(p.PIN_22, Level::High);

    let flash = SpiFlash::new(HalSpi::new(bus, cs), timeouts);
    let usb = UsbCore::new(controller(p.USB), Descriptors::default(), timeouts);
    (usb, Dispatcher::new(flash, reset))
}

/// The singleton is taken so nothing else can drive USBCTRL.
fn controller(_usb: USB) -> Rp2040Usb {
    Rp2040Usb::new()
}
