//! [`SpiTransport`] over an `embedded-hal` SPI bus and three GPIO chip
//! selects.

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::error::{Error, Result};
use crate::hal::{Chip, SpiTransport};

/// Shared SPI bus with one active-low chip select per [`Chip`].
pub struct HalSpi<B, CS> {
    bus: B,
    cs: [CS; 3],
    selected: Option<Chip>,
}

impl<B: SpiBus, CS: OutputPin> HalSpi<B, CS> {
    /// Chip selects are given in [`Chip::ALL`] order and driven high here.
    pub fn new(bus: B, mut cs: [CS; 3]) -> Self {
        for pin in cs.iter_mut() {
            let _ = pin.set_high();
        }
        Self {
            bus,
            cs,
            selected: None,
        }
    }

    pub fn release(self) -> (B, [CS; 3]) {
        (self.bus, self.cs)
    }
}

impl<B: SpiBus, CS: OutputPin> SpiTransport for HalSpi<B, CS> {
    fn select(&mut self, chip: Chip) {
        self.deselect();
        if self.cs[chip.index()].set_low().is_err() {
            warn!("chip select {:?} did not assert", chip);
        }
        self.selected = Some(chip);
    }

    fn deselect(&mut self) {
        if let Some(chip) = self.selected.take() {
            // Clock out anything still in the shifter before CS rises.
            if self.bus.flush().is_err() {
                warn!("spi flush failed");
            }
            let _ = self.cs[chip.index()].set_high();
        }
    }

    fn transfer_byte(&mut self, out: u8) -> Result<u8> {
        let mut word = [out];
        self.bus.transfer_in_place(&mut word).map_err(|_| Error::Spi)?;
        Ok(word[0])
    }
}
