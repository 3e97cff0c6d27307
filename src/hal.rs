//! Hardware seams.
//!
//! The core never touches registers. A board provides a [`SpiTransport`] for
//! the flash bus, a [`UsbPeripheral`] for the device controller and an
//! [`embedded_hal::digital::OutputPin`] for the target reset line.

use bitflags::bitflags;

use crate::error::Result;

/// Physical chip-select lines on the programmer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Chip {
    Local1,
    Local2,
    External,
}

impl Chip {
    pub const ALL: [Chip; 3] = [Chip::Local1, Chip::Local2, Chip::External];

    pub fn index(self) -> usize {
        match self {
            Chip::Local1 => 0,
            Chip::Local2 => 1,
            Chip::External => 2,
        }
    }
}

/// Byte-at-a-time SPI master with chip-select control.
///
/// Implementations bound every internal wait and report
/// [`Error::SpiTimeout`](crate::Error::SpiTimeout) instead of hanging.
pub trait SpiTransport {
    /// Assert the chip select of `chip`, deasserting any other.
    fn select(&mut self, chip: Chip);
    /// Release all chip selects.
    fn deselect(&mut self);
    /// Shift one byte out and return the byte shifted in.
    fn transfer_byte(&mut self, out: u8) -> Result<u8>;
}

/// Transfer direction from the host's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }
}

bitflags! {
    /// Bus-level interrupt sources.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BusEvents: u8 {
        const DISCONNECT = 1 << 0;
        const RESET      = 1 << 1;
        const RESUME     = 1 << 2;
        const SUSPEND    = 1 << 3;
        const SOF        = 1 << 4;
    }
}

bitflags! {
    /// Control endpoint conditions latched by the controller.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Ep0Events: u8 {
        /// A STALL handshake went out on EP0.
        const SENT_STALL = 1 << 0;
        /// The host ended the control transfer early with a new SETUP.
        const SETUP_END  = 1 << 1;
    }
}

impl Default for BusEvents {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for Ep0Events {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BusEvents {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BusEvents({=u8:#x})", self.bits())
    }
}

/// One latched snapshot of the controller's interrupt registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterruptStatus {
    pub bus: BusEvents,
    /// Bit `n` set: endpoint `n` has received data (EP0: any control event).
    pub rx: u16,
    /// Bit `n` set: endpoint `n` finished transmitting (EP0: any control event).
    pub tx: u16,
}

impl InterruptStatus {
    pub fn endpoint_pending(&self, ep: u8) -> bool {
        (self.rx | self.tx) & (1 << ep) != 0
    }
}

/// FIFO-style USB device controller.
///
/// Data moves through per-endpoint FIFOs accessed in 32, 16 or 8-bit units.
/// A received packet stays in the FIFO until [`rx_done`](Self::rx_done) hands
/// the buffer back; a transmitted packet is committed by
/// [`tx_ready`](Self::tx_ready).
pub trait UsbPeripheral {
    /// Read and acknowledge all pending interrupt sources.
    fn interrupt_status(&mut self) -> InterruptStatus;
    /// Read and acknowledge the control endpoint conditions.
    fn ep0_events(&mut self) -> Ep0Events;
    /// Choose which bus events raise an interrupt.
    fn enable_bus_events(&mut self, events: BusEvents);

    /// Enable the D+ pull-up.
    fn connect(&mut self);
    /// Soft-disconnect from the bus.
    fn disconnect(&mut self);
    fn set_address(&mut self, address: u8);

    /// Configure and arm an endpoint.
    fn configure_endpoint(&mut self, ep: u8, dir: Direction, max_packet: u16, double_buffered: bool);

    /// A received packet is waiting in the OUT FIFO of `ep`.
    fn rx_ready(&mut self, ep: u8) -> bool;
    /// Bytes left to drain from the current OUT packet.
    fn rx_count(&mut self, ep: u8) -> u16;
    fn read_fifo_u32(&mut self, ep: u8) -> u32;
    fn read_fifo_u16(&mut self, ep: u8) -> u16;
    fn read_fifo_u8(&mut self, ep: u8) -> u8;
    /// Release the drained OUT packet and ACK it. On EP0 `data_end` marks the
    /// last packet of the setup/data stage.
    fn rx_done(&mut self, ep: u8, data_end: bool);

    /// The IN FIFO of `ep` still holds a packet the host has not collected.
    fn tx_busy(&mut self, ep: u8) -> bool;
    fn write_fifo_u32(&mut self, ep: u8, word: u32);
    fn write_fifo_u16(&mut self, ep: u8, half: u16);
    fn write_fifo_u8(&mut self, ep: u8, byte: u8);
    /// Commit the bytes written since the last commit as one IN packet. On
    /// EP0 `last` marks the end of the data stage.
    fn tx_ready(&mut self, ep: u8, last: bool);

    fn stall(&mut self, ep: u8, dir: Direction);
    /// Clear a halt and reset the data toggle, flushing the FIFO.
    fn clear_stall(&mut self, ep: u8, dir: Direction);
}
