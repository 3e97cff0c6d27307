//! Test doubles: a scripted USB controller, a simulated SPI flash bus and a
//! recording reset pin.

use std::collections::VecDeque;
use std::convert::Infallible;

use crate::config::NUM_ENDPOINTS;
use crate::control::{SetupPacket, SET_ADDRESS, SET_CONFIGURATION};
use crate::error::{Error, Result};
use crate::hal::{BusEvents, Chip, Direction, Ep0Events, InterruptStatus, SpiTransport, UsbPeripheral};
use crate::sfdp::SfdpReader;
use crate::usb::UsbCore;

// =============================================================================
// USB controller
// =============================================================================

/// FIFO-model USB controller driven by the test. Interrupt sources are set
/// in `pending` and consumed by the next `interrupt_status` call.
#[derive(Debug, Default)]
pub struct MockUsb {
    pub pending: InterruptStatus,
    pub ep0_pending: Ep0Events,
    pub enabled: BusEvents,
    pub connected: bool,
    pub address: u8,
    pub configured: Vec<(u8, Direction, u16, bool)>,
    /// Packets waiting in each OUT FIFO.
    pub rx: [VecDeque<Vec<u8>>; NUM_ENDPOINTS],
    rx_cursor: [usize; NUM_ENDPOINTS],
    /// Committed IN packets per endpoint.
    pub tx: [Vec<Vec<u8>>; NUM_ENDPOINTS],
    pub tx_staged: [Vec<u8>; NUM_ENDPOINTS],
    /// `last` flag of every EP0 IN packet.
    pub ep0_last: Vec<bool>,
    pub stalled: [[bool; 2]; NUM_ENDPOINTS],
    /// Width in bytes of every FIFO access, in order.
    pub fifo_widths: Vec<u8>,
}

impl MockUsb {
    pub fn queue_rx(&mut self, ep: u8, data: &[u8]) {
        self.rx[ep as usize].push_back(data.to_vec());
    }

    fn pull(&mut self, ep: u8, n: usize) -> Vec<u8> {
        self.fifo_widths.push(n as u8);
        let ep = ep as usize;
        let cursor = self.rx_cursor[ep];
        let packet = self.rx[ep].front().cloned().unwrap_or_default();
        self.rx_cursor[ep] += n;
        (cursor..cursor + n).map(|i| packet.get(i).copied().unwrap_or(0)).collect()
    }

    fn push(&mut self, ep: u8, bytes: &[u8]) {
        self.fifo_widths.push(bytes.len() as u8);
        self.tx_staged[ep as usize].extend_from_slice(bytes);
    }
}

impl UsbPeripheral for MockUsb {
    fn interrupt_status(&mut self) -> InterruptStatus {
        std::mem::take(&mut self.pending)
    }

    fn ep0_events(&mut self) -> Ep0Events {
        std::mem::take(&mut self.ep0_pending)
    }

    fn enable_bus_events(&mut self, events: BusEvents) {
        self.enabled = events;
    }

    fn connect(&mut self) {
        self.connected = true;
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    fn configure_endpoint(&mut self, ep: u8, dir: Direction, max_packet: u16, double_buffered: bool) {
        self.configured.push((ep, dir, max_packet, double_buffered));
    }

    fn rx_ready(&mut self, ep: u8) -> bool {
        !self.rx[ep as usize].is_empty()
    }

    fn rx_count(&mut self, ep: u8) -> u16 {
        let ep = ep as usize;
        let len = self.rx[ep].front().map_or(0, |p| p.len());
        len.saturating_sub(self.rx_cursor[ep]) as u16
    }

    fn read_fifo_u32(&mut self, ep: u8) -> u32 {
        let b = self.pull(ep, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn read_fifo_u16(&mut self, ep: u8) -> u16 {
        let b = self.pull(ep, 2);
        u16::from_le_bytes([b[0], b[1]])
    }

    fn read_fifo_u8(&mut self, ep: u8) -> u8 {
        self.pull(ep, 1)[0]
    }

    fn rx_done(&mut self, ep: u8, _data_end: bool) {
        self.rx[ep as usize].pop_front();
        self.rx_cursor[ep as usize] = 0;
    }

    fn tx_busy(&mut self, _ep: u8) -> bool {
        false
    }

    fn write_fifo_u32(&mut self, ep: u8, word: u32) {
        self.push(ep, &word.to_le_bytes());
    }

    fn write_fifo_u16(&mut self, ep: u8, half: u16) {
        self.push(ep, &half.to_le_bytes());
    }

    fn write_fifo_u8(&mut self, ep: u8, byte: u8) {
        self.push(ep, &[byte]);
    }

    fn tx_ready(&mut self, ep: u8, last: bool) {
        let packet = std::mem::take(&mut self.tx_staged[ep as usize]);
        self.tx[ep as usize].push(packet);
        if ep == 0 {
            self.ep0_last.push(last);
        }
    }

    fn stall(&mut self, ep: u8, dir: Direction) {
        self.stalled[ep as usize][dir.index()] = true;
    }

    fn clear_stall(&mut self, ep: u8, dir: Direction) {
        self.stalled[ep as usize][dir.index()] = false;
        if dir == Direction::Out {
            self.rx[ep as usize].clear();
            self.rx_cursor[ep as usize] = 0;
        }
    }
}

pub fn fire(core: &mut UsbCore<MockUsb>, bus: BusEvents, rx: u16, tx: u16) {
    core.peripheral_mut().pending = InterruptStatus { bus, rx, tx };
    core.on_interrupt();
}

/// Attach, power up and take a bus reset.
pub fn reset(core: &mut UsbCore<MockUsb>) {
    core.attach();
    fire(core, BusEvents::empty(), 0, 0);
    fire(core, BusEvents::RESET, 0, 0);
}

/// Deliver a SETUP packet on EP0.
pub fn control_request(core: &mut UsbCore<MockUsb>, setup: SetupPacket) {
    core.peripheral_mut().queue_rx(0, &setup.to_bytes());
    fire(core, BusEvents::empty(), 1, 0);
}

/// Signal that the last EP0 packet or status stage has completed.
pub fn control_ack(core: &mut UsbCore<MockUsb>) {
    fire(core, BusEvents::empty(), 0, 1);
}

/// Bring a core from power-on to configured, with address 5.
pub fn enumerate(core: &mut UsbCore<MockUsb>) {
    reset(core);
    let mut setup = SetupPacket {
        request_type: 0x00,
        request: SET_ADDRESS,
        value: 5,
        index: 0,
        length: 0,
    };
    control_request(core, setup);
    control_ack(core);
    setup.request = SET_CONFIGURATION;
    setup.value = 1;
    control_request(core, setup);
    control_ack(core);
}

// =============================================================================
// SPI flash
// =============================================================================

/// One simulated SPI NOR chip.
#[derive(Debug, Clone)]
pub struct SimFlash {
    pub id: [u8; 3],
    pub memory: Vec<u8>,
    pub sfdp: Vec<u8>,
    /// Status reads left that report write-in-progress.
    pub busy: u32,
    /// Status reads an erase or program keeps the chip busy for.
    pub busy_time: u32,
    pub stuck_busy: bool,
    pub wel: bool,
}

impl SimFlash {
    pub fn new(id: [u8; 3], size: usize) -> Self {
        SimFlash {
            id,
            memory: vec![0xFF; size],
            sfdp: Vec::new(),
            busy: 0,
            busy_time: 2,
            stuck_busy: false,
            wel: false,
        }
    }

    pub fn with_sfdp(mut self, image: Vec<u8>) -> Self {
        self.sfdp = image;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.stuck_busy || self.busy > 0
    }

    fn address(tx: &[u8]) -> usize {
        (tx[1] as usize) << 16 | (tx[2] as usize) << 8 | tx[3] as usize
    }

    /// Byte driven on MISO for the last byte of `tx`.
    fn respond(&mut self, tx: &[u8]) -> u8 {
        let idx = tx.len() - 1;
        if idx == 0 {
            return 0xFF;
        }
        match tx[0] {
            0x9F => self.id.get(idx - 1).copied().unwrap_or(0xFF),
            0x05 => {
                let status = self.is_busy() as u8 | (self.wel as u8) << 1;
                if idx == 1 && self.busy > 0 {
                    self.busy -= 1;
                }
                status
            }
            0x03 if idx >= 4 => {
                let a = Self::address(tx) + idx - 4;
                self.memory.get(a).copied().unwrap_or(0xFF)
            }
            0x5A if idx >= 5 => {
                let a = Self::address(tx) + idx - 5;
                self.sfdp.get(a).copied().unwrap_or(0xFF)
            }
            _ => 0xFF,
        }
    }

    /// Apply the effect of a completed transaction.
    fn finish(&mut self, tx: &[u8]) {
        let Some(&opcode) = tx.first() else {
            return;
        };
        if self.is_busy() && opcode != 0x05 {
            return;
        }
        match opcode {
            0x06 => self.wel = true,
            0x04 => self.wel = false,
            0x02 if self.wel && tx.len() >= 4 => {
                let address = Self::address(tx);
                let page = address & !0xFF;
                for (i, b) in tx[4..].iter().enumerate() {
                    let a = page | ((address + i) & 0xFF);
                    if let Some(cell) = self.memory.get_mut(a) {
                        *cell &= b;
                    }
                }
                self.start_op();
            }
            0x20 | 0x52 | 0xD8 if self.wel && tx.len() >= 4 => {
                let size = match opcode {
                    0x20 => 4096,
                    0x52 => 32 * 1024,
                    _ => 64 * 1024,
                };
                let base = Self::address(tx) & !(size - 1);
                let end = (base + size).min(self.memory.len());
                if base < end {
                    self.memory[base..end].fill(0xFF);
                }
                self.start_op();
            }
            0xC7 | 0x60 if self.wel => {
                self.memory.fill(0xFF);
                self.start_op();
            }
            _ => {}
        }
    }

    fn start_op(&mut self) {
        self.wel = false;
        self.busy = self.busy_time;
    }
}

/// Shared SPI bus with up to three simulated chips. Unpopulated selects read
/// back 0xFF.
#[derive(Debug, Default)]
pub struct SimSpi {
    chips: [Option<SimFlash>; 3],
    selected: Option<Chip>,
    current: Vec<u8>,
    /// Bytes sent in each chip-select framed transaction.
    pub log: Vec<Vec<u8>>,
    pub transfers: usize,
}

impl SimSpi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chip(mut self, chip: Chip, flash: SimFlash) -> Self {
        self.chips[chip.index()] = Some(flash);
        self
    }

    pub fn chip(&self, chip: Chip) -> &SimFlash {
        self.chips[chip.index()].as_ref().expect("no chip on that select")
    }

    pub fn chip_mut(&mut self, chip: Chip) -> &mut SimFlash {
        self.chips[chip.index()].as_mut().expect("no chip on that select")
    }
}

impl SpiTransport for SimSpi {
    fn select(&mut self, chip: Chip) {
        self.selected = Some(chip);
        self.current.clear();
    }

    fn deselect(&mut self) {
        if let Some(chip) = self.selected.take() {
            let tx = std::mem::take(&mut self.current);
            if let Some(flash) = self.chips[chip.index()].as_mut() {
                flash.finish(&tx);
            }
            self.log.push(tx);
        }
    }

    fn transfer_byte(&mut self, out: u8) -> Result<u8> {
        self.transfers += 1;
        let Some(chip) = self.selected else {
            return Ok(0xFF);
        };
        self.current.push(out);
        Ok(match self.chips[chip.index()].as_mut() {
            Some(flash) => flash.respond(&self.current),
            None => 0xFF,
        })
    }
}

/// SPI master whose every transfer times out.
#[derive(Debug, Default)]
pub struct FailingSpi {
    pub selected: bool,
}

impl SpiTransport for FailingSpi {
    fn select(&mut self, _chip: Chip) {
        self.selected = true;
    }

    fn deselect(&mut self) {
        self.selected = false;
    }

    fn transfer_byte(&mut self, _out: u8) -> Result<u8> {
        Err(Error::SpiTimeout)
    }
}

// =============================================================================
// SFDP
// =============================================================================

/// In-memory SFDP space. Reads past the end return 0xFF.
#[derive(Debug, Default)]
pub struct SfdpImage {
    data: Vec<u8>,
    pub reads: usize,
}

impl SfdpImage {
    pub fn new(data: &[u8]) -> Self {
        SfdpImage {
            data: data.to_vec(),
            reads: 0,
        }
    }

    /// A chip without SFDP support.
    pub fn blank() -> Self {
        Self::default()
    }
}

impl SfdpReader for SfdpImage {
    fn read_sfdp(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.reads += 1;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.data.get(address as usize + i).copied().unwrap_or(0xFF);
        }
        Ok(())
    }
}

/// SFDP v1.6 image with one parameter header pointing at a basic table of
/// `dwords` DWORDs at 0x30. Erase types: 4 KiB/0x20, 32 KiB/0x52,
/// 64 KiB/0xD8. Page size 256.
pub fn sfdp_image(density: u32, declared_opcode: u8, dwords: usize) -> Vec<u8> {
    assert!(dwords <= 16);
    let mut image = vec![0xFF; 0x30 + dwords * 4];
    image[..8].copy_from_slice(&[b'S', b'F', b'D', b'P', 0x06, 0x01, 0x00, 0xFF]);
    image[8..16].copy_from_slice(&[0x00, 0x06, 0x01, dwords as u8, 0x30, 0x00, 0x00, 0xFF]);

    let mut table = [0xFFFF_FFFFu32; 16];
    table[0] = 0xFFFF_00E1 | u32::from(declared_opcode) << 8;
    table[1] = density;
    table[7] = u32::from_le_bytes([12, 0x20, 15, 0x52]);
    table[8] = u32::from_le_bytes([16, 0xD8, 0, 0]);
    table[10] = 0x0000_0080;
    for (i, dword) in table.iter().take(dwords).enumerate() {
        image[0x30 + i * 4..0x34 + i * 4].copy_from_slice(&dword.to_le_bytes());
    }
    image
}

// =============================================================================
// Reset line
// =============================================================================

/// Output pin that records every level it is driven to.
#[derive(Debug, Default)]
pub struct MockPin {
    pub levels: Vec<bool>,
}

impl embedded_hal::digital::ErrorType for MockPin {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for MockPin {
    fn set_low(&mut self) -> core::result::Result<(), Self::Error> {
        self.levels.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> core::result::Result<(), Self::Error> {
        self.levels.push(true);
        Ok(())
    }
}
