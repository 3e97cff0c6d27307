/// Flash protocol dispatcher.
///
/// Runs from the main loop, never from the USB interrupt. Each request that
/// arrives on the flash endpoint is decoded, served against the selected chip
/// and answered on the same endpoint pair. Erase and page program are only
/// started here: the host polls `erase(status)` until the chip reports
/// completion, so no USB transaction ever waits on flash latency.
///
/// One operation may be outstanding at a time. A `write` issued before the
/// previous erase or write was polled complete is rejected by stalling the
/// OUT endpoint without touching the SPI bus.
use embedded_hal::digital::OutputPin;

use crate::chip::{self, ChipSource, FlashChip};
use crate::config::{self, FLASH_ENDPOINT, MAX_PAGE_SIZE};
use crate::hal::{Chip, Direction, SpiTransport, UsbPeripheral};
use crate::protocol::{
    DeviceBus, DeviceFlags, DeviceInfo, EraseOperation, EraseStatus, PageAddr, Request, Response,
    VerifyStatus, MAX_FRAME_LEN,
};
use crate::spi_flash::SpiFlash;
use crate::usb::{UsbCore, UsbPacket};

/// Chip that erase/read/write/verify address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TargetSelection {
    #[default]
    None,
    Local1,
    Local2,
    External,
}

impl TargetSelection {
    /// Map a `(deviceNumber, deviceType)` pair to a slot. Unknown pairs
    /// select nothing.
    pub fn from_slot(number: u8, device_type: u8) -> Self {
        match (DeviceBus::from_byte(device_type), number) {
            (Some(DeviceBus::Internal), 0) => TargetSelection::Local1,
            (Some(DeviceBus::Internal), 1) => TargetSelection::Local2,
            (Some(DeviceBus::External), 0) => TargetSelection::External,
            _ => TargetSelection::None,
        }
    }

    pub fn chip(self) -> Option<Chip> {
        match self {
            TargetSelection::None => None,
            TargetSelection::Local1 => Some(Chip::Local1),
            TargetSelection::Local2 => Some(Chip::Local2),
            TargetSelection::External => Some(Chip::External),
        }
    }
}

/// The operation the host has started and not yet polled to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Job {
    Idle,
    /// Erase block `current` is running; blocks `next..=end` follow.
    Erase { current: u32, next: u32, end: u32 },
    Write { page: u32 },
}

impl Job {
    fn page(self) -> Option<u32> {
        match self {
            Job::Idle => None,
            Job::Erase { current, .. } => Some(current),
            Job::Write { page } => Some(page),
        }
    }
}

fn erase_reply(complete: EraseStatus, page: u32) -> Response {
    Response::Erase {
        complete,
        current: PageAddr::new(page),
    }
}

/// Program page size actually used on the wire.
fn page_len(chip: &FlashChip) -> usize {
    (chip.page_size as usize).clamp(1, MAX_PAGE_SIZE)
}

fn device_info(chip: &FlashChip) -> DeviceInfo {
    let flags = match chip.source {
        ChipSource::Table => DeviceFlags::empty(),
        ChipSource::Sfdp => DeviceFlags::FROM_SFDP,
        ChipSource::Synthesized => DeviceFlags::BEST_GUESS,
    };
    DeviceInfo {
        size: chip.capacity,
        manufacturer: chip.manufacturer,
        device_type: chip.device_type,
        page_size: PageAddr::new(page_len(chip) as u32),
        erase_size: PageAddr::new(chip.erase_size.min(PageAddr::MAX)),
        flags,
    }
}

pub struct Dispatcher<S, R> {
    flash: SpiFlash<S>,
    reset: R,
    target: TargetSelection,
    chip: Option<FlashChip>,
    job: Job,
    /// Page number and length of the last programmed page, kept for verify.
    written: Option<(u32, usize)>,
    page: [u8; MAX_PAGE_SIZE],
}

impl<S: SpiTransport, R: OutputPin> Dispatcher<S, R> {
    pub fn new(flash: SpiFlash<S>, reset: R) -> Self {
        Self {
            flash,
            reset,
            target: TargetSelection::None,
            chip: None,
            job: Job::Idle,
            written: None,
            page: [0u8; MAX_PAGE_SIZE],
        }
    }

    pub fn target(&self) -> TargetSelection {
        self.target
    }

    /// Geometry of the selected chip.
    pub fn chip(&self) -> Option<&FlashChip> {
        self.chip.as_ref()
    }

    pub fn flash(&self) -> &SpiFlash<S> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut SpiFlash<S> {
        &mut self.flash
    }

    fn selected(&self) -> Option<(Chip, FlashChip)> {
        Some((self.target.chip()?, self.chip?))
    }

    // =========================================================================
    // Main loop entry
    // =========================================================================

    /// Drain the work recorded by the USB interrupt and serve any request
    /// waiting on the flash endpoint.
    pub fn poll<U: UsbPeripheral>(&mut self, usb: &mut UsbCore<U>) {
        if !usb.is_configured() {
            return;
        }
        while let Some(packet) = usb.take_work() {
            match packet {
                UsbPacket {
                    endpoint: FLASH_ENDPOINT,
                    direction: Direction::Out,
                } => self.service(usb),
                other => trace!("no work for {:?}", other),
            }
        }
        // Packets whose interrupt was coalesced with an earlier one.
        if usb.rx_pending(FLASH_ENDPOINT) {
            self.service(usb);
        }
    }

    fn service<U: UsbPeripheral>(&mut self, usb: &mut UsbCore<U>) {
        if !usb.rx_pending(FLASH_ENDPOINT) {
            return;
        }
        let mut frame = [0u8; config::USB_MAX_PACKET_SIZE as usize];
        let n = match usb.read_endpoint(FLASH_ENDPOINT, &mut frame) {
            Ok(n) => n,
            Err(e) => {
                warn!("request read failed: {:?}", e);
                return;
            }
        };
        let request = match Request::decode(&frame[..n]) {
            Ok(request) => request,
            Err(e) => {
                warn!("undecodable request: {:?}", e);
                usb.stall_endpoint(FLASH_ENDPOINT, Direction::In);
                return;
            }
        };
        debug!("{:?}", request);

        match request {
            Request::Read { page } => self.cmd_read(usb, page.get()),
            Request::Write { page, count } => self.cmd_write(usb, page.get(), count.get() as usize),
            other => {
                if let Some(response) = self.handle(other) {
                    let mut buf = [0u8; MAX_FRAME_LEN];
                    let len = response.encode(&mut buf);
                    if let Err(e) = usb.write_endpoint(FLASH_ENDPOINT, &buf[..len]) {
                        warn!("response for 0x{:02x} lost: {:?}", response.opcode(), e);
                    }
                }
            }
        }
    }

    /// Serve a request answered by a single response frame. `read` and
    /// `write` move bulk data and return `None`.
    pub fn handle(&mut self, request: Request) -> Option<Response> {
        Some(match request {
            Request::DeviceCount => Response::DeviceCount {
                internal: config::INTERNAL_DEVICE_COUNT,
                external: config::EXTERNAL_DEVICE_COUNT,
            },
            Request::ListDevice {
                number,
                device_type,
            } => self.cmd_list_device(number, device_type),
            Request::TargetDevice {
                number,
                device_type,
            } => self.cmd_target_device(number, device_type),
            Request::Erase {
                operation,
                begin,
                end,
            } => self.cmd_erase(operation, begin.get(), end.get()),
            Request::Verify => self.cmd_verify(),
            Request::ResetTarget => self.cmd_reset_target(),
            Request::Read { .. } | Request::Write { .. } => return None,
        })
    }

    // =========================================================================
    // listDevice / targetDevice
    // =========================================================================

    fn cmd_list_device(&mut self, number: u8, device_type: u8) -> Response {
        match TargetSelection::from_slot(number, device_type).chip() {
            Some(slot) => Response::ListDevice(device_info(&chip::identify(&mut self.flash, slot))),
            None => {
                debug!("listDevice: no slot {} on bus {}", number, device_type);
                Response::ListDevice(DeviceInfo::invalid())
            }
        }
    }

    fn cmd_target_device(&mut self, number: u8, device_type: u8) -> Response {
        self.target = TargetSelection::from_slot(number, device_type);
        self.job = Job::Idle;
        self.written = None;
        self.chip = self.target.chip().map(|c| chip::identify(&mut self.flash, c));
        info!("target {:?}", self.target);
        Response::TargetDevice
    }

    // =========================================================================
    // erase
    // =========================================================================

    fn cmd_erase(&mut self, operation: EraseOperation, begin: u32, end: u32) -> Response {
        let Some((target, geometry)) = self.selected() else {
            return erase_reply(EraseStatus::Invalid, begin);
        };

        let (first, last) = match operation {
            EraseOperation::Status => return self.erase_status(target, geometry),
            EraseOperation::All => (0, 0),
            EraseOperation::Page => (begin, begin),
            EraseOperation::PageRange => (begin, end),
        };

        if let Some(active) = self.job.page() {
            debug!("erase {:?} while page {} outstanding", operation, active);
            return erase_reply(EraseStatus::InProgress, active);
        }
        if first > last || last >= geometry.erase_blocks() {
            warn!("erase {:?} {}..={} out of range", operation, first, last);
            return erase_reply(EraseStatus::Invalid, begin);
        }

        let started = if operation == EraseOperation::All {
            self.flash.start_chip_erase(target)
        } else {
            self.start_block(target, &geometry, first)
        };
        match started {
            Ok(()) => {
                // A chip erase is a single step; `next > end` marks it last.
                let end = if operation == EraseOperation::All { 0 } else { last };
                self.job = Job::Erase {
                    current: first,
                    next: first + 1,
                    end,
                };
                erase_reply(EraseStatus::InProgress, first)
            }
            Err(e) => {
                warn!("erase start failed: {:?}", e);
                erase_reply(EraseStatus::Invalid, first)
            }
        }
    }

    fn start_block(&mut self, target: Chip, geometry: &FlashChip, block: u32) -> crate::Result<()> {
        let address = block.saturating_mul(geometry.erase_size);
        trace!("erasing block {} at 0x{:06x}", block, address);
        self.flash
            .start_block_erase(target, geometry.erase_opcode, address)
    }

    /// Poll the running operation, starting the next block of a range erase
    /// once the previous one is done.
    fn erase_status(&mut self, target: Chip, geometry: FlashChip) -> Response {
        let current = self.job.page().unwrap_or(0);
        match self.flash.is_busy(target) {
            Err(e) => {
                warn!("status read failed: {:?}", e);
                erase_reply(EraseStatus::Invalid, current)
            }
            Ok(true) => erase_reply(EraseStatus::InProgress, current),
            Ok(false) => match self.job {
                Job::Erase { next, end, .. } if next <= end => {
                    if let Err(e) = self.start_block(target, &geometry, next) {
                        warn!("erase of block {} failed: {:?}", next, e);
                        self.job = Job::Idle;
                        return erase_reply(EraseStatus::Invalid, next);
                    }
                    self.job = Job::Erase {
                        current: next,
                        next: next + 1,
                        end,
                    };
                    erase_reply(EraseStatus::InProgress, next)
                }
                _ => {
                    self.job = Job::Idle;
                    erase_reply(EraseStatus::Complete, current)
                }
            },
        }
    }

    // =========================================================================
    // read / write / verify
    // =========================================================================

    fn cmd_read<U: UsbPeripheral>(&mut self, usb: &mut UsbCore<U>, page: u32) {
        let Some((target, geometry)) = self.selected() else {
            warn!("read without target");
            usb.stall_endpoint(FLASH_ENDPOINT, Direction::In);
            return;
        };
        let len = page_len(&geometry);
        if page >= geometry.capacity / len as u32 {
            warn!("read of page {} beyond end of chip", page);
            usb.stall_endpoint(FLASH_ENDPOINT, Direction::In);
            return;
        }

        let mut buf = [0u8; MAX_PAGE_SIZE];
        let result = self
            .flash
            .wait_idle(target)
            .and_then(|()| self.flash.read(target, page * len as u32, &mut buf[..len]));
        if let Err(e) = result {
            warn!("read of page {} failed: {:?}", page, e);
            usb.stall_endpoint(FLASH_ENDPOINT, Direction::In);
            return;
        }
        if let Err(e) = usb.write_endpoint(FLASH_ENDPOINT, &buf[..len]) {
            warn!("page {} not delivered: {:?}", page, e);
        }
    }

    fn cmd_write<U: UsbPeripheral>(&mut self, usb: &mut UsbCore<U>, page: u32, count: usize) {
        let Some((target, geometry)) = self.selected() else {
            warn!("write without target");
            usb.stall_endpoint(FLASH_ENDPOINT, Direction::Out);
            return;
        };
        if let Some(active) = self.job.page() {
            warn!("write to page {} rejected, page {} still outstanding", page, active);
            usb.stall_endpoint(FLASH_ENDPOINT, Direction::Out);
            return;
        }
        let len = page_len(&geometry);
        if count == 0 || count > len || page >= geometry.capacity / len as u32 {
            warn!("write of {} bytes to page {} rejected", count, page);
            usb.stall_endpoint(FLASH_ENDPOINT, Direction::Out);
            return;
        }

        if let Err(e) = usb.read_exact(FLASH_ENDPOINT, &mut self.page[..count]) {
            warn!("write data for page {} incomplete: {:?}", page, e);
            usb.stall_endpoint(FLASH_ENDPOINT, Direction::Out);
            return;
        }

        let address = page * len as u32;
        match self
            .flash
            .start_page_program(target, address, &self.page[..count])
        {
            Ok(()) => {
                self.job = Job::Write { page };
                self.written = Some((page, count));
            }
            Err(e) => {
                warn!("program of page {} failed: {:?}", page, e);
                self.written = None;
            }
        }
    }

    fn cmd_verify(&mut self) -> Response {
        let (Some((target, geometry)), Some((page, count))) = (self.selected(), self.written) else {
            return Response::Verify {
                status: VerifyStatus::Invalid,
            };
        };

        let mut buf = [0u8; MAX_PAGE_SIZE];
        let address = page * page_len(&geometry) as u32;
        let result = self
            .flash
            .wait_idle(target)
            .and_then(|()| self.flash.read(target, address, &mut buf[..count]));
        let status = match result {
            Ok(()) if buf[..count] == self.page[..count] => VerifyStatus::Match,
            Ok(()) => {
                info!("page {} does not match", page);
                VerifyStatus::Mismatch
            }
            Err(e) => {
                warn!("verify of page {} failed: {:?}", page, e);
                VerifyStatus::Invalid
            }
        };
        Response::Verify { status }
    }

    // =========================================================================
    // resetTarget
    // =========================================================================

    /// Pulse the target reset line low.
    fn cmd_reset_target(&mut self) -> Response {
        if self.reset.set_low().is_err() {
            warn!("reset line did not assert");
        }
        for _ in 0..self.flash.timeouts().reset_pulse_spins {
            core::hint::spin_loop();
        }
        if self.reset.set_high().is_err() {
            warn!("reset line did not release");
        }
        info!("target reset");
        Response::ResetTarget
    }
}
