//! USB transport core.
//!
//! [`UsbCore::on_interrupt`] is the only entry point from interrupt context.
//! It tracks the device lifecycle, services control transfers on EP0 and
//! records bulk endpoint activity as [`UsbPacket`] work items. The flash
//! dispatcher drains those items from the main loop and moves data with
//! [`UsbCore::read_endpoint`] and [`UsbCore::write_endpoint`].

use crate::config::{self, Timeouts, NUM_ENDPOINTS};
use crate::control::{ControlStage, SetupPacket};
use crate::descriptors::{Descriptor, Descriptors};
use crate::error::{Error, Result};
use crate::hal::{BusEvents, Direction, Ep0Events, UsbPeripheral};

/// Device lifecycle. Ordered: later states compare greater.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    Detached,
    Attached,
    Powered,
    /// Reset seen, waiting for SET_ADDRESS.
    Waiting,
    Addressed,
    Configured,
}

/// Bytes queued for an IN transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    None,
    Static(&'static [u8]),
    /// Short replies such as GET_STATUS.
    Inline { data: [u8; 2], len: u8 },
    /// Several descriptors sent back to back.
    Chain(&'static [&'static [u8]]),
}

impl Source {
    pub fn len(&self) -> usize {
        match self {
            Source::None => 0,
            Source::Static(s) => s.len(),
            Source::Inline { len, .. } => *len as usize,
            Source::Chain(parts) => parts.iter().map(|p| p.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes starting at `offset` into `out`, returning how many were
    /// copied.
    pub fn copy_from(&self, offset: usize, out: &mut [u8]) -> usize {
        match self {
            Source::None => 0,
            Source::Static(s) => copy_slice(s, offset, out),
            Source::Inline { data, len } => copy_slice(&data[..*len as usize], offset, out),
            Source::Chain(parts) => {
                let mut skip = offset;
                let mut copied = 0;
                for part in parts.iter() {
                    if skip >= part.len() {
                        skip -= part.len();
                        continue;
                    }
                    copied += copy_slice(part, skip, &mut out[copied..]);
                    skip = 0;
                    if copied == out.len() {
                        break;
                    }
                }
                copied
            }
        }
    }
}

fn copy_slice(src: &[u8], offset: usize, out: &mut [u8]) -> usize {
    let src = src.get(offset..).unwrap_or(&[]);
    let n = src.len().min(out.len());
    out[..n].copy_from_slice(&src[..n]);
    n
}

impl From<Descriptor> for Source {
    fn from(d: Descriptor) -> Self {
        match d {
            Descriptor::Single(s) => Source::Static(s),
            Descriptor::Chain(parts) => Source::Chain(parts),
        }
    }
}

/// Transfer bookkeeping for one endpoint direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointStatus {
    pub index: u8,
    pub direction: Direction,
    pub source: Source,
    /// Bytes moved so far.
    pub count: u16,
    /// Bytes the transfer will move.
    pub total: u16,
    /// Configure the endpoint once the current control transfer completes.
    pub needs_arming: bool,
    pub stalled: bool,
}

impl EndpointStatus {
    pub const fn new(index: u8, direction: Direction) -> Self {
        EndpointStatus {
            index,
            direction,
            source: Source::None,
            count: 0,
            total: 0,
            needs_arming: false,
            stalled: false,
        }
    }

    fn finish(&mut self) {
        self.source = Source::None;
        self.count = 0;
        self.total = 0;
    }
}

/// Endpoint and direction with pending activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UsbPacket {
    pub endpoint: u8,
    pub direction: Direction,
}

const QUEUE_LEN: usize = 2 * NUM_ENDPOINTS;

/// Bounded FIFO of work items. A packet already waiting is not queued twice,
/// so the queue can never hold more than one entry per endpoint direction.
#[derive(Debug)]
pub struct WorkQueue {
    slots: [Option<UsbPacket>; QUEUE_LEN],
    head: usize,
    len: usize,
}

impl WorkQueue {
    pub const fn new() -> Self {
        WorkQueue {
            slots: [None; QUEUE_LEN],
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, packet: UsbPacket) -> bool {
        if self.iter().any(|p| p == packet) || self.len == QUEUE_LEN {
            return false;
        }
        self.slots[(self.head + self.len) % QUEUE_LEN] = Some(packet);
        self.len += 1;
        true
    }

    pub fn pop(&mut self) -> Option<UsbPacket> {
        if self.len == 0 {
            return None;
        }
        let packet = self.slots[self.head].take();
        self.head = (self.head + 1) % QUEUE_LEN;
        self.len -= 1;
        packet
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        *self = WorkQueue::new();
    }

    fn iter(&self) -> impl Iterator<Item = UsbPacket> + '_ {
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % QUEUE_LEN])
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn initial_endpoints() -> [[EndpointStatus; 2]; NUM_ENDPOINTS] {
    core::array::from_fn(|i| {
        [
            EndpointStatus::new(i as u8, Direction::Out),
            EndpointStatus::new(i as u8, Direction::In),
        ]
    })
}

pub struct UsbCore<U> {
    pub(crate) usb: U,
    pub(crate) state: DeviceState,
    pub(crate) suspended: bool,
    pub(crate) events: BusEvents,
    pub(crate) endpoints: [[EndpointStatus; 2]; NUM_ENDPOINTS],
    pub(crate) packet: Option<UsbPacket>,
    pub(crate) queue: WorkQueue,
    pub(crate) control: ControlStage,
    pub(crate) setup: Option<SetupPacket>,
    pub(crate) pending_address: Option<u8>,
    pub(crate) configuration: u8,
    pub(crate) descriptors: Descriptors,
    timeouts: Timeouts,
}

impl<U: UsbPeripheral> UsbCore<U> {
    pub fn new(usb: U, descriptors: Descriptors, timeouts: Timeouts) -> Self {
        Self {
            usb,
            state: DeviceState::Detached,
            suspended: false,
            events: BusEvents::empty(),
            endpoints: initial_endpoints(),
            packet: None,
            queue: WorkQueue::new(),
            control: ControlStage::Idle,
            setup: None,
            pending_address: None,
            configuration: 0,
            descriptors,
            timeouts,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_configured(&self) -> bool {
        self.state == DeviceState::Configured
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn endpoint(&self, ep: u8, dir: Direction) -> Option<&EndpointStatus> {
        self.endpoints.get(ep as usize).map(|e| &e[dir.index()])
    }

    /// Endpoint most recently serviced from interrupt context.
    pub fn current_packet(&self) -> Option<UsbPacket> {
        self.packet
    }

    pub fn peripheral(&self) -> &U {
        &self.usb
    }

    pub fn peripheral_mut(&mut self) -> &mut U {
        &mut self.usb
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect to the bus and wait for the host to reset us.
    pub fn attach(&mut self) {
        info!("USB attach");
        self.usb.connect();
        self.set_events(BusEvents::RESET | BusEvents::DISCONNECT);
        self.state = DeviceState::Attached;
    }

    pub fn detach(&mut self) {
        info!("USB detach");
        self.usb.disconnect();
        self.set_events(BusEvents::empty());
        self.reset_transfers();
        self.state = DeviceState::Detached;
    }

    fn set_events(&mut self, events: BusEvents) {
        self.events = events;
        self.usb.enable_bus_events(events);
    }

    fn reset_transfers(&mut self) {
        self.endpoints = initial_endpoints();
        self.queue.clear();
        self.packet = None;
        self.control = ControlStage::Idle;
        self.setup = None;
        self.pending_address = None;
        self.configuration = 0;
        self.suspended = false;
    }

    fn bus_reset(&mut self) {
        debug!("USB bus reset");
        self.reset_transfers();
        self.usb.set_address(0);
        self.usb.configure_endpoint(0, Direction::Out, config::EP0_MAX_PACKET_SIZE, false);
        self.usb.configure_endpoint(0, Direction::In, config::EP0_MAX_PACKET_SIZE, false);
        self.state = DeviceState::Waiting;
    }

    // =========================================================================
    // Interrupt entry
    // =========================================================================

    /// Service one controller interrupt. Must not be re-entered.
    pub fn on_interrupt(&mut self) {
        let status = self.usb.interrupt_status();

        if status.bus.contains(BusEvents::DISCONNECT) {
            self.usb.disconnect();
            self.reset_transfers();
            self.state = DeviceState::Detached;
            info!("USB disconnected");
            return;
        }

        if self.state == DeviceState::Attached {
            self.set_events(self.events | BusEvents::SUSPEND);
            self.state = DeviceState::Powered;
        }

        if status.bus.contains(BusEvents::RESUME) {
            self.suspended = false;
            self.set_events((self.events - BusEvents::RESUME) | BusEvents::SUSPEND);
        } else if self.suspended {
            return;
        }

        if status.bus.contains(BusEvents::RESET) {
            self.bus_reset();
            return;
        }

        if status.bus.contains(BusEvents::SUSPEND) {
            self.suspended = true;
            self.set_events((self.events - BusEvents::SUSPEND) | BusEvents::RESUME);
        }

        if self.state < DeviceState::Waiting || (status.rx | status.tx) == 0 {
            return;
        }

        for ep in 0..NUM_ENDPOINTS as u8 {
            if !status.endpoint_pending(ep) {
                continue;
            }
            if ep == 0 {
                self.packet = Some(UsbPacket {
                    endpoint: 0,
                    direction: Direction::Out,
                });
                self.service_control();
                continue;
            }
            for (bits, direction) in [(status.rx, Direction::Out), (status.tx, Direction::In)] {
                if bits & (1 << ep) == 0 {
                    continue;
                }
                let packet = UsbPacket {
                    endpoint: ep,
                    direction,
                };
                self.packet = Some(packet);
                if !self.queue.push(packet) {
                    trace!("{:?} already queued", packet);
                }
            }
        }
    }

    fn service_control(&mut self) {
        let events = self.usb.ep0_events();
        if events.intersects(Ep0Events::SENT_STALL | Ep0Events::SETUP_END) {
            debug!("EP0 abort: 0x{:02x}", events.bits());
            self.abort_control();
        }

        if self.control == ControlStage::Status {
            self.complete_status();
        }

        match self.control {
            ControlStage::DataIn => self.continue_control_in(),
            ControlStage::DataOut => self.continue_control_out(),
            ControlStage::Idle => {
                if self.usb.rx_ready(0) {
                    self.receive_setup();
                }
            }
            ControlStage::Status => {}
        }
    }

    pub(crate) fn abort_control(&mut self) {
        self.control = ControlStage::Idle;
        self.setup = None;
        self.pending_address = None;
        self.endpoints[0][0].finish();
        self.endpoints[0][1].finish();
    }

    /// The status stage of the current control transfer has completed.
    fn complete_status(&mut self) {
        if let Some(address) = self.pending_address.take() {
            self.usb.set_address(address);
            self.state = if address == 0 {
                DeviceState::Waiting
            } else {
                DeviceState::Addressed
            };
            debug!("USB address {}", address);
        }
        if self.state >= DeviceState::Addressed {
            self.state = if self.configuration != 0 {
                DeviceState::Configured
            } else {
                DeviceState::Addressed
            };
        }

        for ep in 1..NUM_ENDPOINTS {
            for status in self.endpoints[ep].iter_mut() {
                if status.needs_arming {
                    status.needs_arming = false;
                    self.usb.configure_endpoint(
                        status.index,
                        status.direction,
                        config::USB_MAX_PACKET_SIZE,
                        true,
                    );
                }
            }
        }

        self.control = ControlStage::Idle;
        self.setup = None;
    }

    fn receive_setup(&mut self) {
        if self.usb.rx_count(0) as usize != SetupPacket::LEN {
            warn!("EP0 packet of {} bytes outside a transfer", self.usb.rx_count(0));
            self.usb.rx_done(0, true);
            self.stall_control();
            return;
        }
        let mut raw = [0u8; SetupPacket::LEN];
        self.read_fifo(0, &mut raw);
        self.handle_setup(SetupPacket::parse(&raw));
    }

    /// Send the next EP0 IN packet of the data stage.
    pub(crate) fn continue_control_in(&mut self) {
        if self.usb.tx_busy(0) {
            return;
        }
        let requested = self.setup.map_or(0, |s| s.length);
        let max = config::EP0_MAX_PACKET_SIZE as usize;
        let status = self.endpoints[0][Direction::In.index()];
        let mut chunk = [0u8; config::EP0_MAX_PACKET_SIZE as usize];
        let remaining = (status.total - status.count) as usize;
        let n = status.source.copy_from(status.count as usize, &mut chunk[..remaining.min(max)]);
        self.write_fifo(0, &chunk[..n]);

        let count = status.count + n as u16;
        // A short packet ends the stage; so does delivering all the host asked for.
        let last = n < max || count == requested;
        self.usb.tx_ready(0, last);
        let ep = &mut self.endpoints[0][Direction::In.index()];
        if last {
            ep.finish();
            self.control = ControlStage::Status;
        } else {
            ep.count = count;
        }
    }

    /// Drain one EP0 OUT packet of the data stage.
    fn continue_control_out(&mut self) {
        if !self.usb.rx_ready(0) {
            return;
        }
        let mut sink = [0u8; config::EP0_MAX_PACKET_SIZE as usize];
        let n = (self.usb.rx_count(0) as usize).min(sink.len());
        self.read_fifo(0, &mut sink[..n]);
        let ep = &mut self.endpoints[0][Direction::Out.index()];
        ep.count = ep.count.saturating_add(n as u16);
        let done = ep.count >= ep.total || n < sink.len();
        self.usb.rx_done(0, done);
        if done {
            self.data_out_complete();
        }
    }

    pub(crate) fn stall_control(&mut self) {
        self.usb.stall(0, Direction::In);
        self.abort_control();
    }

    // =========================================================================
    // FIFO packing
    // =========================================================================

    /// Move `buf.len()` bytes out of the OUT FIFO of `ep`: whole words first,
    /// then a half-word and a byte for the tail.
    pub(crate) fn read_fifo(&mut self, ep: u8, buf: &mut [u8]) {
        let mut words = buf.chunks_exact_mut(4);
        for word in &mut words {
            word.copy_from_slice(&self.usb.read_fifo_u32(ep).to_le_bytes());
        }
        let mut tail = words.into_remainder();
        if tail.len() >= 2 {
            let (half, rest) = tail.split_at_mut(2);
            half.copy_from_slice(&self.usb.read_fifo_u16(ep).to_le_bytes());
            tail = rest;
        }
        if let [byte] = tail {
            *byte = self.usb.read_fifo_u8(ep);
        }
    }

    pub(crate) fn write_fifo(&mut self, ep: u8, data: &[u8]) {
        let mut words = data.chunks_exact(4);
        for word in &mut words {
            self.usb
                .write_fifo_u32(ep, u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        }
        let mut tail = words.remainder();
        if tail.len() >= 2 {
            self.usb.write_fifo_u16(ep, u16::from_le_bytes([tail[0], tail[1]]));
            tail = &tail[2..];
        }
        if let [byte] = tail {
            self.usb.write_fifo_u8(ep, *byte);
        }
    }

    // =========================================================================
    // Bulk I/O from the main loop
    // =========================================================================

    /// Next endpoint with activity recorded by the interrupt handler.
    pub fn take_work(&mut self) -> Option<UsbPacket> {
        self.queue.pop()
    }

    /// A packet is waiting in the OUT FIFO of `ep` and the endpoint is not
    /// halted.
    pub fn rx_pending(&mut self, ep: u8) -> bool {
        let halted = self
            .endpoint(ep, Direction::Out)
            .map_or(true, |status| status.stalled);
        self.is_configured() && !halted && self.usb.rx_ready(ep)
    }

    fn check_bulk(&self, ep: u8, dir: Direction) -> Result<()> {
        if !self.is_configured() {
            return Err(Error::NotConfigured);
        }
        match self.endpoint(ep, dir) {
            Some(status) if status.stalled => Err(Error::Stalled(ep)),
            Some(_) if ep != 0 => Ok(()),
            _ => Err(Error::NotConfigured),
        }
    }

    /// Receive one packet from bulk OUT endpoint `ep` into `buf`.
    ///
    /// Bytes beyond `buf.len()` are discarded with the packet.
    pub fn read_endpoint(&mut self, ep: u8, buf: &mut [u8]) -> Result<usize> {
        self.check_bulk(ep, Direction::Out)?;
        let mut spins = self.timeouts.usb_fifo_spins;
        while !self.usb.rx_ready(ep) {
            if spins == 0 {
                return Err(Error::UsbTimeout(ep));
            }
            spins -= 1;
            core::hint::spin_loop();
        }
        let available = self.usb.rx_count(ep) as usize;
        let n = available.min(buf.len());
        self.read_fifo(ep, &mut buf[..n]);
        let mut discard = [0u8; config::USB_MAX_PACKET_SIZE as usize];
        let extra = (available - n).min(discard.len());
        self.read_fifo(ep, &mut discard[..extra]);
        self.usb.rx_done(ep, false);
        Ok(n)
    }

    /// Fill `buf` from consecutive packets on bulk OUT endpoint `ep`.
    pub fn read_exact(&mut self, ep: u8, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_endpoint(ep, &mut buf[filled..])?;
            if n == 0 {
                return Err(Error::UsbTimeout(ep));
            }
            filled += n;
        }
        Ok(())
    }

    /// Send `data` on bulk IN endpoint `ep` in max-size packets.
    pub fn write_endpoint(&mut self, ep: u8, data: &[u8]) -> Result<()> {
        self.check_bulk(ep, Direction::In)?;
        for chunk in data.chunks(config::USB_MAX_PACKET_SIZE as usize) {
            let mut spins = self.timeouts.usb_fifo_spins;
            while self.usb.tx_busy(ep) {
                if spins == 0 {
                    return Err(Error::UsbTimeout(ep));
                }
                spins -= 1;
                core::hint::spin_loop();
            }
            self.write_fifo(ep, chunk);
            self.usb.tx_ready(ep, false);
        }
        Ok(())
    }

    /// Halt an endpoint until the host clears it.
    pub fn stall_endpoint(&mut self, ep: u8, dir: Direction) {
        if let Some(status) = self.endpoints.get_mut(ep as usize).map(|e| &mut e[dir.index()]) {
            warn!("stalling EP{} {:?}", ep, dir);
            self.usb.stall(ep, dir);
            status.stalled = true;
            status.finish();
        }
    }

    pub(crate) fn clear_halt(&mut self, ep: u8, dir: Direction) -> bool {
        match self.endpoints.get_mut(ep as usize).map(|e| &mut e[dir.index()]) {
            Some(status) => {
                self.usb.clear_stall(ep, dir);
                status.stalled = false;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::InterruptStatus;
    use crate::testing::{enumerate, MockUsb};

    fn core() -> UsbCore<MockUsb> {
        UsbCore::new(MockUsb::default(), Descriptors::default(), Timeouts::default())
    }

    fn fire(core: &mut UsbCore<MockUsb>, bus: BusEvents, rx: u16, tx: u16) {
        core.peripheral_mut().pending = InterruptStatus { bus, rx, tx };
        core.on_interrupt();
    }

    #[test]
    fn device_state_is_ordered() {
        assert!(DeviceState::Detached < DeviceState::Attached);
        assert!(DeviceState::Powered < DeviceState::Waiting);
        assert!(DeviceState::Addressed < DeviceState::Configured);
    }

    #[test]
    fn lifecycle_to_waiting() {
        let mut c = core();
        c.attach();
        assert_eq!(c.state(), DeviceState::Attached);
        assert!(c.peripheral().connected);

        fire(&mut c, BusEvents::empty(), 0, 0);
        assert_eq!(c.state(), DeviceState::Powered);
        assert!(c.peripheral().enabled.contains(BusEvents::SUSPEND));

        fire(&mut c, BusEvents::RESET, 0, 0);
        assert_eq!(c.state(), DeviceState::Waiting);
        assert_eq!(c.peripheral().address, 0);
    }

    #[test]
    fn disconnect_from_any_state() {
        let mut c = core();
        enumerate(&mut c);
        assert!(c.is_configured());
        fire(&mut c, BusEvents::DISCONNECT | BusEvents::RESET, 0, 0);
        assert_eq!(c.state(), DeviceState::Detached);
        assert!(!c.peripheral().connected);
        assert_eq!(c.endpoint(1, Direction::In), Some(&EndpointStatus::new(1, Direction::In)));
    }

    #[test]
    fn suspend_blocks_endpoint_work_until_resume() {
        let mut c = core();
        enumerate(&mut c);
        fire(&mut c, BusEvents::SUSPEND, 0, 0);
        assert!(c.is_suspended());
        assert!(c.peripheral().enabled.contains(BusEvents::RESUME));
        assert!(!c.peripheral().enabled.contains(BusEvents::SUSPEND));

        fire(&mut c, BusEvents::empty(), 1 << 1, 0);
        assert_eq!(c.take_work(), None);

        fire(&mut c, BusEvents::RESUME, 1 << 1, 0);
        assert!(!c.is_suspended());
        assert!(c.peripheral().enabled.contains(BusEvents::SUSPEND));
        assert_eq!(
            c.take_work(),
            Some(UsbPacket {
                endpoint: 1,
                direction: Direction::Out
            })
        );
    }

    #[test]
    fn reset_reinitializes_endpoints() {
        let mut c = core();
        enumerate(&mut c);
        c.stall_endpoint(1, Direction::Out);
        fire(&mut c, BusEvents::RESET, 1 << 1, 0);
        assert_eq!(c.state(), DeviceState::Waiting);
        assert!(!c.endpoint(1, Direction::Out).unwrap().stalled);
        assert_eq!(c.take_work(), None);
    }

    #[test]
    fn endpoint_work_is_ignored_before_reset() {
        let mut c = core();
        c.attach();
        fire(&mut c, BusEvents::empty(), 1 << 1, 1 << 1);
        assert_eq!(c.take_work(), None);
    }

    #[test]
    fn queue_deduplicates_and_keeps_order() {
        let mut c = core();
        enumerate(&mut c);
        fire(&mut c, BusEvents::empty(), 1 << 2 | 1 << 1, 1 << 1);
        fire(&mut c, BusEvents::empty(), 1 << 1, 0);
        let out1 = UsbPacket { endpoint: 1, direction: Direction::Out };
        let in1 = UsbPacket { endpoint: 1, direction: Direction::In };
        let out2 = UsbPacket { endpoint: 2, direction: Direction::Out };
        assert_eq!(c.take_work(), Some(out1));
        assert_eq!(c.take_work(), Some(in1));
        assert_eq!(c.take_work(), Some(out2));
        assert_eq!(c.take_work(), None);
    }

    #[test]
    fn work_queue_is_bounded() {
        let mut q = WorkQueue::new();
        for ep in 0..NUM_ENDPOINTS as u8 {
            for direction in [Direction::Out, Direction::In] {
                assert!(q.push(UsbPacket { endpoint: ep, direction }));
            }
        }
        assert_eq!(q.len(), QUEUE_LEN);
        assert!(!q.push(UsbPacket { endpoint: 9, direction: Direction::In }));
        q.pop();
        assert!(q.push(UsbPacket { endpoint: 9, direction: Direction::In }));
    }

    #[test]
    fn fifo_packing_uses_words_then_tail() {
        let mut c = core();
        c.write_fifo(1, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(c.peripheral().fifo_widths, vec![4, 2, 1]);
        assert_eq!(c.peripheral().tx_staged[1], vec![1, 2, 3, 4, 5, 6, 7]);

        c.peripheral_mut().fifo_widths.clear();
        c.write_fifo(1, &[9; 5]);
        assert_eq!(c.peripheral().fifo_widths, vec![4, 1]);
    }

    #[test]
    fn bulk_write_splits_into_packets() {
        let mut c = core();
        enumerate(&mut c);
        let data: Vec<u8> = (0..=255).collect();
        c.write_endpoint(1, &data).unwrap();
        let sent = &c.peripheral().tx[1];
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|p| p.len() == 64));
        assert_eq!(sent.concat(), data);
    }

    #[test]
    fn bulk_read_times_out() {
        let timeouts = Timeouts { usb_fifo_spins: 3, ..Timeouts::default() };
        let mut c = UsbCore::new(MockUsb::default(), Descriptors::default(), timeouts);
        enumerate(&mut c);
        let mut buf = [0u8; 8];
        assert_eq!(c.read_endpoint(1, &mut buf), Err(Error::UsbTimeout(1)));
    }

    #[test]
    fn bulk_io_requires_configuration() {
        let mut c = core();
        assert_eq!(c.write_endpoint(1, &[1]), Err(Error::NotConfigured));
        enumerate(&mut c);
        c.stall_endpoint(1, Direction::In);
        assert_eq!(c.write_endpoint(1, &[1]), Err(Error::Stalled(1)));
        assert!(c.peripheral().stalled[1][Direction::In.index()]);
    }

    #[test]
    fn bulk_read_across_packets() {
        let mut c = core();
        enumerate(&mut c);
        c.peripheral_mut().queue_rx(1, &[7u8; 64]);
        c.peripheral_mut().queue_rx(1, &[8u8; 36]);
        let mut buf = [0u8; 100];
        c.read_exact(1, &mut buf).unwrap();
        assert_eq!(&buf[..64], &[7u8; 64][..]);
        assert_eq!(&buf[64..], &[8u8; 36][..]);
        assert!(!c.rx_pending(1));
    }
}
