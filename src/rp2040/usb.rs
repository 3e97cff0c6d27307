//! RP2040 USB controller behind [`UsbPeripheral`].
//!
//! The controller moves packets through buffers in USB DPRAM rather than
//! FIFOs. Each endpoint direction gets one 64-byte buffer and a cursor, and
//! the FIFO accessors walk that cursor. Endpoints run single-buffered; the
//! `double_buffered` request from the core is accepted and ignored.
//!
//! VBUS detect is forced on, so a cable pull shows up as suspend followed by
//! a bus reset rather than as a disconnect event.

use embassy_rp::pac;
use pac::usb_dpram::vals::EpControlEndpointType;

use crate::config::NUM_ENDPOINTS;
use crate::hal::{BusEvents, Direction, Ep0Events, InterruptStatus, UsbPeripheral};

/// SETUP packet slot at the base of DPRAM.
const SETUP_OFFSET: usize = 0x000;
/// EP0 IN and OUT share this buffer.
const EP0_BUFFER_OFFSET: usize = 0x100;
/// First buffer handed to endpoints 1 and up.
const DATA_BUFFER_OFFSET: usize = 0x180;
const BUFFER_LEN: usize = 64;

/// Cycles between writing a buffer control word and setting AVAILABLE, so
/// the controller never sees a half-updated word.
const AVAILABLE_DELAY: u32 = 12;

fn dpram() -> *mut u8 {
    pac::USBCTRL_DPRAM.as_ptr() as *mut u8
}

fn buffer_offset(ep: u8, dir: Direction) -> usize {
    if ep == 0 {
        return EP0_BUFFER_OFFSET;
    }
    DATA_BUFFER_OFFSET + ((ep as usize - 1) * 2 + dir.index()) * BUFFER_LEN
}

pub struct Rp2040Usb {
    /// A SETUP packet sits in its slot and has not been released.
    setup_pending: bool,
    /// A SETUP arrived on its own, cutting off any EP0 transfer in flight.
    setup_end: bool,
    rx_cursor: [usize; NUM_ENDPOINTS],
    tx_len: [usize; NUM_ENDPOINTS],
    /// Next DATA PID per endpoint and direction; `true` is DATA1.
    pid: [[bool; 2]; NUM_ENDPOINTS],
    max_packet: [[u16; 2]; NUM_ENDPOINTS],
}

impl Rp2040Usb {
    /// Reset the controller and clear the endpoint tables.
    ///
    /// The USB PLL must already be running, which `embassy_rp::init` does.
    pub fn new() -> Self {
        let dpram = pac::USBCTRL_DPRAM;
        for ep in 0..16 {
            if ep > 0 {
                dpram.ep_in_control(ep - 1).write(|w| w.set_enable(false));
                dpram.ep_out_control(ep - 1).write(|w| w.set_enable(false));
            }
            dpram.ep_in_buffer_control(ep).write(|_| {});
            dpram.ep_out_buffer_control(ep).write(|_| {});
        }

        Self {
            setup_pending: false,
            setup_end: false,
            rx_cursor: [0; NUM_ENDPOINTS],
            tx_len: [0; NUM_ENDPOINTS],
            pid: [[false; 2]; NUM_ENDPOINTS],
            max_packet: [[BUFFER_LEN as u16; 2]; NUM_ENDPOINTS],
        }
    }

    fn next_pid(&mut self, ep: u8, dir: Direction) -> bool {
        let slot = &mut self.pid[ep as usize][dir.index()];
        let pid = *slot;
        *slot = !pid;
        pid
    }

    /// Hand a buffer to the controller.
    fn arm(&mut self, ep: u8, dir: Direction, len: usize) {
        let pid = self.next_pid(ep, dir);
        let dpram = pac::USBCTRL_DPRAM;
        let bc = match dir {
            Direction::In => dpram.ep_in_buffer_control(ep as usize),
            Direction::Out => dpram.ep_out_buffer_control(ep as usize),
        };
        bc.write(|w| {
            w.set_pid(0, pid);
            w.set_length(0, len as u16);
            w.set_full(0, dir == Direction::In);
        });
        for _ in 0..AVAILABLE_DELAY {
            core::hint::spin_loop();
        }
        bc.modify(|w| w.set_available(0, true));
    }

    fn arm_out(&mut self, ep: u8) {
        self.rx_cursor[ep as usize] = 0;
        let max = self.max_packet[ep as usize][Direction::Out.index()] as usize;
        self.arm(ep, Direction::Out, max);
    }

    fn rx_source(&self, ep: u8) -> usize {
        if ep == 0 && self.setup_pending {
            SETUP_OFFSET
        } else {
            buffer_offset(ep, Direction::Out)
        }
    }

    fn pull(&mut self, ep: u8) -> u8 {
        let at = self.rx_source(ep) + self.rx_cursor[ep as usize];
        self.rx_cursor[ep as usize] += 1;
        // SAFETY: `at` stays inside the endpoint's DPRAM buffer and the
        // controller has released it (FULL set, AVAILABLE clear).
        unsafe { core::ptr::read_volatile(dpram().add(at)) }
    }

    fn push(&mut self, ep: u8, bytes: &[u8]) {
        let base = buffer_offset(ep, Direction::In);
        for &b in bytes {
            let len = &mut self.tx_len[ep as usize];
            if *len >= BUFFER_LEN {
                warn!("EP{} IN overrun", ep);
                return;
            }
            // SAFETY: bounded by BUFFER_LEN above, and the buffer is not
            // AVAILABLE to the controller until `tx_ready`.
            unsafe { core::ptr::write_volatile(dpram().add(base + *len), b) };
            *len += 1;
        }
    }
}

impl UsbPeripheral for Rp2040Usb {
    fn interrupt_status(&mut self) -> InterruptStatus {
        let regs = pac::USBCTRL_REGS;
        let ints = regs.ints().read();
        let mut status = InterruptStatus::default();

        if ints.bus_reset() {
            regs.sie_status().write(|w| w.set_bus_reset(true));
            status.bus |= BusEvents::RESET;
        }
        if ints.dev_suspend() {
            regs.sie_status().write(|w| w.set_suspended(true));
            status.bus |= BusEvents::SUSPEND;
        }
        if ints.dev_resume_from_host() {
            regs.sie_status().write(|w| w.set_resume(true));
            status.bus |= BusEvents::RESUME;
        }

        if ints.buff_status() {
            let done = regs.buff_status().read();
            for ep in 0..NUM_ENDPOINTS {
                if done.ep_in(ep) {
                    status.tx |= 1 << ep;
                }
                if done.ep_out(ep) {
                    status.rx |= 1 << ep;
                }
            }
            regs.buff_status().write_value(done);
        }

        if ints.setup_req() {
            regs.sie_status().write(|w| w.set_setup_rec(true));
            self.setup_end = !status.endpoint_pending(0);
            self.setup_pending = true;
            self.rx_cursor[0] = 0;
            self.tx_len[0] = 0;
            // The data and status stages after SETUP start at DATA1.
            self.pid[0] = [true, true];
            status.rx |= 1;
        }

        status
    }

    fn ep0_events(&mut self) -> Ep0Events {
        if core::mem::take(&mut self.setup_end) {
            Ep0Events::SETUP_END
        } else {
            Ep0Events::empty()
        }
    }

    fn enable_bus_events(&mut self, events: BusEvents) {
        pac::USBCTRL_REGS.inte().write(|w| {
            w.set_buff_status(true);
            w.set_setup_req(true);
            w.set_bus_reset(events.contains(BusEvents::RESET));
            w.set_dev_suspend(events.contains(BusEvents::SUSPEND));
            w.set_dev_resume_from_host(events.contains(BusEvents::RESUME));
        });
    }

    fn connect(&mut self) {
        let regs = pac::USBCTRL_REGS;
        regs.usb_muxing().write(|w| {
            w.set_to_phy(true);
            w.set_softcon(true);
        });
        regs.usb_pwr().write(|w| {
            w.set_vbus_detect(true);
            w.set_vbus_detect_override_en(true);
        });
        regs.main_ctrl().write(|w| {
            w.set_controller_en(true);
            w.set_host_ndevice(false);
        });
        regs.sie_ctrl().write(|w| {
            w.set_ep0_int_1buf(true);
            w.set_pullup_en(true);
        });
    }

    fn disconnect(&mut self) {
        pac::USBCTRL_REGS.sie_ctrl().modify(|w| w.set_pullup_en(false));
    }

    fn set_address(&mut self, address: u8) {
        pac::USBCTRL_REGS.addr_endp().write(|w| w.set_address(address));
    }

    fn configure_endpoint(&mut self, ep: u8, dir: Direction, max_packet: u16, _double_buffered: bool) {
        let i = ep as usize;
        if i >= NUM_ENDPOINTS {
            return;
        }
        self.max_packet[i][dir.index()] = max_packet.min(BUFFER_LEN as u16);
        self.pid[i][dir.index()] = false;
        if ep == 0 {
            return;
        }

        let dpram = pac::USBCTRL_DPRAM;
        let control = match dir {
            Direction::In => dpram.ep_in_control(i - 1),
            Direction::Out => dpram.ep_out_control(i - 1),
        };
        control.write(|w| {
            w.set_enable(true);
            w.set_interrupt_per_buff(true);
            w.set_endpoint_type(EpControlEndpointType::BULK);
            w.set_buffer_address(buffer_offset(ep, dir) as u16);
        });
        if dir == Direction::Out {
            self.arm_out(ep);
        }
    }

    fn rx_ready(&mut self, ep: u8) -> bool {
        if ep == 0 && self.setup_pending {
            return true;
        }
        let bc = pac::USBCTRL_DPRAM.ep_out_buffer_control(ep as usize).read();
        // EP0 status-stage ZLPs are not data.
        bc.full(0) && !bc.available(0) && (ep != 0 || bc.length(0) > 0)
    }

    fn rx_count(&mut self, ep: u8) -> u16 {
        let len = if ep == 0 && self.setup_pending {
            8
        } else {
            pac::USBCTRL_DPRAM.ep_out_buffer_control(ep as usize).read().length(0) as usize
        };
        len.saturating_sub(self.rx_cursor[ep as usize]) as u16
    }

    fn read_fifo_u32(&mut self, ep: u8) -> u32 {
        u32::from_le_bytes([self.pull(ep), self.pull(ep), self.pull(ep), self.pull(ep)])
    }

    fn read_fifo_u16(&mut self, ep: u8) -> u16 {
        u16::from_le_bytes([self.pull(ep), self.pull(ep)])
    }

    fn read_fifo_u8(&mut self, ep: u8) -> u8 {
        self.pull(ep)
    }

    fn rx_done(&mut self, ep: u8, data_end: bool) {
        self.rx_cursor[ep as usize] = 0;
        if ep != 0 {
            self.arm_out(ep);
            return;
        }
        self.setup_pending = false;
        if data_end {
            // Status stage: zero-length IN.
            self.tx_len[0] = 0;
            self.arm(0, Direction::In, 0);
        } else {
            // Next data packet, or the host's status ZLP after an IN stage.
            self.arm_out(0);
        }
    }

    fn tx_busy(&mut self, ep: u8) -> bool {
        pac::USBCTRL_DPRAM.ep_in_buffer_control(ep as usize).read().available(0)
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

    fn tx_ready(&mut self, ep: u8, _last: bool) {
        let len = core::mem::take(&mut self.tx_len[ep as usize]);
        self.arm(ep, Direction::In, len);
    }

    fn stall(&mut self, ep: u8, dir: Direction) {
        let dpram = pac::USBCTRL_DPRAM;
        if ep == 0 {
            // The host may come back on either direction of EP0.
            pac::USBCTRL_REGS.ep_stall_arm().write(|w| {
                w.set_ep0_in(true);
                w.set_ep0_out(true);
            });
            dpram.ep_in_buffer_control(0).modify(|w| w.set_stall(true));
            dpram.ep_out_buffer_control(0).modify(|w| w.set_stall(true));
            return;
        }
        match dir {
            Direction::In => dpram.ep_in_buffer_control(ep as usize),
            Direction::Out => dpram.ep_out_buffer_control(ep as usize),
        }
        .modify(|w| w.set_stall(true));
    }

    fn clear_stall(&mut self, ep: u8, dir: Direction) {
        let dpram = pac::USBCTRL_DPRAM;
        match dir {
            Direction::In => dpram.ep_in_buffer_control(ep as usize),
            Direction::Out => dpram.ep_out_buffer_control(ep as usize),
        }
        .modify(|w| w.set_stall(false));
        self.pid[ep as usize][dir.index()] = false;
        match dir {
            Direction::Out if ep != 0 => self.arm_out(ep),
            Direction::In => self.tx_len[ep as usize] = 0,
            Direction::Out => {}
        }
    }
}
