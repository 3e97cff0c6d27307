//! EP0 control transfers: SETUP parsing and the USB 2.0 chapter 9 standard
//! requests.

use crate::config::NUM_ENDPOINTS;
use crate::hal::{Direction, UsbPeripheral};
use crate::usb::{DeviceState, Source, UsbCore};

pub const GET_STATUS: u8 = 0x00;
pub const CLEAR_FEATURE: u8 = 0x01;
pub const SET_FEATURE: u8 = 0x03;
pub const SET_ADDRESS: u8 = 0x05;
pub const GET_DESCRIPTOR: u8 = 0x06;
pub const SET_DESCRIPTOR: u8 = 0x07;
pub const GET_CONFIGURATION: u8 = 0x08;
pub const SET_CONFIGURATION: u8 = 0x09;
pub const GET_INTERFACE: u8 = 0x0A;
pub const SET_INTERFACE: u8 = 0x0B;
pub const SYNCH_FRAME: u8 = 0x0C;

pub const FEATURE_ENDPOINT_HALT: u16 = 0;

/// Progress of the transfer on EP0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlStage {
    Idle,
    /// Device-to-host data stage, possibly spanning several packets.
    DataIn,
    /// Host-to-device data stage.
    DataOut,
    /// Waiting for the status stage to complete.
    Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// The 8-byte SETUP packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn parse(b: &[u8; Self::LEN]) -> Self {
        SetupPacket {
            request_type: b[0],
            request: b[1],
            value: u16::from_le_bytes([b[2], b[3]]),
            index: u16::from_le_bytes([b[4], b[5]]),
            length: u16::from_le_bytes([b[6], b[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [self.request_type, self.request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    /// Endpoint number and direction addressed by `wIndex`.
    fn endpoint(&self) -> Option<(u8, Direction)> {
        let ep = (self.index & 0x0F) as u8;
        let dir = if self.index & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        ((ep as usize) < NUM_ENDPOINTS).then_some((ep, dir))
    }
}

/// What a standard request turns into.
enum Reply {
    Data(Source),
    NoData,
    /// Accept and drain an OUT data stage.
    Receive,
    Stall,
}

fn inline(data: &[u8]) -> Source {
    let mut buf = [0u8; 2];
    buf[..data.len()].copy_from_slice(data);
    Source::Inline {
        data: buf,
        len: data.len() as u8,
    }
}

impl<U: UsbPeripheral> UsbCore<U> {
    pub(crate) fn handle_setup(&mut self, setup: SetupPacket) {
        trace!("SETUP {:?}", setup);
        self.setup = Some(setup);

        let reply = if setup.kind() == RequestKind::Standard {
            self.standard_request(&setup)
        } else {
            debug!("unsupported {:?} request 0x{:02x}", setup.kind(), setup.request);
            Reply::Stall
        };

        match reply {
            Reply::Data(_) if setup.length == 0 => {
                self.usb.rx_done(0, true);
                self.control = ControlStage::Status;
            }
            Reply::Data(source) => {
                self.usb.rx_done(0, false);
                let ep = &mut self.endpoints[0][Direction::In.index()];
                ep.source = source;
                ep.count = 0;
                ep.total = (source.len() as u16).min(setup.length);
                self.control = ControlStage::DataIn;
                self.continue_control_in();
            }
            Reply::NoData => {
                self.usb.rx_done(0, true);
                self.control = ControlStage::Status;
            }
            Reply::Receive if setup.length > 0 => {
                self.usb.rx_done(0, false);
                let ep = &mut self.endpoints[0][Direction::Out.index()];
                ep.count = 0;
                ep.total = setup.length;
                self.control = ControlStage::DataOut;
            }
            Reply::Receive => {
                self.usb.rx_done(0, true);
                self.data_out_complete();
            }
            Reply::Stall => {
                self.usb.rx_done(0, true);
                self.stall_control();
            }
        }
    }

    /// The OUT data stage has been fully drained.
    pub(crate) fn data_out_complete(&mut self) {
        self.endpoints[0][Direction::Out.index()].count = 0;
        match self.setup.map(|s| s.request) {
            // Descriptors are read-only; the data is consumed and refused.
            Some(SET_DESCRIPTOR) => self.stall_control(),
            _ => self.control = ControlStage::Status,
        }
    }

    fn standard_request(&mut self, setup: &SetupPacket) -> Reply {
        match (setup.request, setup.recipient()) {
            (GET_STATUS, Recipient::Device) | (GET_STATUS, Recipient::Interface) => {
                // Bus powered, no remote wakeup.
                Reply::Data(inline(&[0, 0]))
            }
            (GET_STATUS, Recipient::Endpoint) => match setup.endpoint() {
                Some((ep, dir)) => {
                    let halted = self.endpoints[ep as usize][dir.index()].stalled;
                    Reply::Data(inline(&[halted as u8, 0]))
                }
                None => Reply::Stall,
            },
            (CLEAR_FEATURE, Recipient::Endpoint) if setup.value == FEATURE_ENDPOINT_HALT => {
                match setup.endpoint() {
                    Some((ep, dir)) if self.clear_halt(ep, dir) => {
                        debug!("EP{} {:?} halt cleared", ep, dir);
                        Reply::NoData
                    }
                    _ => Reply::Stall,
                }
            }
            (SET_FEATURE, Recipient::Endpoint) if setup.value == FEATURE_ENDPOINT_HALT => {
                match setup.endpoint() {
                    Some((ep, dir)) if ep != 0 => {
                        self.stall_endpoint(ep, dir);
                        Reply::NoData
                    }
                    _ => Reply::Stall,
                }
            }
            (SET_ADDRESS, Recipient::Device) if setup.value < 0x80 => {
                // Takes effect once the status stage has gone out at address 0.
                self.pending_address = Some(setup.value as u8);
                Reply::NoData
            }
            (GET_DESCRIPTOR, _) => {
                let [index, kind] = setup.value.to_le_bytes();
                match self.descriptors.get(kind, index) {
                    Some(descriptor) => Reply::Data(descriptor.into()),
                    None => {
                        debug!("no descriptor 0x{:02x}/{}", kind, index);
                        Reply::Stall
                    }
                }
            }
            (SET_DESCRIPTOR, _) => Reply::Receive,
            (GET_CONFIGURATION, Recipient::Device) => Reply::Data(inline(&[self.configuration])),
            (SET_CONFIGURATION, Recipient::Device) if self.state >= DeviceState::Addressed => {
                self.set_configuration(setup.value)
            }
            (GET_INTERFACE, Recipient::Interface) if self.is_configured() && setup.index == 0 => {
                Reply::Data(inline(&[0]))
            }
            (SET_INTERFACE, Recipient::Interface)
                if self.is_configured() && setup.index == 0 && setup.value == 0 =>
            {
                Reply::NoData
            }
            // No isochronous endpoints; SYNCH_FRAME lands here too.
            _ => {
                debug!("unsupported request 0x{:02x}", setup.request);
                Reply::Stall
            }
        }
    }

    fn set_configuration(&mut self, value: u16) -> Reply {
        if value == 0 {
            self.configuration = 0;
            return Reply::NoData;
        }
        if value != u16::from(self.descriptors.configuration_value()) {
            return Reply::Stall;
        }
        self.configuration = value as u8;
        for status in self.endpoints[crate::config::FLASH_ENDPOINT as usize].iter_mut() {
            status.needs_arming = true;
            status.stalled = false;
        }
        Reply::NoData
    }
}
