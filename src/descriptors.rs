//! USB descriptors, assembled at compile time.
//!
//! One configuration with a single vendor-specific interface carrying the
//! bulk endpoint pair of the flash protocol.

use crate::config;

pub const DESC_DEVICE: u8 = 0x01;
pub const DESC_CONFIGURATION: u8 = 0x02;
pub const DESC_STRING: u8 = 0x03;
pub const DESC_INTERFACE: u8 = 0x04;
pub const DESC_ENDPOINT: u8 = 0x05;

const TRANSFER_BULK: u8 = 0x02;
const CLASS_VENDOR: u8 = 0xFF;
const CONFIG_VALUE: u8 = 1;

const DEVICE_LEN: usize = 18;
const CONFIGURATION_LEN: usize = 9;
const INTERFACE_LEN: usize = 9;
const ENDPOINT_LEN: usize = 7;
const CONFIGURATION_TOTAL: u16 = (CONFIGURATION_LEN + INTERFACE_LEN + 2 * ENDPOINT_LEN) as u16;

const fn lo(v: u16) -> u8 {
    v as u8
}

const fn hi(v: u16) -> u8 {
    (v >> 8) as u8
}

static DEVICE: [u8; DEVICE_LEN] = [
    DEVICE_LEN as u8,
    DESC_DEVICE,
    0x00, 0x02, // bcdUSB 2.00
    0x00, // class defined per interface
    0x00,
    0x00,
    config::EP0_MAX_PACKET_SIZE as u8,
    lo(config::USB_VID), hi(config::USB_VID),
    lo(config::USB_PID), hi(config::USB_PID),
    lo(config::USB_DEVICE_RELEASE), hi(config::USB_DEVICE_RELEASE),
    1, // iManufacturer
    2, // iProduct
    3, // iSerialNumber
    1, // bNumConfigurations
];

static CONFIGURATION: [u8; CONFIGURATION_LEN] = [
    CONFIGURATION_LEN as u8,
    DESC_CONFIGURATION,
    lo(CONFIGURATION_TOTAL), hi(CONFIGURATION_TOTAL),
    1, // bNumInterfaces
    CONFIG_VALUE,
    0,
    0x80, // bus powered
    config::MAX_POWER,
];

static INTERFACE: [u8; INTERFACE_LEN] = [
    INTERFACE_LEN as u8,
    DESC_INTERFACE,
    0, // bInterfaceNumber
    0, // bAlternateSetting
    2, // bNumEndpoints
    CLASS_VENDOR,
    0,
    0,
    0,
];

static FLASH_OUT: [u8; ENDPOINT_LEN] = [
    ENDPOINT_LEN as u8,
    DESC_ENDPOINT,
    config::FLASH_ENDPOINT,
    TRANSFER_BULK,
    lo(config::USB_MAX_PACKET_SIZE), hi(config::USB_MAX_PACKET_SIZE),
    0,
];

static FLASH_IN: [u8; ENDPOINT_LEN] = [
    ENDPOINT_LEN as u8,
    DESC_ENDPOINT,
    0x80 | config::FLASH_ENDPOINT,
    TRANSFER_BULK,
    lo(config::USB_MAX_PACKET_SIZE), hi(config::USB_MAX_PACKET_SIZE),
    0,
];

/// The configuration descriptor followed by everything it owns, in the order
/// the host expects them.
static CONFIGURATION_CHAIN: [&[u8]; 4] = [&CONFIGURATION, &INTERFACE, &FLASH_OUT, &FLASH_IN];

/// Language ID list: US English only.
static LANGUAGES: [u8; 4] = [4, DESC_STRING, 0x09, 0x04];

/// Build a string descriptor from ASCII text.
const fn string_descriptor<const N: usize>(text: &str) -> [u8; N] {
    let bytes = text.as_bytes();
    let mut out = [0u8; N];
    out[0] = N as u8;
    out[1] = DESC_STRING;
    let mut i = 0;
    while i < bytes.len() && 2 + 2 * i + 1 < N {
        out[2 + 2 * i] = bytes[i];
        i += 1;
    }
    out
}

const fn string_len(text: &str) -> usize {
    2 + 2 * text.len()
}

static MANUFACTURER: [u8; string_len(config::MANUFACTURER)] = string_descriptor(config::MANUFACTURER);
static PRODUCT: [u8; string_len(config::PRODUCT)] = string_descriptor(config::PRODUCT);
static SERIAL: [u8; string_len(config::SERIAL_NUMBER)] = string_descriptor(config::SERIAL_NUMBER);

static STRINGS: [&[u8]; 4] = [&LANGUAGES, &MANUFACTURER, &PRODUCT, &SERIAL];

/// Where the bytes of a descriptor live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Single(&'static [u8]),
    Chain(&'static [&'static [u8]]),
}

/// Descriptor set served on `GET_DESCRIPTOR`.
#[derive(Clone, Copy, Debug)]
pub struct Descriptors {
    pub device: &'static [u8],
    pub configuration: &'static [&'static [u8]],
    /// Index 0 is the language list.
    pub strings: &'static [&'static [u8]],
}

impl Default for Descriptors {
    fn default() -> Self {
        Descriptors {
            device: &DEVICE,
            configuration: &CONFIGURATION_CHAIN,
            strings: &STRINGS,
        }
    }
}

impl Descriptors {
    /// Look up a descriptor by the high and low bytes of `wValue`.
    pub fn get(&self, kind: u8, index: u8) -> Option<Descriptor> {
        match kind {
            DESC_DEVICE => Some(Descriptor::Single(self.device)),
            DESC_CONFIGURATION if index == 0 => Some(Descriptor::Chain(self.configuration)),
            DESC_STRING => self.strings.get(index as usize).map(|s| Descriptor::Single(*s)),
            _ => None,
        }
    }

    pub fn configuration_value(&self) -> u8 {
        self.configuration
            .first()
            .and_then(|c| c.get(5).copied())
            .unwrap_or(CONFIG_VALUE)
    }
}
