// Flash protocol opcodes, message types and their wire encoding.

use bitflags::bitflags;

use crate::error::DecodeError;

// =============================================================================
// Opcodes
// =============================================================================

pub const CMD_DEVICE_COUNT: u8 = 0x00;
pub const CMD_LIST_DEVICE: u8 = 0x01;
pub const CMD_TARGET_DEVICE: u8 = 0x02;
pub const CMD_ERASE: u8 = 0x03;
pub const CMD_READ: u8 = 0x04;
pub const CMD_WRITE: u8 = 0x05;
pub const CMD_VERIFY: u8 = 0x06;
pub const CMD_RESET_TARGET: u8 = 0x07;

/// Largest encoded request or response header.
pub const MAX_FRAME_LEN: usize = 14;

// =============================================================================
// page_t
// =============================================================================

/// 24-bit page number, carried as three little-endian bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageAddr(u32);

impl PageAddr {
    pub const MAX: u32 = (1 << 24) - 1;
    pub const LEN: usize = 3;

    /// Values above [`PageAddr::MAX`] are a caller bug; release builds keep
    /// only the low 24 bits.
    pub fn new(page: u32) -> Self {
        debug_assert!(page <= Self::MAX, "page_t out of range: {}", page);
        PageAddr(page & Self::MAX)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }

    pub fn from_bytes(b: [u8; 3]) -> Self {
        PageAddr(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }
}

impl From<PageAddr> for u32 {
    fn from(p: PageAddr) -> u32 {
        p.0
    }
}

// =============================================================================
// Field enums
// =============================================================================

/// Which bus a slot lives on (`deviceType` on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeviceBus {
    Internal = 0,
    External = 1,
}

impl DeviceBus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(DeviceBus::Internal),
            1 => Some(DeviceBus::External),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EraseOperation {
    All = 0,
    Page = 1,
    PageRange = 2,
    Status = 3,
}

impl EraseOperation {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(EraseOperation::All),
            1 => Some(EraseOperation::Page),
            2 => Some(EraseOperation::PageRange),
            3 => Some(EraseOperation::Status),
            _ => None,
        }
    }
}

/// `complete` byte of an erase response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EraseStatus {
    InProgress = 0,
    Complete = 1,
    Invalid = 2,
}

/// `pageOk` byte of a verify response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum VerifyStatus {
    Mismatch = 0,
    Match = 1,
    Invalid = 2,
}

bitflags! {
    /// Trailing byte of a `listDevice` response describing how the geometry
    /// was obtained.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceFlags: u8 {
        /// Geometry was synthesized; the part is unknown.
        const BEST_GUESS = 1 << 0;
        /// Geometry came from the chip's SFDP tables.
        const FROM_SFDP  = 1 << 1;
        /// No such slot.
        const INVALID    = 1 << 2;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for DeviceFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "DeviceFlags({=u8:#x})", self.bits())
    }
}

/// Body of a `listDevice` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceInfo {
    pub size: u32,
    pub manufacturer: u8,
    pub device_type: u8,
    pub page_size: PageAddr,
    pub erase_size: PageAddr,
    pub flags: DeviceFlags,
}

impl DeviceInfo {
    pub fn invalid() -> Self {
        DeviceInfo {
            size: 0,
            manufacturer: 0,
            device_type: 0,
            page_size: PageAddr::default(),
            erase_size: PageAddr::default(),
            flags: DeviceFlags::INVALID,
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    DeviceCount,
    /// `device_type` stays raw so out-of-range values reach the dispatcher
    /// and resolve to no target.
    ListDevice { number: u8, device_type: u8 },
    TargetDevice { number: u8, device_type: u8 },
    Erase { operation: EraseOperation, begin: PageAddr, end: PageAddr },
    Read { page: PageAddr },
    Write { page: PageAddr, count: PageAddr },
    Verify,
    ResetTarget,
}

/// Typed responses. `read` answers with a raw page and `write` with nothing,
/// so neither has a variant here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    DeviceCount { internal: u8, external: u8 },
    ListDevice(DeviceInfo),
    TargetDevice,
    Erase { complete: EraseStatus, current: PageAddr },
    Verify { status: VerifyStatus },
    ResetTarget,
}

fn expect_len(frame: &[u8], expected: usize) -> Result<(), DecodeError> {
    if frame.len() < expected {
        return Err(DecodeError::Truncated {
            opcode: frame[0],
            len: frame.len(),
            expected,
        });
    }
    Ok(())
}

fn page_at(frame: &[u8], at: usize) -> PageAddr {
    PageAddr::from_bytes([frame[at], frame[at + 1], frame[at + 2]])
}

fn put_page(buf: &mut [u8], at: usize, page: PageAddr) {
    buf[at..at + PageAddr::LEN].copy_from_slice(&page.to_bytes());
}

impl Request {
    pub fn opcode(&self) -> u8 {
        match self {
            Request::DeviceCount => CMD_DEVICE_COUNT,
            Request::ListDevice { .. } => CMD_LIST_DEVICE,
            Request::TargetDevice { .. } => CMD_TARGET_DEVICE,
            Request::Erase { .. } => CMD_ERASE,
            Request::Read { .. } => CMD_READ,
            Request::Write { .. } => CMD_WRITE,
            Request::Verify => CMD_VERIFY,
            Request::ResetTarget => CMD_RESET_TARGET,
        }
    }

    /// Parse a request frame. Bytes past the fixed body are ignored.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let opcode = *frame.first().ok_or(DecodeError::Empty)?;
        match opcode {
            CMD_DEVICE_COUNT => Ok(Request::DeviceCount),
            CMD_LIST_DEVICE | CMD_TARGET_DEVICE => {
                expect_len(frame, 3)?;
                let (number, device_type) = (frame[1], frame[2]);
                if opcode == CMD_LIST_DEVICE {
                    Ok(Request::ListDevice { number, device_type })
                } else {
                    Ok(Request::TargetDevice { number, device_type })
                }
            }
            CMD_ERASE => {
                expect_len(frame, 8)?;
                let operation = EraseOperation::from_byte(frame[1]).ok_or(
                    DecodeError::InvalidField {
                        opcode,
                        value: frame[1],
                    },
                )?;
                Ok(Request::Erase {
                    operation,
                    begin: page_at(frame, 2),
                    end: page_at(frame, 5),
                })
            }
            CMD_READ => {
                expect_len(frame, 4)?;
                Ok(Request::Read {
                    page: page_at(frame, 1),
                })
            }
            CMD_WRITE => {
                expect_len(frame, 7)?;
                Ok(Request::Write {
                    page: page_at(frame, 1),
                    count: page_at(frame, 4),
                })
            }
            CMD_VERIFY => Ok(Request::Verify),
            CMD_RESET_TARGET => Ok(Request::ResetTarget),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }

    /// Encode into `buf`, returning the frame length.
    pub fn encode(&self, buf: &mut [u8; MAX_FRAME_LEN]) -> usize {
        buf[0] = self.opcode();
        match *self {
            Request::DeviceCount | Request::Verify | Request::ResetTarget => 1,
            Request::ListDevice {
                number,
                device_type,
            }
            | Request::TargetDevice {
                number,
                device_type,
            } => {
                buf[1] = number;
                buf[2] = device_type;
                3
            }
            Request::Erase {
                operation,
                begin,
                end,
            } => {
                buf[1] = operation as u8;
                put_page(buf, 2, begin);
                put_page(buf, 5, end);
                8
            }
            Request::Read { page } => {
                put_page(buf, 1, page);
                4
            }
            Request::Write { page, count } => {
                put_page(buf, 1, page);
                put_page(buf, 4, count);
                7
            }
        }
    }
}

impl Response {
    pub fn opcode(&self) -> u8 {
        match self {
            Response::DeviceCount { .. } => CMD_DEVICE_COUNT,
            Response::ListDevice(_) => CMD_LIST_DEVICE,
            Response::TargetDevice => CMD_TARGET_DEVICE,
            Response::Erase { .. } => CMD_ERASE,
            Response::Verify { .. } => CMD_VERIFY,
            Response::ResetTarget => CMD_RESET_TARGET,
        }
    }

    /// Encode into `buf`, returning the frame length.
    pub fn encode(&self, buf: &mut [u8; MAX_FRAME_LEN]) -> usize {
        buf[0] = self.opcode();
        match *self {
            Response::TargetDevice | Response::ResetTarget => 1,
            Response::DeviceCount { internal, external } => {
                buf[1] = internal;
                buf[2] = external;
                3
            }
            Response::ListDevice(info) => {
                buf[1..5].copy_from_slice(&info.size.to_le_bytes());
                buf[5] = info.manufacturer;
                buf[6] = info.device_type;
                put_page(buf, 7, info.page_size);
                put_page(buf, 10, info.erase_size);
                buf[13] = info.flags.bits();
                14
            }
            Response::Erase { complete, current } => {
                buf[1] = complete as u8;
                put_page(buf, 2, current);
                5
            }
            Response::Verify { status } => {
                buf[1] = status as u8;
                2
            }
        }
    }

    /// Parse a response frame, as the host side does.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let opcode = *frame.first().ok_or(DecodeError::Empty)?;
        let invalid = |value| DecodeError::InvalidField { opcode, value };
        match opcode {
            CMD_DEVICE_COUNT => {
                expect_len(frame, 3)?;
                Ok(Response::DeviceCount {
                    internal: frame[1],
                    external: frame[2],
                })
            }
            CMD_LIST_DEVICE => {
                expect_len(frame, 14)?;
                Ok(Response::ListDevice(DeviceInfo {
                    size: u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]),
                    manufacturer: frame[5],
                    device_type: frame[6],
                    page_size: page_at(frame, 7),
                    erase_size: page_at(frame, 10),
                    flags: DeviceFlags::from_bits_truncate(frame[13]),
                }))
            }
            CMD_TARGET_DEVICE => Ok(Response::TargetDevice),
            CMD_ERASE => {
                expect_len(frame, 5)?;
                let complete = match frame[1] {
                    0 => EraseStatus::InProgress,
                    1 => EraseStatus::Complete,
                    2 => EraseStatus::Invalid,
                    v => return Err(invalid(v)),
                };
                Ok(Response::Erase {
                    complete,
                    current: page_at(frame, 2),
                })
            }
            CMD_VERIFY => {
                expect_len(frame, 2)?;
                let status = match frame[1] {
                    0 => VerifyStatus::Mismatch,
                    1 => VerifyStatus::Match,
                    2 => VerifyStatus::Invalid,
                    v => return Err(invalid(v)),
                };
                Ok(Response::Verify { status })
            }
            CMD_RESET_TARGET => Ok(Response::ResetTarget),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}
