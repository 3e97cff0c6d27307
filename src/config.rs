// Device identity, hardware constants and wait budgets.

// =============================================================================
// USB identity
// =============================================================================

pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x5350;
/// bcdDevice reported in the device descriptor.
pub const USB_DEVICE_RELEASE: u16 = 0x0100;

pub const MANUFACTURER: &str = "spiprog";
pub const PRODUCT: &str = "SPI Flash Programmer";
pub const SERIAL_NUMBER: &str = "SP0000001";

/// bMaxPower in 2 mA units.
pub const MAX_POWER: u8 = 50;

// =============================================================================
// Endpoints
// =============================================================================

/// Number of hardware endpoints tracked by the transport, EP0 included.
pub const NUM_ENDPOINTS: usize = 4;

/// Control endpoint max packet size.
pub const EP0_MAX_PACKET_SIZE: u16 = 64;

/// Bulk endpoint pair carrying the flash protocol.
pub const FLASH_ENDPOINT: u8 = 1;

/// USB max packet size for Full Speed bulk endpoints.
pub const USB_MAX_PACKET_SIZE: u16 = 64;

// =============================================================================
// Programmer topology
// =============================================================================

/// On-board flash chips visible to the host.
pub const INTERNAL_DEVICE_COUNT: u8 = 2;
/// Flash chips detected on the external header in this hardware revision.
pub const EXTERNAL_DEVICE_COUNT: u8 = 0;

/// Largest program page any supported part may declare.
pub const MAX_PAGE_SIZE: usize = 256;

// =============================================================================
// SPI flash command opcodes
// =============================================================================

pub const SPI_CMD_WRITE_ENABLE: u8 = 0x06;
pub const SPI_CMD_WRITE_DISABLE: u8 = 0x04;
pub const SPI_CMD_READ_STATUS: u8 = 0x05;
pub const SPI_CMD_READ_JEDEC_ID: u8 = 0x9F;
pub const SPI_CMD_READ_DATA: u8 = 0x03;
pub const SPI_CMD_PAGE_PROGRAM: u8 = 0x02;
pub const SPI_CMD_CHIP_ERASE: u8 = 0xC7;
pub const SPI_CMD_BLOCK_ERASE: u8 = 0xD8;
pub const SPI_CMD_SECTOR_ERASE: u8 = 0x20;
pub const SPI_CMD_READ_SFDP: u8 = 0x5A;

pub const SPI_STATUS_WIP: u8 = 0x01;
pub const SPI_STATUS_WEL: u8 = 0x02;

// =============================================================================
// Synthesized geometry for unknown parts
// =============================================================================

pub const DEFAULT_ERASE_OPCODE: u8 = SPI_CMD_BLOCK_ERASE;
pub const DEFAULT_ERASE_SIZE: u32 = 64 * 1024;
pub const DEFAULT_PAGE_SIZE: u32 = 256;

// =============================================================================
// Wait budgets
// =============================================================================

/// Upper bounds for every busy-wait in the firmware.
///
/// Each field counts loop iterations, not time; the right values depend on
/// core clock and SPI frequency. The defaults are sized for a 125 MHz core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeouts {
    /// Spins waiting for a USB FIFO to accept or deliver a packet.
    pub usb_fifo_spins: u32,
    /// Status register reads waiting for write-in-progress to clear.
    pub flash_busy_polls: u32,
    /// Spins the target reset line is held asserted.
    pub reset_pulse_spins: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            usb_fifo_spins: 2_000_000,
            flash_busy_polls: 200_000,
            reset_pulse_spins: 125_000,
        }
    }
}
