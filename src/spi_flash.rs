/// SPI flash command layer on top of a byte-wide [`SpiTransport`].
///
/// Every command asserts chip select, clocks opcode, address, dummy and data
/// bytes, and releases chip select again even when a byte transfer fails.
/// Erase and program only start the operation; callers poll
/// [`SpiFlash::is_busy`] for completion.
use crate::config::{self, Timeouts};
use crate::error::{Error, Result};
use crate::hal::{Chip, SpiTransport};

/// Raw JEDEC identification triplet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JedecId {
    pub manufacturer: u8,
    pub device_type: u8,
    pub capacity: u8,
}

impl JedecId {
    /// What a floating MISO line reads back.
    pub const UNREADABLE: JedecId = JedecId {
        manufacturer: 0xFF,
        device_type: 0xFF,
        capacity: 0xFF,
    };

    pub fn is_unreadable(&self) -> bool {
        matches!(
            (self.manufacturer, self.device_type, self.capacity),
            (0xFF, 0xFF, 0xFF) | (0x00, 0x00, 0x00)
        )
    }
}

pub struct SpiFlash<S> {
    spi: S,
    timeouts: Timeouts,
}

impl<S: SpiTransport> SpiFlash<S> {
    pub fn new(spi: S, timeouts: Timeouts) -> Self {
        Self { spi, timeouts }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn spi(&self) -> &S {
        &self.spi
    }

    pub fn spi_mut(&mut self) -> &mut S {
        &mut self.spi
    }

    // =========================================================================
    // Transaction framing
    // =========================================================================

    /// One chip-select-framed command: opcode, optional 24-bit address,
    /// `dummy` filler bytes, then `write` bytes out and `read` bytes in.
    fn transaction(
        &mut self,
        chip: Chip,
        opcode: u8,
        address: Option<u32>,
        dummy: usize,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<()> {
        self.spi.select(chip);
        let result = self.clock(opcode, address, dummy, write, read);
        self.spi.deselect();
        result
    }

    fn clock(
        &mut self,
        opcode: u8,
        address: Option<u32>,
        dummy: usize,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<()> {
        self.spi.transfer_byte(opcode)?;
        if let Some(address) = address {
            self.spi.transfer_byte((address >> 16) as u8)?;
            self.spi.transfer_byte((address >> 8) as u8)?;
            self.spi.transfer_byte(address as u8)?;
        }
        for _ in 0..dummy {
            self.spi.transfer_byte(0x00)?;
        }
        for &b in write {
            self.spi.transfer_byte(b)?;
        }
        for slot in read.iter_mut() {
            *slot = self.spi.transfer_byte(0xFF)?;
        }
        Ok(())
    }

    fn command(&mut self, chip: Chip, opcode: u8) -> Result<()> {
        self.transaction(chip, opcode, None, 0, &[], &mut [])
    }

    // =========================================================================
    // Identification and status
    // =========================================================================

    pub fn read_jedec_id(&mut self, chip: Chip) -> Result<JedecId> {
        let mut id = [0u8; 3];
        self.transaction(chip, config::SPI_CMD_READ_JEDEC_ID, None, 0, &[], &mut id)?;
        Ok(JedecId {
            manufacturer: id[0],
            device_type: id[1],
            capacity: id[2],
        })
    }

    pub fn read_status(&mut self, chip: Chip) -> Result<u8> {
        let mut status = [0u8; 1];
        self.transaction(chip, config::SPI_CMD_READ_STATUS, None, 0, &[], &mut status)?;
        Ok(status[0])
    }

    pub fn is_busy(&mut self, chip: Chip) -> Result<bool> {
        Ok(self.read_status(chip)? & config::SPI_STATUS_WIP != 0)
    }

    /// Poll the status register until WIP clears or the poll budget runs out.
    pub fn wait_idle(&mut self, chip: Chip) -> Result<()> {
        for _ in 0..self.timeouts.flash_busy_polls {
            if !self.is_busy(chip)? {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Error::FlashBusy)
    }

    /// Read `buf.len()` bytes of SFDP space starting at `address`.
    pub fn read_sfdp(&mut self, chip: Chip, address: u32, buf: &mut [u8]) -> Result<()> {
        self.transaction(chip, config::SPI_CMD_READ_SFDP, Some(address), 1, &[], buf)
    }

    // =========================================================================
    // Data
    // =========================================================================

    pub fn read(&mut self, chip: Chip, address: u32, buf: &mut [u8]) -> Result<()> {
        self.transaction(chip, config::SPI_CMD_READ_DATA, Some(address), 0, &[], buf)
    }

    pub fn write_enable(&mut self, chip: Chip) -> Result<()> {
        self.command(chip, config::SPI_CMD_WRITE_ENABLE)
    }

    pub fn write_disable(&mut self, chip: Chip) -> Result<()> {
        self.command(chip, config::SPI_CMD_WRITE_DISABLE)
    }

    /// Start programming one page. Returns as soon as the data is clocked in.
    pub fn start_page_program(&mut self, chip: Chip, address: u32, data: &[u8]) -> Result<()> {
        self.write_enable(chip)?;
        self.transaction(chip, config::SPI_CMD_PAGE_PROGRAM, Some(address), 0, data, &mut [])
    }

    /// Start erasing the whole chip.
    pub fn start_chip_erase(&mut self, chip: Chip) -> Result<()> {
        self.write_enable(chip)?;
        self.command(chip, config::SPI_CMD_CHIP_ERASE)
    }

    /// Start erasing the block at `address` with the part's erase opcode.
    pub fn start_block_erase(&mut self, chip: Chip, opcode: u8, address: u32) -> Result<()> {
        self.write_enable(chip)?;
        self.transaction(chip, opcode, Some(address), 0, &[], &mut [])
    }
}
