//! Flash part identification.
//!
//! A JEDEC ID is resolved to a [`FlashChip`] by looking it up in the static
//! part tables, then by asking the chip for its SFDP tables, and finally by
//! synthesizing conservative defaults. Resolution always produces a chip.

use crate::config;
use crate::error::Error;
use crate::hal::{Chip, SpiTransport};
use crate::sfdp::{self, SfdpReader};
use crate::spi_flash::{JedecId, SpiFlash};

/// Where a chip's geometry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChipSource {
    Table,
    Sfdp,
    Synthesized,
}

/// Resolved geometry of one flash part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashChip {
    pub manufacturer: u8,
    pub device_type: u8,
    /// Capacity byte exactly as the chip reported it.
    pub reported_capacity: u8,
    /// Capacity in bytes, saturating at `u32::MAX`.
    pub capacity: u32,
    pub erase_opcode: u8,
    pub erase_size: u32,
    pub page_size: u32,
    pub source: ChipSource,
}

impl FlashChip {
    pub fn is_best_guess(&self) -> bool {
        self.source == ChipSource::Synthesized
    }

    /// Number of erase blocks covering the whole part.
    pub fn erase_blocks(&self) -> u32 {
        (self.capacity / self.erase_size.max(1)).max(1)
    }

    fn synthesized(id: JedecId) -> Self {
        FlashChip {
            manufacturer: id.manufacturer,
            device_type: id.device_type,
            reported_capacity: id.capacity,
            capacity: capacity_from_code(id.capacity),
            erase_opcode: config::DEFAULT_ERASE_OPCODE,
            erase_size: config::DEFAULT_ERASE_SIZE,
            page_size: config::DEFAULT_PAGE_SIZE,
            source: ChipSource::Synthesized,
        }
    }
}

/// JEDEC capacity codes are log2 of the size in bytes.
pub fn capacity_from_code(code: u8) -> u32 {
    if code >= 32 {
        u32::MAX
    } else {
        1u32 << code
    }
}

// =============================================================================
// Part tables
// =============================================================================

#[derive(Clone, Copy, Debug)]
struct KnownPart {
    device_type: u8,
    reported: u8,
    /// Capacity code to use instead of `reported`.
    actual: u8,
    erase_opcode: u8,
    erase_size: u32,
    page_size: u32,
}

const fn part(device_type: u8, reported: u8, actual: u8, erase_opcode: u8, erase_size: u32) -> KnownPart {
    KnownPart {
        device_type,
        reported,
        actual,
        erase_opcode,
        erase_size,
        page_size: 256,
    }
}

const fn sector(device_type: u8, capacity: u8) -> KnownPart {
    part(device_type, capacity, capacity, config::SPI_CMD_SECTOR_ERASE, 4096)
}

const fn block(device_type: u8, capacity: u8) -> KnownPart {
    part(device_type, capacity, capacity, config::SPI_CMD_BLOCK_ERASE, 64 * 1024)
}

const WINBOND: &[KnownPart] = &[
    // W25Q80 .. W25Q256
    sector(0x40, 0x14),
    sector(0x40, 0x15),
    sector(0x40, 0x16),
    sector(0x40, 0x17),
    sector(0x40, 0x18),
    sector(0x40, 0x19),
    // W25Q..JW (1.8 V)
    sector(0x60, 0x15),
    sector(0x60, 0x16),
    sector(0x60, 0x17),
    // W25X
    sector(0x30, 0x13),
    sector(0x30, 0x14),
    sector(0x30, 0x15),
    sector(0x30, 0x16),
    sector(0x30, 0x17),
];

const MACRONIX: &[KnownPart] = &[
    sector(0x20, 0x14),
    sector(0x20, 0x15),
    sector(0x20, 0x16),
    sector(0x20, 0x17),
    sector(0x20, 0x18),
    sector(0x20, 0x19),
    sector(0x25, 0x36),
    sector(0x25, 0x37),
];

const MICRON: &[KnownPart] = &[
    // M25P only has 64 KiB sector erase.
    block(0x20, 0x14),
    block(0x20, 0x15),
    block(0x20, 0x16),
    block(0x20, 0x17),
    // N25Q
    sector(0xBA, 0x16),
    sector(0xBA, 0x17),
    sector(0xBA, 0x18),
    sector(0xBA, 0x19),
];

const SPANSION: &[KnownPart] = &[
    block(0x02, 0x14),
    block(0x02, 0x15),
    block(0x02, 0x16),
    block(0x02, 0x17),
    sector(0x40, 0x15),
    sector(0x40, 0x16),
    sector(0x40, 0x17),
];

const GIGADEVICE: &[KnownPart] = &[
    sector(0x40, 0x14),
    sector(0x40, 0x15),
    sector(0x40, 0x16),
    sector(0x40, 0x17),
    sector(0x40, 0x18),
    sector(0x60, 0x16),
    sector(0x60, 0x17),
];

// SST encodes the part number in the capacity byte.
const SST: &[KnownPart] = &[
    part(0x25, 0x8E, 0x14, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x25, 0x41, 0x15, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x25, 0x4A, 0x16, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x25, 0x4B, 0x17, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x26, 0x41, 0x15, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x26, 0x42, 0x16, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x26, 0x43, 0x17, config::SPI_CMD_SECTOR_ERASE, 4096),
];

// Atmel/Adesto DataFlash-style IDs: family and density in the type byte.
const ATMEL: &[KnownPart] = &[
    part(0x45, 0x01, 0x14, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x46, 0x02, 0x15, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x47, 0x00, 0x16, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x47, 0x01, 0x16, config::SPI_CMD_SECTOR_ERASE, 4096),
    part(0x48, 0x00, 0x17, config::SPI_CMD_SECTOR_ERASE, 4096),
];

const ISSI: &[KnownPart] = &[
    sector(0x60, 0x14),
    sector(0x60, 0x15),
    sector(0x60, 0x16),
    sector(0x60, 0x17),
    sector(0x60, 0x18),
    sector(0x40, 0x15),
    sector(0x40, 0x16),
];

const EON: &[KnownPart] = &[
    sector(0x30, 0x14),
    sector(0x30, 0x15),
    sector(0x30, 0x16),
    sector(0x30, 0x17),
    sector(0x70, 0x16),
    sector(0x70, 0x17),
];

const MANUFACTURERS: &[(u8, &str, &[KnownPart])] = &[
    (0xEF, "Winbond", WINBOND),
    (0xC2, "Macronix", MACRONIX),
    (0x20, "Micron", MICRON),
    (0x01, "Spansion", SPANSION),
    (0xC8, "GigaDevice", GIGADEVICE),
    (0xBF, "SST", SST),
    (0x1F, "Atmel", ATMEL),
    (0x9D, "ISSI", ISSI),
    (0x1C, "EON", EON),
];

pub fn manufacturer_name(manufacturer: u8) -> Option<&'static str> {
    MANUFACTURERS
        .iter()
        .find(|(id, _, _)| *id == manufacturer)
        .map(|(_, name, _)| *name)
}

fn lookup(id: JedecId) -> Option<FlashChip> {
    let (_, _, parts) = MANUFACTURERS.iter().find(|(m, _, _)| *m == id.manufacturer)?;
    let p = parts
        .iter()
        .find(|p| p.device_type == id.device_type && p.reported == id.capacity)?;
    Some(FlashChip {
        manufacturer: id.manufacturer,
        device_type: id.device_type,
        reported_capacity: id.capacity,
        capacity: capacity_from_code(p.actual),
        erase_opcode: p.erase_opcode,
        erase_size: p.erase_size,
        page_size: p.page_size,
        source: ChipSource::Table,
    })
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve a JEDEC ID to chip geometry. Never fails.
pub fn resolve<R: SfdpReader>(reader: &mut R, id: JedecId) -> FlashChip {
    if let Some(chip) = lookup(id) {
        return chip;
    }

    match sfdp::discover(reader) {
        Ok(params) => FlashChip {
            manufacturer: id.manufacturer,
            device_type: id.device_type,
            reported_capacity: id.capacity,
            capacity: params.capacity_bytes(),
            erase_opcode: params.erase_opcode,
            erase_size: params.erase_size,
            page_size: params.page_size,
            source: ChipSource::Sfdp,
        },
        Err(e) => {
            debug!("no usable SFDP ({:?}), synthesizing geometry", e);
            FlashChip::synthesized(id)
        }
    }
}

/// SFDP access to one chip select on a shared flash bus.
pub struct ChipSfdp<'a, S> {
    pub flash: &'a mut SpiFlash<S>,
    pub chip: Chip,
}

impl<S: SpiTransport> SfdpReader for ChipSfdp<'_, S> {
    fn read_sfdp(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.flash.read_sfdp(self.chip, address, buf)
    }
}

/// Read the JEDEC ID of `chip` and resolve it.
///
/// An SPI failure reads as an unreadable ID and ends in synthesized geometry.
pub fn identify<S: SpiTransport>(flash: &mut SpiFlash<S>, chip: Chip) -> FlashChip {
    let id = flash.read_jedec_id(chip).unwrap_or_else(|e| {
        warn!("JEDEC ID read on {:?} failed: {:?}", chip, e);
        JedecId::UNREADABLE
    });
    let resolved = resolve(&mut ChipSfdp { flash, chip }, id);
    info!(
        "{:?}: {} 0x{:02x} 0x{:02x} 0x{:02x}, {} bytes, {:?}",
        chip,
        manufacturer_name(id.manufacturer).unwrap_or("unknown"),
        id.manufacturer,
        id.device_type,
        id.capacity,
        resolved.capacity,
        resolved.source
    );
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::testing::{sfdp_image, FailingSpi, SfdpImage, SimFlash, SimSpi};

    fn id(manufacturer: u8, device_type: u8, capacity: u8) -> JedecId {
        JedecId {
            manufacturer,
            device_type,
            capacity,
        }
    }

    #[test]
    fn table_hit_skips_sfdp() {
        let mut reader = SfdpImage::blank();
        let chip = resolve(&mut reader, id(0xEF, 0x40, 0x14));
        assert_eq!(chip.source, ChipSource::Table);
        assert_eq!(chip.capacity, 1 << 20);
        assert_eq!((chip.erase_opcode, chip.erase_size, chip.page_size), (0x20, 4096, 256));
        assert_eq!(reader.reads, 0);
    }

    #[test]
    fn sst_capacity_differs_from_reported() {
        let chip = resolve(&mut SfdpImage::blank(), id(0xBF, 0x25, 0x41));
        assert_eq!(chip.reported_capacity, 0x41);
        assert_eq!(chip.capacity, 2 * 1024 * 1024);
    }

    #[test]
    fn atmel_density_in_type_byte() {
        let chip = resolve(&mut SfdpImage::blank(), id(0x1F, 0x47, 0x00));
        assert_eq!(chip.capacity, 4 * 1024 * 1024);
        assert_eq!(chip.source, ChipSource::Table);
    }

    #[test]
    fn unknown_part_uses_sfdp() {
        let image = sfdp_image(0x8000_0019, 0x20, 16);
        let chip = resolve(&mut SfdpImage::new(&image), id(0xAA, 0x11, 0x16));
        assert_eq!(chip.source, ChipSource::Sfdp);
        assert_eq!(chip.capacity, (1 << 25) / 8);
        assert_eq!(chip.reported_capacity, 0x16);
        assert!(!chip.is_best_guess());
    }

    #[test]
    fn unknown_part_without_sfdp_is_synthesized() {
        let chip = resolve(&mut SfdpImage::blank(), id(0xAA, 0x11, 0x16));
        assert_eq!(
            chip,
            FlashChip {
                manufacturer: 0xAA,
                device_type: 0x11,
                reported_capacity: 0x16,
                capacity: 1 << 0x16,
                erase_opcode: 0xD8,
                erase_size: 64 * 1024,
                page_size: 256,
                source: ChipSource::Synthesized,
            }
        );
        assert!(chip.is_best_guess());
    }

    #[test]
    fn huge_capacity_code_saturates() {
        assert_eq!(capacity_from_code(31), 1 << 31);
        assert_eq!(capacity_from_code(32), u32::MAX);
        assert_eq!(capacity_from_code(0xFF), u32::MAX);
    }

    #[test]
    fn identify_over_spi() {
        let spi = SimSpi::new().with_chip(Chip::Local1, SimFlash::new([0xEF, 0x40, 0x17], 8 << 20));
        let mut flash = SpiFlash::new(spi, Timeouts::default());
        let chip = identify(&mut flash, Chip::Local1);
        assert_eq!(chip.capacity, 8 << 20);
        assert_eq!(chip.source, ChipSource::Table);
    }

    #[test]
    fn identify_unknown_chip_reads_sfdp_over_spi() {
        let flash = SimFlash::new([0xAA, 0x11, 0x16], 4 << 20).with_sfdp(sfdp_image(0x8000_0019, 0x20, 16));
        let spi = SimSpi::new().with_chip(Chip::Local2, flash);
        let mut flash = SpiFlash::new(spi, Timeouts::default());
        let chip = identify(&mut flash, Chip::Local2);
        assert_eq!(chip.source, ChipSource::Sfdp);
        assert_eq!(chip.capacity, 4 << 20);
    }

    #[test]
    fn spi_failure_synthesizes() {
        let mut flash = SpiFlash::new(FailingSpi::default(), Timeouts::default());
        let chip = identify(&mut flash, Chip::External);
        assert_eq!(chip.source, ChipSource::Synthesized);
        assert_eq!(chip.reported_capacity, 0xFF);
    }
}
