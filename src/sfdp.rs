//! Serial Flash Discoverable Parameters (JESD216).
//!
//! Only the JEDEC Basic Flash Parameter Table is consulted, and only for the
//! geometry the programmer needs: density, the sector erase opcode and size,
//! and the program page size.

use crate::error::{Error, SfdpError};

/// `"SFDP"` read as a little-endian u32.
pub const SFDP_SIGNATURE: u32 = 0x5044_4653;
/// Parameter ID of the JEDEC Basic Flash Parameter Table.
pub const BASIC_TABLE_ID: u16 = 0xFF00;

const HEADER_LEN: usize = 8;
/// DWORDs read from the basic table; DWORD11 carries the page size.
const BASIC_TABLE_DWORDS: usize = 16;

/// Source of SFDP bytes, usually a flash chip on the SPI bus.
pub trait SfdpReader {
    fn read_sfdp(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SfdpHeader {
    pub minor: u8,
    pub major: u8,
    /// Number of parameter headers that follow (the raw field plus one).
    pub parameter_headers: usize,
}

impl SfdpHeader {
    pub fn parse(b: &[u8; HEADER_LEN]) -> Result<Self, SfdpError> {
        if u32::from_le_bytes([b[0], b[1], b[2], b[3]]) != SFDP_SIGNATURE {
            return Err(SfdpError::BadSignature);
        }
        Ok(SfdpHeader {
            minor: b[4],
            major: b[5],
            parameter_headers: b[6] as usize + 1,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParameterHeader {
    pub id: u16,
    pub minor: u8,
    pub major: u8,
    pub length_dwords: u8,
    pub pointer: u32,
}

impl ParameterHeader {
    pub fn parse(b: &[u8; HEADER_LEN]) -> Self {
        ParameterHeader {
            id: u16::from_le_bytes([b[0], b[7]]),
            minor: b[1],
            major: b[2],
            length_dwords: b[3],
            pointer: u32::from_le_bytes([b[4], b[5], b[6], 0]),
        }
    }
}

/// Geometry extracted from the Basic Flash Parameter Table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BasicParams {
    pub capacity_bits: u64,
    pub erase_opcode: u8,
    pub erase_size: u32,
    pub page_size: u32,
}

impl BasicParams {
    /// Parse the table body. `table` holds whole DWORDs, little-endian.
    pub fn parse(table: &[u8]) -> Result<Self, SfdpError> {
        let dwords = table.len() / 4;
        if dwords < 2 {
            return Err(SfdpError::InvalidParams);
        }
        let dword = |n: usize| {
            let i = (n - 1) * 4;
            u32::from_le_bytes([table[i], table[i + 1], table[i + 2], table[i + 3]])
        };

        let density = dword(2);
        let capacity_bits = if density & 0x8000_0000 == 0 {
            u64::from(density) + 1
        } else {
            let n = density & 0x7FFF_FFFF;
            if n >= 64 {
                return Err(SfdpError::InvalidParams);
            }
            1u64 << n
        };

        let dword1 = dword(1);
        let declared_opcode = (dword1 >> 8) as u8;
        let legacy_4k = dword1 & 0b11 == 0b01;

        // DWORD8 and DWORD9 hold four (size exponent, opcode) pairs.
        let mut erase = None;
        if dwords >= 9 {
            let types = [dword(8).to_le_bytes(), dword(9).to_le_bytes()];
            erase = types
                .iter()
                .flat_map(|d| [(d[0], d[1]), (d[2], d[3])])
                .find(|&(exp, op)| exp != 0 && exp < 32 && op == declared_opcode)
                .map(|(exp, op)| (op, 1u32 << exp));
        }
        let (erase_opcode, erase_size) = match erase {
            Some(pair) => pair,
            None if legacy_4k && declared_opcode != 0xFF => (declared_opcode, 4096),
            None => return Err(SfdpError::InvalidParams),
        };

        let page_size = if dwords >= 11 {
            1u32 << ((dword(11) >> 4) & 0xF)
        } else {
            256
        };

        Ok(BasicParams {
            capacity_bits,
            erase_opcode,
            erase_size,
            page_size,
        })
    }

    /// Density in bytes, saturating at `u32::MAX`.
    pub fn capacity_bytes(&self) -> u32 {
        u32::try_from(self.capacity_bits / 8).unwrap_or(u32::MAX)
    }
}

/// Walk the SFDP structures of a chip and return its basic parameters.
///
/// Fails with [`SfdpError::BadSignature`] before anything else is read when
/// the signature is missing.
pub fn discover<R: SfdpReader>(reader: &mut R) -> Result<BasicParams, SfdpError> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_sfdp(0, &mut raw)?;
    let header = SfdpHeader::parse(&raw)?;
    if header.major != 1 {
        return Err(SfdpError::UnsupportedRevision(header.major));
    }
    debug!(
        "SFDP v{}.{} with {} parameter headers",
        header.major, header.minor, header.parameter_headers
    );

    let mut basic = None;
    for i in 0..header.parameter_headers {
        reader.read_sfdp((HEADER_LEN * (i + 1)) as u32, &mut raw)?;
        let param = ParameterHeader::parse(&raw);
        if param.id == BASIC_TABLE_ID && param.major == 1 {
            basic = Some(param);
            break;
        }
    }
    let basic = basic.ok_or(SfdpError::NoBasicTable)?;

    let mut table = [0u8; BASIC_TABLE_DWORDS * 4];
    let len = (basic.length_dwords as usize).min(BASIC_TABLE_DWORDS) * 4;
    reader.read_sfdp(basic.pointer, &mut table[..len])?;
    BasicParams::parse(&table[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sfdp_image, SfdpImage};

    #[test]
    fn rejects_missing_signature() {
        let mut raw = *b"SFDQ\x00\x01\x00\xFF";
        assert_eq!(SfdpHeader::parse(&raw), Err(SfdpError::BadSignature));
        raw = [0xFF; 8];
        assert_eq!(SfdpHeader::parse(&raw), Err(SfdpError::BadSignature));
    }

    #[test]
    fn bad_signature_stops_discovery() {
        let mut image = sfdp_image(0x8000_0019, 0x20, 8);
        image[0] = b'X';
        let mut reader = SfdpImage::new(&image);
        assert_eq!(discover(&mut reader), Err(SfdpError::BadSignature));
        assert_eq!(reader.reads, 1);
    }

    #[test]
    fn exponential_density() {
        // versionMajor 1, raw parameter header count 0, density 2^25 bits.
        let image = sfdp_image(0x8000_0019, 0x20, 16);
        let params = discover(&mut SfdpImage::new(&image)).unwrap();
        assert_eq!(params.capacity_bytes(), (1 << 25) / 8);
        assert_eq!(params.erase_opcode, 0x20);
        assert_eq!(params.erase_size, 4096);
        assert_eq!(params.page_size, 256);
    }

    #[test]
    fn linear_density() {
        let image = sfdp_image(0x00FF_FFFF, 0x20, 9);
        let params = discover(&mut SfdpImage::new(&image)).unwrap();
        assert_eq!(params.capacity_bits, 0x0100_0000);
        assert_eq!(params.capacity_bytes(), 2 * 1024 * 1024);
    }

    #[test]
    fn erase_pair_follows_declared_opcode() {
        // Declared opcode 0xD8 matches erase type 3 (64 KiB).
        let image = sfdp_image(0x8000_0019, 0xD8, 16);
        let params = discover(&mut SfdpImage::new(&image)).unwrap();
        assert_eq!((params.erase_opcode, params.erase_size), (0xD8, 64 * 1024));
    }

    #[test]
    fn short_table_defaults_page_size() {
        let image = sfdp_image(0x8000_0019, 0x20, 9);
        let params = discover(&mut SfdpImage::new(&image)).unwrap();
        assert_eq!(params.page_size, 256);
    }

    #[test]
    fn unsupported_declared_opcode_is_invalid() {
        let mut table = [0u8; 36];
        table[0] = 0b11;
        table[1] = 0xFF;
        table[4..8].copy_from_slice(&0x8000_0019u32.to_le_bytes());
        assert_eq!(BasicParams::parse(&table), Err(SfdpError::InvalidParams));
    }
}
