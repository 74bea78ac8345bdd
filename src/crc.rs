/// CRC-7 generator polynomial used by SD command frames.
const CRC7_POLYNOMIAL: u8 = 0x89;

/// Table driven CRC-7.
pub struct Crc7 {
    table: [u8; 256],
}

/// Shared CRC-7 engine, built at compile time.
pub static CRC7: Crc7 = Crc7::new();

impl Crc7 {
    /// Builds the lookup table.
    pub const fn new() -> Self {
        let mut table = [0u8; 256];
        let mut i = 0;

        while i < 256 {
            let mut entry = if i & 0x80 != 0 {
                i as u8 ^ CRC7_POLYNOMIAL
            } else {
                i as u8
            };

            let mut bit = 1;
            while bit < 8 {
                entry <<= 1;
                if entry & 0x80 != 0 {
                    entry ^= CRC7_POLYNOMIAL;
                }
                bit += 1;
            }

            table[i] = entry;
            i += 1;
        }

        Crc7 { table }
    }

    /// Table entry for `byte`.
    pub fn entry(&self, byte: u8) -> u8 {
        self.table[byte as usize]
    }

    /// CRC-7 calculation.
    pub fn compute(&self, data: &[u8]) -> u8 {
        data.iter()
            .fold(0, |crc, &byte| self.table[((crc << 1) ^ byte) as usize])
    }
}

impl Default for Crc7 {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-16 calculation.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit by bit CRC-7, used as the reference for the table.
    fn crc7_bitwise(data: &[u8]) -> u8 {
        let mut crc: u8 = 0;
        for mut byte in data.iter().cloned() {
            for _bit in 0..8 {
                crc <<= 1;
                if ((byte & 0x80) ^ (crc & 0x80)) != 0 {
                    crc ^= 0x09;
                }
                byte <<= 1;
            }
        }
        crc & 0x7F
    }

    #[test]
    fn table_matches_bitwise_crc_for_every_byte() {
        for byte in 0..=255u8 {
            assert_eq!(CRC7.entry(byte), crc7_bitwise(&[byte]), "byte {byte:#04x}");
        }
    }

    #[test]
    fn known_command_frames() {
        assert_eq!(CRC7.compute(&[0x40, 0x00, 0x00, 0x00, 0x00]), 0x4A);
        assert_eq!(CRC7.compute(&[0x48, 0x00, 0x00, 0x01, 0xAA]), 0x43);
    }

    #[test]
    fn read_single_block_frame_is_stable() {
        let frame = [0x51, 0x00, 0x00, 0x02, 0x00];
        let first = CRC7.compute(&frame);

        assert_eq!(first, 0x3C);
        assert_eq!(CRC7.compute(&frame), first);
        assert_eq!((first << 1) | 0x01, 0x79);
    }

    #[test]
    fn building_twice_gives_the_same_table() {
        let other = Crc7::new();
        for byte in 0..=255u8 {
            assert_eq!(other.entry(byte), CRC7.entry(byte));
        }
    }

    #[test]
    fn longer_buffers_match_bitwise_crc() {
        let frames: [[u8; 5]; 4] = [
            [0x77, 0x00, 0x00, 0x00, 0x00],
            [0x69, 0x40, 0x00, 0x00, 0x00],
            [0x59, 0x12, 0x34, 0x56, 0x78],
            [0x7A, 0xFF, 0x00, 0xFF, 0x00],
        ];
        for frame in frames.iter() {
            assert_eq!(CRC7.compute(frame), crc7_bitwise(frame));
        }
    }

    #[test]
    fn crc16_ccitt_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[0xFF; 512]), 0x7FA1);
    }
}
