use crate::consts::BLOCK_SIZE_U64;

use bitfield::bitfield;
use size::{consts::KiB, Size};

/// Card Specific Data block.
pub type CsdData = [u8; 16];

bitfield! {
    /// Fields shared by both CSD layouts.
    struct CsdBits(u128);
    u8, csd_structure, _: 127, 126;
    u8, taac, _: 119, 112;
    u8, nsac, _: 111, 104;
    u8, tran_speed, _: 103, 96;
    u16, ccc, _: 95, 84;
    u8, read_bl_len, _: 83, 80;
    read_bl_partial, _: 79;
    write_blk_misalign, _: 78;
    read_blk_misalign, _: 77;
    dsr_imp, _: 76;
    u16, v1_c_size, _: 73, 62;
    u8, v1_vdd_r_curr_min, _: 61, 59;
    u8, v1_vdd_r_curr_max, _: 58, 56;
    u8, v1_vdd_w_curr_min, _: 55, 53;
    u8, v1_vdd_w_curr_max, _: 52, 50;
    u8, v1_c_size_mult, _: 49, 47;
    u32, v2_c_size, _: 69, 48;
    erase_blk_en, _: 46;
    u8, sector_size, _: 45, 39;
    u8, wp_grp_size, _: 38, 32;
    wp_grp_enable, _: 31;
    u8, r2w_factor, _: 28, 26;
    u8, write_bl_len, _: 25, 22;
    write_bl_partial, _: 21;
    file_format_grp, _: 15;
    copy, _: 14;
    perm_write_protect, _: 13;
    tmp_write_protect, _: 12;
    u8, file_format, _: 11, 10;
    u8, crc, _: 7, 1;
}

/// Fields present in both CSD versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CsdCommon {
    /// CSD_STRUCTURE: 0 for version 1, 1 for version 2.
    pub csd_structure: u8,
    /// Data read access time 1 (TAAC).
    pub taac: u8,
    /// Data read access time 2 in clock cycles (NSAC).
    pub nsac: u8,
    /// Max data transfer rate (TRAN_SPEED).
    pub tran_speed: u8,
    /// Card command classes (CCC).
    pub ccc: u16,
    /// Max read data block length, log2 (READ_BL_LEN).
    pub read_bl_len: u8,
    pub read_bl_partial: bool,
    pub write_blk_misalign: bool,
    pub read_blk_misalign: bool,
    /// DSR implemented.
    pub dsr_imp: bool,
    /// Erase single block enable.
    pub erase_blk_en: bool,
    /// Erase sector size, in write blocks minus one.
    pub sector_size: u8,
    /// Write protect group size, in sectors minus one.
    pub wp_grp_size: u8,
    pub wp_grp_enable: bool,
    /// Write speed factor, log2.
    pub r2w_factor: u8,
    /// Max write data block length, log2 (WRITE_BL_LEN).
    pub write_bl_len: u8,
    pub write_bl_partial: bool,
    pub file_format_grp: bool,
    /// Copy flag.
    pub copy: bool,
    pub perm_write_protect: bool,
    pub tmp_write_protect: bool,
    pub file_format: u8,
    /// CRC7 checksum of the register.
    pub crc: u8,
}

/// Card Specific Data, version 1 (standard capacity cards).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CsdV1 {
    pub common: CsdCommon,
    /// Device size (C_SIZE), 12 bits.
    pub c_size: u16,
    pub vdd_r_curr_min: u8,
    pub vdd_r_curr_max: u8,
    pub vdd_w_curr_min: u8,
    pub vdd_w_curr_max: u8,
    /// Device size multiplier (C_SIZE_MULT), 3 bits.
    pub c_size_mult: u8,
}

/// Card Specific Data, version 2 (high and extended capacity cards).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CsdV2 {
    pub common: CsdCommon,
    /// Device size (C_SIZE), 22 bits.
    pub c_size: u32,
}

/// Card Specific Data, generic container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
}

/// Represents capacity provider.
pub trait CapacityProvider {
    /// Returns the card capacity in bytes.
    fn card_capacity_bytes(&self) -> u64;

    /// Returns the card capacity.
    fn card_capacity(&self) -> Size {
        Size::from_bytes(self.card_capacity_bytes())
    }

    /// Returns the card capacity in 512-byte blocks.
    fn card_capacity_blocks(&self) -> u64 {
        self.card_capacity_bytes() / BLOCK_SIZE_U64
    }
}

impl From<&CsdBits> for CsdCommon {
    fn from(bits: &CsdBits) -> Self {
        CsdCommon {
            csd_structure: bits.csd_structure(),
            taac: bits.taac(),
            nsac: bits.nsac(),
            tran_speed: bits.tran_speed(),
            ccc: bits.ccc(),
            read_bl_len: bits.read_bl_len(),
            read_bl_partial: bits.read_bl_partial(),
            write_blk_misalign: bits.write_blk_misalign(),
            read_blk_misalign: bits.read_blk_misalign(),
            dsr_imp: bits.dsr_imp(),
            erase_blk_en: bits.erase_blk_en(),
            sector_size: bits.sector_size(),
            wp_grp_size: bits.wp_grp_size(),
            wp_grp_enable: bits.wp_grp_enable(),
            r2w_factor: bits.r2w_factor(),
            write_bl_len: bits.write_bl_len(),
            write_bl_partial: bits.write_bl_partial(),
            file_format_grp: bits.file_format_grp(),
            copy: bits.copy(),
            perm_write_protect: bits.perm_write_protect(),
            tmp_write_protect: bits.tmp_write_protect(),
            file_format: bits.file_format(),
            crc: bits.crc(),
        }
    }
}

impl From<CsdData> for CsdV1 {
    fn from(csd_data: CsdData) -> Self {
        let bits = CsdBits(u128::from_be_bytes(csd_data));

        CsdV1 {
            common: CsdCommon::from(&bits),
            c_size: bits.v1_c_size(),
            vdd_r_curr_min: bits.v1_vdd_r_curr_min(),
            vdd_r_curr_max: bits.v1_vdd_r_curr_max(),
            vdd_w_curr_min: bits.v1_vdd_w_curr_min(),
            vdd_w_curr_max: bits.v1_vdd_w_curr_max(),
            c_size_mult: bits.v1_c_size_mult(),
        }
    }
}

impl From<CsdData> for CsdV2 {
    fn from(csd_data: CsdData) -> Self {
        let bits = CsdBits(u128::from_be_bytes(csd_data));

        CsdV2 {
            common: CsdCommon::from(&bits),
            c_size: bits.v2_c_size(),
        }
    }
}

impl Csd {
    /// Fields shared by both layouts.
    pub fn common(&self) -> &CsdCommon {
        match self {
            Csd::V1(csd) => &csd.common,
            Csd::V2(csd) => &csd.common,
        }
    }
}

impl CapacityProvider for CsdV1 {
    fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.c_size) + 1) * (1u64 << (self.c_size_mult + 2)) * BLOCK_SIZE_U64
    }
}

impl CapacityProvider for CsdV2 {
    fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.c_size) + 1) * 512 * (KiB as u64)
    }
}

impl CapacityProvider for Csd {
    fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }
}
