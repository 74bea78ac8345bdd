use bitfield::bitfield;

/// Card Identification block.
pub type CidData = [u8; 16];

bitfield! {
    struct CidBits(u128);
    u8, manufacturer_id, _: 127, 120;
    u16, oem_id, _: 119, 104;
    u64, product_name, _: 103, 64;
    u8, product_revision, _: 63, 56;
    u32, serial_number, _: 55, 24;
    u8, manufacturing_year, _: 19, 12;
    u8, manufacturing_month, _: 11, 8;
    u8, crc, _: 7, 1;
}

/// Card Identification register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cid {
    /// Manufacturer ID (MID).
    pub manufacturer_id: u8,
    /// OEM/Application ID (OID), two ASCII characters.
    pub oem_id: [u8; 2],
    /// Product name (PNM), five ASCII characters.
    pub product_name: [u8; 5],
    /// Product revision (PRV), BCD `n.m`.
    pub product_revision: u8,
    /// Product serial number (PSN).
    pub serial_number: u32,
    /// Manufacturing year, offset from 2000.
    pub manufacturing_year: u8,
    /// Manufacturing month, 1..=12.
    pub manufacturing_month: u8,
    /// CRC7 checksum of the register.
    pub crc: u8,
}

impl Cid {
    /// Product name as text, if the card reports printable ASCII.
    pub fn product_name_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.product_name).ok()
    }

    /// Product revision as `(major, minor)`.
    pub fn revision(&self) -> (u8, u8) {
        (self.product_revision >> 4, self.product_revision & 0x0F)
    }

    /// Manufacturing date as `(year, month)`.
    pub fn manufacturing_date(&self) -> (u16, u8) {
        (
            2000 + u16::from(self.manufacturing_year),
            self.manufacturing_month,
        )
    }
}

impl From<CidData> for Cid {
    fn from(cid_data: CidData) -> Self {
        let bits = CidBits(u128::from_be_bytes(cid_data));
        let name = bits.product_name().to_be_bytes();

        Cid {
            manufacturer_id: bits.manufacturer_id(),
            oem_id: bits.oem_id().to_be_bytes(),
            product_name: [name[3], name[4], name[5], name[6], name[7]],
            product_revision: bits.product_revision(),
            serial_number: bits.serial_number(),
            manufacturing_year: bits.manufacturing_year(),
            manufacturing_month: bits.manufacturing_month(),
            crc: bits.crc(),
        }
    }
}
