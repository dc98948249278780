//! Chip introspection: type, revision, feature bits, and MAC address
//! decoded from efuse words and one APB register.

use strum::Display;

use crate::connection::Connection;
use crate::error::Error;
use crate::interface::Channel;

/// Register holding bit 2 of the chip revision.
const APB_CTL_DATE_REG: u32 = 0x3FF6_607C;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ChipType {
    #[strum(serialize = "ESP32-D0WDQ6")]
    D0WDQ6,
    #[strum(serialize = "ESP32-D0WDQ5")]
    D0WDQ5,
    #[strum(serialize = "ESP32-D2WDQ5")]
    D2WDQ5,
    #[strum(serialize = "ESP32-PICO-D4")]
    PicoD4,
    #[strum(serialize = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CodingScheme {
    None,
    #[strum(serialize = "3/4")]
    ThreeQuarters,
    Repeat,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Feature {
    #[strum(serialize = "WiFi")]
    Wifi,
    #[strum(serialize = "Bluetooth")]
    Bluetooth,
    #[strum(serialize = "Single Core")]
    SingleCore,
    #[strum(serialize = "Dual Core")]
    DualCore,
    #[strum(serialize = "160MHz")]
    Clock160MHz,
    #[strum(serialize = "240MHz")]
    Clock240MHz,
    #[strum(serialize = "Embedded Flash")]
    EmbeddedFlash,
    #[strum(serialize = "VRef calibration in efuse")]
    VRefCalInEfuse,
    #[strum(serialize = "BLK3 partially reserved")]
    Blk3Reserved,
}

#[derive(Debug, Clone)]
pub struct ChipDescription {
    pub chip_type: ChipType,
    pub revision: u8,
}

#[derive(Debug, Clone)]
pub struct ChipInfo {
    pub description: ChipDescription,
    pub features: Vec<Feature>,
    pub coding_scheme: CodingScheme,
    pub mac: [u8; 6],
}

/// Read the six efuse words (1..=6) and the revision register needed to
/// decode chip identity, then assemble a full `ChipInfo`.
pub fn read_chip_info<C: Channel>(conn: &mut Connection<C>) -> Result<ChipInfo, Error> {
    let mut efuse = [0u32; 7];
    for (i, slot) in efuse.iter_mut().enumerate().skip(1) {
        *slot = conn.read_efuse(i as u32)?;
    }
    let apb_reg = conn.read_reg(APB_CTL_DATE_REG)?;

    Ok(ChipInfo {
        description: chip_description(&efuse, apb_reg),
        features: features(&efuse),
        coding_scheme: coding_scheme(&efuse),
        mac: mac_address(&efuse),
    })
}

fn byte(word: u32, index: u32) -> u8 {
    ((word >> (index * 8)) & 0xFF) as u8
}

fn chip_description(efuse: &[u32; 7], apb_reg: u32) -> ChipDescription {
    let efuse3_byte1 = byte(efuse[3], 1);
    let chip_type = match (efuse3_byte1 >> 1) & 0x07 {
        0 => ChipType::D0WDQ6,
        1 => ChipType::D0WDQ5,
        2 => ChipType::D2WDQ5,
        5 => ChipType::PicoD4,
        _ => ChipType::Unknown,
    };

    let bit0 = (efuse3_byte1 >> 7) & 1;
    let bit1 = (byte(efuse[5], 2) >> 4) & 1;
    let bit2 = (byte(apb_reg, 3) >> 7) & 1;

    let revision = if bit0 == 0 {
        0
    } else if bit1 == 0 {
        1
    } else if bit2 == 0 {
        2
    } else {
        3
    };

    ChipDescription {
        chip_type,
        revision,
    }
}

fn features(efuse: &[u32; 7]) -> Vec<Feature> {
    let mut out = vec![Feature::Wifi];

    let efuse3_byte0 = byte(efuse[3], 0);
    let efuse3_byte1 = byte(efuse[3], 1);
    let efuse4_byte1 = byte(efuse[4], 1);

    if efuse3_byte0 & 0x02 == 0 {
        out.push(Feature::Bluetooth);
    }

    if efuse3_byte0 & 0x01 == 1 {
        out.push(Feature::DualCore);
    } else {
        out.push(Feature::SingleCore);
    }

    if efuse3_byte1 & 0x20 != 0 {
        if efuse3_byte1 & 0x10 != 0 {
            out.push(Feature::Clock160MHz);
        } else {
            out.push(Feature::Clock240MHz);
        }
    }

    let pkg_version = (efuse3_byte1 >> 1) & 0x07;
    if matches!(pkg_version, 2 | 4 | 5) {
        out.push(Feature::EmbeddedFlash);
    }

    if efuse4_byte1 & 0x1F != 0 {
        out.push(Feature::VRefCalInEfuse);
    }
    if (efuse4_byte1 >> 6) & 1 != 0 {
        out.push(Feature::Blk3Reserved);
    }

    out
}

fn coding_scheme(efuse: &[u32; 7]) -> CodingScheme {
    match byte(efuse[6], 0) & 0x03 {
        0 => CodingScheme::None,
        1 => CodingScheme::ThreeQuarters,
        2 => CodingScheme::Repeat,
        _ => CodingScheme::Invalid,
    }
}

fn mac_address(efuse: &[u32; 7]) -> [u8; 6] {
    [
        byte(efuse[2], 1),
        byte(efuse[2], 0),
        byte(efuse[1], 3),
        byte(efuse[1], 2),
        byte(efuse[1], 1),
        byte(efuse[1], 0),
    ]
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
