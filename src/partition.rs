//! Partition table codec: binary (32-byte records + MD5 trailer) and CSV
//! (symbolic/numeric type+subtype, k/m suffixes, offset auto-layout).

use std::io::Write as _;

use md5::{Digest, Md5};
use regex::Regex;

use crate::error::CodecError;

const RECORD_SIZE: usize = 32;
const MAX_TABLE_SIZE: usize = 0xC00;
const TABLE_REGION_END: u32 = 0x9000;
const APP_ALIGN: u32 = 0x10000;
const DATA_ALIGN: u32 = 4;

const ENTRY_MAGIC: [u8; 2] = [0xAA, 0x50];
const SENTINEL_MAGIC: [u8; 2] = [0xEB, 0xEB];

/// Partition type: application or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    App,
    Data,
}

impl Type {
    fn as_u8(self) -> u8 {
        match self {
            Type::App => 0x00,
            Type::Data => 0x01,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Type::Data,
            _ => Type::App,
        }
    }
}

/// One partition table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub ty: Type,
    pub subtype: u8,
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

impl Partition {
    fn write_record<W: std::io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&ENTRY_MAGIC)?;
        writer.write_all(&[self.ty.as_u8(), self.subtype])?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;

        let mut name_bytes = [0u8; 16];
        for (dst, src) in name_bytes.iter_mut().zip(self.name.bytes().take(16)) {
            *dst = src;
        }
        writer.write_all(&name_bytes)?;
        writer.write_all(&self.flags.to_le_bytes())?;
        Ok(())
    }

    fn from_record(index: usize, record: &[u8]) -> Result<Self, CodecError> {
        if record.len() != RECORD_SIZE || record[0..2] != ENTRY_MAGIC {
            return Err(CodecError::BadMagic(index));
        }
        let ty = Type::from_u8(record[2]);
        let subtype = record[3];
        let offset = u32::from_le_bytes(record[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(record[8..12].try_into().unwrap());
        let name_bytes = &record[12..28];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
        let flags = u32::from_le_bytes(record[28..32].try_into().unwrap());

        Ok(Partition {
            name,
            ty,
            subtype,
            offset,
            size,
            flags,
        })
    }
}

/// An ordered collection of partitions, plus the codec operations.
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    /// Parse a binary partition table: a run of 32-byte entry records
    /// terminated by a sentinel record carrying an MD5 digest of all
    /// preceding bytes, verified on read.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut partitions = Vec::new();
        let mut hasher = Md5::new();
        let mut index = 0;

        loop {
            let start = index * RECORD_SIZE;
            if start + RECORD_SIZE > bytes.len() {
                return Err(CodecError::BadMagic(index));
            }
            let record = &bytes[start..start + RECORD_SIZE];

            if record[0..2] == SENTINEL_MAGIC {
                let digest = &record[16..32];
                let computed = hasher.finalize();
                if digest != computed.as_slice() {
                    return Err(CodecError::DigestMismatch {
                        expected: hex(digest),
                        computed: hex(&computed),
                    });
                }
                break;
            }

            hasher.update(record);
            partitions.push(Partition::from_record(index, record)?);
            index += 1;
        }

        Ok(PartitionTable::new(partitions))
    }

    /// Serialize to the fixed-size binary layout: entries, sentinel + MD5,
    /// then `0xFF` padding out to exactly `0xC00` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut hasher = Md5::new();
        let mut body = Vec::with_capacity(self.partitions.len() * RECORD_SIZE);

        for partition in &self.partitions {
            let mut record = Vec::with_capacity(RECORD_SIZE);
            partition.write_record(&mut record)?;
            hasher.update(&record);
            body.extend_from_slice(&record);
        }

        let digest = hasher.finalize();
        body.extend_from_slice(&SENTINEL_MAGIC);
        body.extend_from_slice(&[0xFFu8; 14]);
        body.extend_from_slice(&digest);

        if body.len() > MAX_TABLE_SIZE {
            return Err(CodecError::TableTooLarge(body.len()));
        }
        body.resize(MAX_TABLE_SIZE, 0xFF);
        Ok(body)
    }

    /// Parse a CSV partition table (`name,type,subtype,offset,size,flags`
    /// rows), applying auto-layout for blank offsets.
    pub fn from_csv(text: &str) -> Result<Self, CodecError> {
        let mut partitions = Vec::new();
        let mut last_end: u32 = TABLE_REGION_END;

        for (row_index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 5 {
                return Err(CodecError::CsvRow(
                    row_index,
                    "expected at least 5 comma-separated fields".to_string(),
                ));
            }

            let name = expand_env(fields[0]);
            let ty = parse_type(fields[1])?;
            let subtype = parse_subtype(ty, fields[2])?;
            let offset_field = fields[3];
            let raw_size = parse_signed_number(fields[4])
                .map_err(|e| CodecError::CsvRow(row_index, e.to_string()))?;
            let flags = fields
                .get(5)
                .filter(|f| !f.is_empty())
                .map(|f| parse_number(f))
                .transpose()
                .map_err(|e| CodecError::CsvRow(row_index, e.to_string()))?
                .unwrap_or(0);

            let align = match ty {
                Type::App => APP_ALIGN,
                Type::Data => DATA_ALIGN,
            };

            let offset = if offset_field.is_empty() {
                let rem = last_end % align;
                let pad = if rem == 0 { 0 } else { align - rem };
                last_end + pad
            } else {
                let explicit = parse_number(offset_field)
                    .map_err(|e| CodecError::CsvRow(row_index, e.to_string()))?;
                if explicit < last_end {
                    return Err(CodecError::Overlap(name, explicit));
                }
                explicit
            };

            // negative-size "remaining capacity" quirk, preserved from the
            // distilled specification: size = -size - offset.
            let size = if raw_size < 0 {
                ((-raw_size) as u32).wrapping_sub(offset)
            } else {
                raw_size as u32
            };

            last_end = offset + size;

            partitions.push(Partition {
                name,
                ty,
                subtype,
                offset,
                size,
                flags,
            });
        }

        Ok(PartitionTable::new(partitions))
    }

    /// Render back to the CSV format.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("# Name,   Type, SubType, Offset,   Size, Flags\n");
        for p in &self.partitions {
            out.push_str(&format!(
                "{},{},{:#04x},{:#x},{:#x},{:#x}\n",
                p.name,
                match p.ty {
                    Type::App => "app",
                    Type::Data => "data",
                },
                p.subtype,
                p.offset,
                p.size,
                p.flags
            ));
        }
        out
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn expand_env(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find('}') {
            let var = &after[..end];
            if let Ok(value) = std::env::var(var) {
                out.push_str(&value);
            }
            rest = &after[end + 1..];
        } else {
            out.push_str("${");
            rest = after;
            break;
        }
    }
    out.push_str(rest);
    out
}

fn parse_type(field: &str) -> Result<Type, CodecError> {
    match field.to_lowercase().as_str() {
        "app" => Ok(Type::App),
        "data" => Ok(Type::Data),
        other => match parse_number(other) {
            Ok(0) => Ok(Type::App),
            Ok(1) => Ok(Type::Data),
            _ => Err(CodecError::BadTypeLiteral(field.to_string())),
        },
    }
}

fn parse_subtype(ty: Type, field: &str) -> Result<u8, CodecError> {
    let lower = field.to_lowercase();
    let named = match (ty, lower.as_str()) {
        (Type::App, "factory") => Some(0x00),
        (Type::App, "test") => Some(0x20),
        (Type::App, name) if name.starts_with("ota") => {
            name.trim_start_matches("ota").trim_start_matches('_').parse::<u8>().ok().map(|n| 0x10 + n)
        }
        (Type::Data, "ota") => Some(0x00),
        (Type::Data, "phy") => Some(0x01),
        (Type::Data, "nvs") => Some(0x02),
        (Type::Data, "coredump") => Some(0x03),
        (Type::Data, "nvs_keys") => Some(0x04),
        (Type::Data, "efuse") => Some(0x05),
        (Type::Data, "esphttpd") => Some(0x80),
        (Type::Data, "fat") => Some(0x81),
        (Type::Data, "spiffs") => Some(0x82),
        _ => None,
    };

    if let Some(value) = named {
        return Ok(value);
    }
    parse_number(field)
        .map(|v| v as u8)
        .map_err(|_| CodecError::BadTypeLiteral(field.to_string()))
}

fn parse_signed_number(field: &str) -> Result<i64, CodecError> {
    let field = field.trim();
    if let Some(rest) = field.strip_prefix('-') {
        return parse_number(rest).map(|v| -(v as i64));
    }
    parse_number(field).map(|v| v as i64)
}

fn parse_number(field: &str) -> Result<u32, CodecError> {
    let field = field.trim();
    if let Some(hex) = field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16)
            .map_err(|_| CodecError::BadNumberLiteral(field.to_string()));
    }
    if let Ok(value) = field.parse::<u32>() {
        return Ok(value);
    }
    let re = Regex::new(r"(?i)^(\d+)([km])$").unwrap();
    if let Some(caps) = re.captures(field) {
        let digits: u32 = caps[1].parse().unwrap();
        let multiplier = match caps[2].to_lowercase().as_str() {
            "k" => 1024,
            "m" => 1024 * 1024,
            _ => unreachable!(),
        };
        return Ok(digits * multiplier);
    }
    Err(CodecError::BadNumberLiteral(field.to_string()))
}
