//! Wire-level command construction and response parsing.
//!
//! Every command is an 8-byte little-endian header (direction, opcode,
//! payload length, checksum) followed by a payload. Every response mirrors
//! the header, substituting a "value" field for the checksum, followed by
//! a payload and a two-byte status trailer `{status, error_code}`.

use std::io::{self, Write};

use strum::Display;

use crate::error::{ConnectionError, Error};

/// Initial checksum state; XORed with every payload data byte of
/// Flash{Data,DeflData} commands.
const CHECKSUM_INIT: u8 = 0xEF;

/// Fixed SYNC payload: `07 07 12 20` followed by 32 bytes of `0x55`.
const SYNC_FRAME: [u8; 36] = {
    let mut frame = [0x55u8; 36];
    frame[0] = 0x07;
    frame[1] = 0x07;
    frame[2] = 0x12;
    frame[3] = 0x20;
    frame
};

/// Compute the Flash-Data checksum over `data`, starting from `CHECKSUM_INIT`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut check = CHECKSUM_INIT;
    for &byte in data {
        check ^= byte;
    }
    check as u32
}

/// Opcode identifiers. Stub-loader-only opcodes are included so the enum
/// mirrors the full reserved wire space, but this crate never constructs a
/// `Command` variant that would emit them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, strum::FromRepr)]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiSetParams = 0x0B,
    SpiAttachFlash = 0x0D,
    ReadFlash = 0x0E,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    SpiFlashMd5 = 0x13,
    // stub-loader only; reserved, never emitted by this crate
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
    ReadFlashFast = 0xD2,
    RunUserCode = 0xD3,
}

/// A request to be serialized onto the wire.
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        erase_size: u32,
        num_blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
        pad_to: usize,
        pad_byte: u8,
    },
    FlashEnd {
        reboot: bool,
    },
    FlashDeflBegin {
        erase_size: u32,
        num_blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiAttachFlash,
    ChangeBaudrate {
        new_baud: u32,
        prior_baud: u32,
    },
    ReadFlash {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiAttachFlash => CommandType::SpiAttachFlash,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::ReadFlash { .. } => CommandType::ReadFlash,
        }
    }

    /// Serialize the 8-byte header plus payload onto `writer`.
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&[0x00, self.command_type() as u8])?;

        match *self {
            Command::FlashBegin {
                erase_size,
                num_blocks,
                block_size,
                offset,
            }
            | Command::FlashDeflBegin {
                erase_size,
                num_blocks,
                block_size,
                offset,
            } => {
                let mut payload = Vec::with_capacity(16);
                payload.extend_from_slice(&erase_size.to_le_bytes());
                payload.extend_from_slice(&num_blocks.to_le_bytes());
                payload.extend_from_slice(&block_size.to_le_bytes());
                payload.extend_from_slice(&offset.to_le_bytes());
                write_payload(writer, &payload, 0)
            }
            Command::FlashData {
                data,
                sequence,
                pad_to,
                pad_byte,
            } => data_command(writer, data, sequence, pad_to, pad_byte),
            Command::FlashDeflData { data, sequence } => {
                data_command(&mut writer, data, sequence, 0, 0)
            }
            Command::FlashEnd { reboot } => write_payload(writer, &[u8::from(!reboot)], 0),
            Command::Sync => write_payload(writer, &SYNC_FRAME, 0),
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                let mut payload = Vec::with_capacity(16);
                payload.extend_from_slice(&address.to_le_bytes());
                payload.extend_from_slice(&value.to_le_bytes());
                payload.extend_from_slice(&mask.unwrap_or(0xFFFF_FFFF).to_le_bytes());
                payload.extend_from_slice(&0u32.to_le_bytes());
                write_payload(writer, &payload, 0)
            }
            Command::ReadReg { address } => write_payload(writer, &address.to_le_bytes(), 0),
            Command::SpiAttachFlash => write_payload(writer, &[0u8; 8], 0),
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&new_baud.to_le_bytes());
                payload.extend_from_slice(&prior_baud.to_le_bytes());
                write_payload(writer, &payload, 0)
            }
            Command::ReadFlash { offset, size } => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&size.to_le_bytes());
                write_payload(writer, &payload, 0)
            }
        }
    }
}

fn write_payload<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)
}

fn data_command<W: Write>(
    mut writer: W,
    data: &[u8],
    sequence: u32,
    pad_to: usize,
    pad_byte: u8,
) -> io::Result<()> {
    let pad_len = pad_to.saturating_sub(data.len());
    let total_len = data.len() + pad_len;

    let mut payload = Vec::with_capacity(16 + total_len);
    payload.extend_from_slice(&(total_len as u32).to_le_bytes());
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(data);
    payload.extend(std::iter::repeat(pad_byte).take(pad_len));

    let mut padded_data = data.to_vec();
    padded_data.extend(std::iter::repeat(pad_byte).take(pad_len));
    let check = checksum(&padded_data);

    writer.write_all(&(payload.len() as u16).to_le_bytes())?;
    writer.write_all(&check.to_le_bytes())?;
    writer.write_all(&payload)
}

/// A response parsed from a single SLIP-deframed buffer.
#[derive(Debug, Clone)]
pub struct Response {
    pub opcode: u8,
    pub value: u32,
    pub payload: Vec<u8>,
    pub status: u8,
    pub error: u8,
}

impl Response {
    /// Parse a deframed buffer. Must be at least 10 bytes: 8-byte header
    /// plus a 2-byte status trailer.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 10 {
            return Err(Error::Connection(ConnectionError::ShortResponse(
                buf.len(),
            )));
        }

        let opcode = buf[1];
        let value = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let payload = buf[8..buf.len() - 2].to_vec();
        let status = buf[buf.len() - 2];
        let error = buf[buf.len() - 1];

        Ok(Response {
            opcode,
            value,
            payload,
            status,
            error,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_xor() {
        let data = [0x01, 0x02, 0x03];
        assert_eq!(checksum(&data), (0xEFu8 ^ 0x01 ^ 0x02 ^ 0x03) as u32);
        assert_eq!(checksum(&[]), 0xEF);
    }

    #[test]
    fn sync_frame_layout() {
        assert_eq!(&SYNC_FRAME[0..4], &[0x07, 0x07, 0x12, 0x20]);
        assert!(SYNC_FRAME[4..].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn flash_begin_header_fields() {
        let cmd = Command::FlashBegin {
            erase_size: 100,
            num_blocks: 1,
            block_size: 1024,
            offset: 0x1000,
        };
        let mut buf = Vec::new();
        cmd.write(&mut buf).unwrap();
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[1], CommandType::FlashBegin as u8);
        let len = u16::from_le_bytes([buf[2], buf[3]]);
        assert_eq!(len, 16);
        let checksum = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(checksum, 0);
    }

    #[test]
    fn response_parse_rejects_short_buffers() {
        assert!(Response::parse(&[0u8; 9]).is_err());
    }

    #[test]
    fn response_parse_splits_payload_and_trailer() {
        let mut buf = vec![0x01, 0x08, 0, 0, 0, 0, 0, 0];
        buf.extend_from_slice(&[0xAA, 0xBB]);
        buf.extend_from_slice(&[0x00, 0x00]);
        let resp = Response::parse(&buf).unwrap();
        assert_eq!(resp.opcode, 0x08);
        assert_eq!(resp.payload, vec![0xAA, 0xBB]);
        assert!(resp.is_success());
    }
}
