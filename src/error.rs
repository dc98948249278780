//! Error taxonomy for the protocol engine, codecs, and CLI.

use std::io;

#[cfg(feature = "cli")]
use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

/// Top-level error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
#[cfg_attr(feature = "cli", derive(Diagnostic))]
#[non_exhaustive]
pub enum Error {
    #[error("error while connecting to device")]
    #[cfg_attr(feature = "cli", diagnostic(transparent))]
    Connection(#[source] ConnectionError),

    #[error("the bootloader returned an error")]
    #[cfg_attr(feature = "cli", diagnostic(transparent))]
    Rom(#[from] RomError),

    #[error("failed to decode partition table")]
    #[cfg_attr(feature = "cli", diagnostic(transparent))]
    Codec(#[from] CodecError),

    #[error("unsupported baud rate {0}")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::unsupported_baud)))]
    UnsupportedBaud(u32),

    #[error("read more bytes than requested: wanted {wanted}, got {got}")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::read_overrun)))]
    ReadOverrun { wanted: usize, got: usize },

    #[error("sequence number out of order: expected {expected}, got {got}")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::out_of_order)))]
    OutOfOrderSequence { expected: u32, got: u32 },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Errors occurring at the transport/framing layer.
#[derive(Debug, Error)]
#[cfg_attr(feature = "cli", derive(Diagnostic))]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("failed to connect to the device")]
    #[cfg_attr(feature = "cli", diagnostic(
        code(esp32_rom_tool::connection_failed),
        help("make sure the device is connected and nothing else is holding the reset/boot pins")
    ))]
    ConnectionFailed,

    #[error("timed out waiting for a response{0}")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::timeout)))]
    Timeout(TimedOutCommand),

    #[error("received packet has invalid SLIP framing")]
    #[cfg_attr(feature = "cli", diagnostic(
        code(esp32_rom_tool::framing),
        help("try resetting the device and retrying; a corrupted ROM can also cause this")
    ))]
    Framing,

    #[error("response too short to contain a header and status trailer")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::short_response)))]
    ShortResponse(usize),

    #[error("opcode mismatch after exhausting retries")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::opcode_mismatch)))]
    OpcodeMismatch,

    #[error("serial I/O error: {0}")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::serial)))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            ConnectionError::Timeout(TimedOutCommand::default())
        } else {
            ConnectionError::Serial(io_to_serialport(err))
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(io::ErrorKind::TimedOut) => {
                ConnectionError::Timeout(TimedOutCommand::default())
            }
            _ => ConnectionError::Serial(err),
        }
    }
}

fn io_to_serialport(err: io::Error) -> serialport::Error {
    serialport::Error::new(serialport::ErrorKind::Io(err.kind()), err.to_string())
}

/// Records which command, if any, was outstanding when a timeout occurred.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimedOutCommand(Option<CommandType>);

impl From<CommandType> for TimedOutCommand {
    fn from(ty: CommandType) -> Self {
        TimedOutCommand(Some(ty))
    }
}

impl std::fmt::Display for TimedOutCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(ty) => write!(f, " ({ty})"),
            None => Ok(()),
        }
    }
}

/// Numeric bootloader status codes, returned in the response status trailer.
#[derive(Clone, Copy, Debug, Default, Error, strum::FromRepr)]
#[cfg_attr(feature = "cli", derive(Diagnostic))]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("invalid message received")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::rom::invalid_message)))]
    InvalidMessage = 0x05,

    #[error("bootloader failed to execute command")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::rom::failed_to_act)))]
    FailedToAct = 0x06,

    #[error("received message has invalid checksum")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::rom::invalid_crc)))]
    InvalidCrc = 0x07,

    #[error("bootloader failed to write to flash")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::rom::flash_write)))]
    FlashWriteError = 0x08,

    #[error("bootloader failed to read from flash")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::rom::flash_read)))]
    FlashReadError = 0x09,

    #[error("invalid length for flash read")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::rom::flash_read_length)))]
    FlashReadLengthError = 0x0a,

    #[error("malformed compressed data received")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::rom::deflate)))]
    DeflateError = 0x0b,

    #[default]
    #[error("unrecognized bootloader error code")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::rom::other)))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error reported by the device's ROM bootloader for a specific command.
#[derive(Clone, Copy, Debug, Error)]
#[cfg_attr(feature = "cli", derive(Diagnostic))]
#[error("error while running {command} command")]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> Self {
        RomError { command, kind }
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

/// Errors from the partition-table binary/CSV codec.
#[derive(Debug, Error)]
#[cfg_attr(feature = "cli", derive(Diagnostic))]
#[non_exhaustive]
pub enum CodecError {
    #[error("partition record at index {0} has an unrecognized leading magic")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::codec::bad_magic)))]
    BadMagic(usize),

    #[error("partition table MD5 mismatch: expected {expected}, computed {computed}")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::codec::digest_mismatch)))]
    DigestMismatch { expected: String, computed: String },

    #[error("serialized partition table of {0} bytes exceeds the maximum of 0xC00")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::codec::table_too_large)))]
    TableTooLarge(usize),

    #[error("row {0}: {1}")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::codec::csv_row)))]
    CsvRow(usize, String),

    #[error("partition '{0}' at offset {1:#x} overlaps the preceding partition")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::codec::overlap)))]
    Overlap(String, u32),

    #[error("unrecognized partition type/subtype literal '{0}'")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::codec::bad_type)))]
    BadTypeLiteral(String),

    #[error("malformed numeric offset/size literal '{0}'")]
    #[cfg_attr(feature = "cli", diagnostic(code(esp32_rom_tool::codec::bad_number)))]
    BadNumberLiteral(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub(crate) trait ResultExt {
    /// Annotate a timeout with the command that was outstanding.
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
