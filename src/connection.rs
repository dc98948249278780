//! The ROM protocol engine: reset sequence, sync handshake, command
//! execution with retries and opcode matching, baud renegotiation, and
//! register/efuse reads.

use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::command::{Command, CommandType, Response};
use crate::error::{ConnectionError, Error, ResultExt};
use crate::interface::Channel;
use crate::slip::{self, SlipDecoder};

/// Base address of the efuse block; word `i` lives at `EFUSE_BASE + 4*i`.
pub const EFUSE_BASE: u32 = 0x6001_A000;

const RESET_DTR_HIGH_DELAY: Duration = Duration::from_millis(100);
const RESET_SETTLE_DELAY: Duration = Duration::from_millis(5);
const BAUD_CHANGE_SETTLE_DELAY: Duration = Duration::from_millis(10);
const SYNC_FRAME_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Inner loop bound on discarding stray/mismatched response frames for a
/// single outgoing command.
const OPCODE_MATCH_ATTEMPTS: usize = 16;
/// Outer retry bound for a checked command execution.
const DEFAULT_COMMAND_RETRIES: usize = 3;
/// Retry bound for the sync handshake.
const DEFAULT_SYNC_RETRIES: usize = 5;

/// An established connection to the ROM bootloader.
pub struct Connection<C: Channel> {
    iface: C,
    decoder: SlipDecoder,
    flash_attached: bool,
}

impl<C: Channel> Connection<C> {
    pub fn new(iface: C) -> Self {
        Self {
            iface,
            decoder: SlipDecoder::new(),
            flash_attached: false,
        }
    }

    /// DTR/RTS reset-to-download sequence: hold reset, assert download
    /// mode, release reset.
    pub fn reset(&mut self) -> Result<(), Error> {
        debug!("resetting device into download mode");
        self.iface.set_dtr(false)?; // IO0 = HIGH
        self.iface.set_rts(true)?; // EN = LOW, chip in reset
        sleep(RESET_DTR_HIGH_DELAY);

        self.iface.set_dtr(true)?; // IO0 = LOW, download mode
        self.iface.set_rts(false)?; // EN = HIGH, chip out of reset
        sleep(RESET_SETTLE_DELAY);

        Ok(())
    }

    /// Reset, flush, then retry the sync handshake up to `retries` times.
    pub fn connect(&mut self, retries: usize) -> Result<(), Error> {
        self.reset()?;
        self.iface.flush()?;

        for attempt in 0..retries.max(1) {
            match self.sync() {
                Ok(()) => {
                    info!("synced with device after {} attempt(s)", attempt + 1);
                    return Ok(());
                }
                Err(e) => {
                    debug!("sync attempt {} failed: {e}", attempt + 1);
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Issue a single Sync command and wait for a successful reply.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(SYNC_FRAME_TIMEOUT, |conn| {
            let response = conn.execute_command(Command::Sync)?;
            if response.is_success() {
                Ok(())
            } else {
                Err(Error::Connection(ConnectionError::OpcodeMismatch))
            }
        })
    }

    /// Write `command`, then read frames (discarding opcode mismatches) up
    /// to `OPCODE_MATCH_ATTEMPTS` times before giving up.
    fn execute_command(&mut self, command: Command<'_>) -> Result<Response, Error> {
        let ty = command.command_type();

        let mut framed = Vec::new();
        let mut body = Vec::new();
        command.write(&mut body)?;
        slip::encode(&mut framed, &body)?;

        self.iface.write_all(&framed).for_command(ty)?;

        let deadline = Instant::now() + ty_timeout(ty);
        for _ in 0..OPCODE_MATCH_ATTEMPTS {
            let frame = self.decoder.decode(&mut self.iface, deadline).for_command(ty)?;
            let response = Response::parse(&frame)?;
            if response.opcode == ty as u8 {
                return Ok(response);
            }
            debug!("discarding stray response for opcode {:#x}", response.opcode);
        }

        Err(Error::Connection(ConnectionError::OpcodeMismatch))
    }

    /// Execute `command`, retrying up to `DEFAULT_COMMAND_RETRIES` times on
    /// transport failure or a non-success status.
    pub fn command(&mut self, command: Command<'_>) -> Result<Response, Error> {
        let ty = command.command_type();
        let mut last_err = None;

        for attempt in 0..DEFAULT_COMMAND_RETRIES {
            match self.execute_command(command) {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => {
                    warn!(
                        "{ty} attempt {} returned bootloader error {:#x}",
                        attempt + 1,
                        response.error
                    );
                    last_err = Some(Error::Rom(crate::error::RomError::new(
                        ty,
                        response.error.into(),
                    )));
                }
                Err(e) => {
                    warn!("{ty} attempt {} failed: {e}", attempt + 1);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(Error::Connection(ConnectionError::ConnectionFailed)))
    }

    /// Run `f` with the channel's read timeout temporarily set to `timeout`.
    pub fn with_timeout<T>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Connection<C>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.iface.set_timeout(timeout)?;
        let result = f(self);
        self.iface.set_timeout(DEFAULT_COMMAND_TIMEOUT).ok();
        result
    }

    /// Renegotiate the channel baud rate: ChangeBaudrate, reconfigure the
    /// local port, settle, flush.
    pub fn change_baud(&mut self, new_baud: u32, prior_baud: u32) -> Result<(), Error> {
        debug!("changing baud rate from {prior_baud} to {new_baud}");
        self.command(Command::ChangeBaudrate {
            new_baud,
            prior_baud,
        })?;
        self.iface.set_baud(new_baud)?;
        sleep(BAUD_CHANGE_SETTLE_DELAY);
        self.iface.flush()?;
        debug!("baud rate changed to {new_baud}");
        Ok(())
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        let response = self.command(Command::ReadReg { address })?;
        Ok(response.value)
    }

    pub fn read_efuse(&mut self, index: u32) -> Result<u32, Error> {
        self.read_reg(EFUSE_BASE + 4 * index)
    }

    /// Attach to the SPI flash, idempotently: only the first call in a
    /// session emits the command.
    pub fn attach_flash(&mut self) -> Result<(), Error> {
        if self.flash_attached {
            return Ok(());
        }
        self.command(Command::SpiAttachFlash)?;
        self.flash_attached = true;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.iface.flush()
    }

    /// Access the underlying channel directly. Intended for advanced
    /// embedders and for driving the protocol engine against a fake
    /// channel in tests; core operations never need this themselves.
    pub fn iface_mut(&mut self) -> &mut C {
        &mut self.iface
    }

    pub fn decoder_mut(&mut self) -> &mut SlipDecoder {
        &mut self.decoder
    }
}

fn ty_timeout(ty: CommandType) -> Duration {
    match ty {
        CommandType::Sync => SYNC_FRAME_TIMEOUT,
        CommandType::FlashBegin | CommandType::FlashDeflBegin => Duration::from_secs(10),
        _ => DEFAULT_COMMAND_TIMEOUT,
    }
}
