//! SLIP (Serial Line Internet Protocol) byte-stuffing framing.
//!
//! Frames are delimited by `0xC0`; within a frame, `0xC0` and `0xDB` are
//! escaped as `0xDB 0xDC` and `0xDB 0xDD` respectively.

use std::io::{self, Read, Write};
use std::time::Instant;

use crate::error::{ConnectionError, Error};

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Frame `data` between two `0xC0` delimiters, escaping `0xC0`/`0xDB` bytes
/// in the body.
pub fn encode<W: Write>(mut writer: W, data: &[u8]) -> io::Result<()> {
    writer.write_all(&[END])?;
    for &byte in data {
        match byte {
            END => writer.write_all(&[ESC, ESC_END])?,
            ESC => writer.write_all(&[ESC, ESC_ESC])?,
            other => writer.write_all(&[other])?,
        }
    }
    writer.write_all(&[END])?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForDelimiter,
    Reading,
    Escape,
}

/// Pull-based SLIP deframer. Discards any bytes preceding the first `0xC0`
/// and returns the body of the next complete frame once the closing `0xC0`
/// is seen. State persists across calls so a frame may be read across
/// multiple underlying reads.
#[derive(Debug)]
pub struct SlipDecoder {
    state: State,
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self {
            state: State::WaitForDelimiter,
        }
    }

    /// Read a single complete frame from `source`, failing with
    /// `ConnectionError::Timeout` if `deadline` passes before one arrives.
    pub fn decode<R: Read>(
        &mut self,
        source: &mut R,
        deadline: Instant,
    ) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            if Instant::now() >= deadline {
                return Err(Error::Connection(ConnectionError::Timeout(
                    Default::default(),
                )));
            }

            match source.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::from(e)),
            }
            let value = byte[0];

            match self.state {
                State::WaitForDelimiter => {
                    if value == END {
                        self.state = State::Reading;
                    }
                    // any other byte before the first delimiter is discarded
                }
                State::Reading => match value {
                    END => {
                        if out.is_empty() {
                            // a bare second delimiter before any body bytes;
                            // keep waiting for real content
                            continue;
                        }
                        self.state = State::WaitForDelimiter;
                        return Ok(out);
                    }
                    ESC => self.state = State::Escape,
                    other => out.push(other),
                },
                State::Escape => match value {
                    ESC_END => {
                        out.push(END);
                        self.state = State::Reading;
                    }
                    ESC_ESC => {
                        out.push(ESC);
                        self.state = State::Reading;
                    }
                    _ => {
                        self.state = State::WaitForDelimiter;
                        return Err(Error::Connection(ConnectionError::Framing));
                    }
                },
            }
        }
    }
}
