//! Serial port wrapper isolating the platform-specific `serialport` types
//! from the rest of the crate.

use std::io::Read;
use std::time::Duration;

use crate::error::Error;

/// The serial-channel contract the protocol engine is written against:
/// open/close is handled by the implementor's constructor, modem lines and
/// baud rate are independently controllable, and reads go through
/// `std::io::Read`. `Interface` implements this against a real OS serial
/// port; tests implement it against an in-memory fake.
pub trait Channel: Read {
    fn set_dtr(&mut self, level: bool) -> Result<(), Error>;
    fn set_rts(&mut self, level: bool) -> Result<(), Error>;
    fn set_baud(&mut self, baud: u32) -> Result<(), Error>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;
    fn flush(&mut self) -> Result<(), Error>;
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;
}

#[cfg(unix)]
type Port = serialport::TTYPort;
#[cfg(windows)]
type Port = serialport::COMPort;

/// A bidirectional serial channel with independently controllable modem
/// lines, matching the contract the protocol engine is written against.
pub struct Interface {
    port: Port,
}

impl Interface {
    /// Open `path` at `baud`, 8-N-1, no flow control.
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self, Error> {
        let port = serialport::new(path, baud)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open_native()?;
        Ok(Self { port })
    }
}

impl Read for Interface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Channel for Interface {
    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.port.write_request_to_send(level)?;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.port.flush()?;
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        use std::io::Write;
        self.port.write_all(data)?;
        Ok(())
    }
}
