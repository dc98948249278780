//! Flash transfer controller: chunked reads, and chunked writes with an
//! optional zlib-compressed path.

use std::thread::sleep;
use std::time::Duration;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write as _;

use crate::command::Command;
use crate::connection::Connection;
use crate::error::Error;
use crate::interface::Channel;

/// ROM-imposed maximum length of a single ReadFlash response chunk.
const READ_BLOCK_MAX: usize = 64;
/// Fixed block size used for all flash writes, compressed or not.
const WRITE_BLOCK_SIZE: u32 = 0x400;
const POST_ERASE_SETTLE: Duration = Duration::from_millis(10);

/// Read `size` bytes of flash starting at `offset`, chunked into
/// `READ_BLOCK_MAX`-byte ReadFlash requests.
pub fn read<C: Channel>(conn: &mut Connection<C>, offset: u32, size: u32) -> Result<Vec<u8>, Error> {
    conn.attach_flash()?;

    let mut out = Vec::with_capacity(size as usize);
    let mut received: u32 = 0;

    while received < size {
        let remaining = size - received;
        let chunk = remaining.min(READ_BLOCK_MAX as u32);
        let response = conn.command(Command::ReadFlash {
            offset: offset + received,
            size: chunk,
        })?;
        let take = (chunk as usize).min(response.payload.len());
        out.extend_from_slice(&response.payload[..take]);
        received += chunk;
    }

    Ok(out)
}

/// Write `data` to flash at `offset`. When `compress` is set, the payload
/// is deflated and the compressed path is used (no terminal FlashEnd, so
/// the chip stays attached); otherwise the uncompressed path pads the
/// final block with `0xFF` and emits a terminal FlashEnd.
pub fn write<C: Channel>(
    conn: &mut Connection<C>,
    offset: u32,
    data: &[u8],
    compress: bool,
) -> Result<(), Error> {
    conn.attach_flash()?;

    if compress {
        write_compressed(conn, offset, data)
    } else {
        write_uncompressed(conn, offset, data)
    }
}

fn write_uncompressed<C: Channel>(
    conn: &mut Connection<C>,
    offset: u32,
    data: &[u8],
) -> Result<(), Error> {
    let erase_size = data.len() as u32;
    let num_blocks = (data.len() as u32).div_ceil(WRITE_BLOCK_SIZE);

    conn.command(Command::FlashBegin {
        erase_size,
        num_blocks,
        block_size: WRITE_BLOCK_SIZE,
        offset,
    })?;
    sleep(POST_ERASE_SETTLE);

    for (sequence, block) in data.chunks(WRITE_BLOCK_SIZE as usize).enumerate() {
        conn.command(Command::FlashData {
            data: block,
            sequence: sequence as u32,
            pad_to: WRITE_BLOCK_SIZE as usize,
            pad_byte: 0xFF,
        })?;
    }

    conn.command(Command::FlashEnd { reboot: true })?;
    Ok(())
}

fn write_compressed<C: Channel>(
    conn: &mut Connection<C>,
    offset: u32,
    data: &[u8],
) -> Result<(), Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    let erase_size = data.len() as u32;
    let num_blocks = (compressed.len() as u32).div_ceil(WRITE_BLOCK_SIZE);

    conn.command(Command::FlashDeflBegin {
        erase_size,
        num_blocks,
        block_size: WRITE_BLOCK_SIZE,
        offset,
    })?;
    sleep(POST_ERASE_SETTLE);

    for (sequence, block) in compressed.chunks(WRITE_BLOCK_SIZE as usize).enumerate() {
        conn.command(Command::FlashDeflData {
            data: block,
            sequence: sequence as u32,
        })?;
    }

    // intentionally no FlashEnd: the compressed path leaves the chip attached
    Ok(())
}
