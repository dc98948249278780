//! Integration tests driving the protocol engine through a fake in-memory
//! serial channel, covering sync retry, checked-execute retry exhaustion,
//! chunked read/write block counts, and baud-change sequencing.

use std::collections::VecDeque;
use std::io::Read;
use std::time::Duration;

use esp32_rom_tool::connection::Connection;
use esp32_rom_tool::error::Error;
use esp32_rom_tool::flash;
use esp32_rom_tool::interface::Channel;
use esp32_rom_tool::{command, slip};

/// An in-memory stand-in for a real serial port. `inbox` holds raw bytes
/// the fake device "sends" (already SLIP-framed); `outbox` records
/// everything written to it.
struct FakeChannel {
    inbox: VecDeque<u8>,
    outbox: Vec<u8>,
    baud: u32,
    dtr: Option<bool>,
    rts: Option<bool>,
}

impl FakeChannel {
    fn new() -> Self {
        Self {
            inbox: VecDeque::new(),
            outbox: Vec::new(),
            baud: 115_200,
            dtr: None,
            rts: None,
        }
    }

    /// Queue a successful response frame for `opcode` carrying `value` and
    /// an empty payload.
    fn push_response(&mut self, opcode: u8, value: u32) {
        self.push_response_with_payload(opcode, value, &[]);
    }

    fn push_response_with_payload(&mut self, opcode: u8, value: u32, payload: &[u8]) {
        let mut body = Vec::new();
        body.push(0x01);
        body.push(opcode);
        body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        body.extend_from_slice(&value.to_le_bytes());
        body.extend_from_slice(payload);
        body.push(0x00); // error byte
        body.push(0x00); // status: success

        let mut framed = Vec::new();
        slip::encode(&mut framed, &body).unwrap();
        self.inbox.extend(framed);
    }

    fn push_raw_garbage(&mut self, bytes: &[u8]) {
        self.inbox.extend(bytes.iter().copied());
    }
}

impl Read for FakeChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.inbox.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        }
        let mut n = 0;
        for slot in buf.iter_mut() {
            match self.inbox.pop_front() {
                Some(byte) => {
                    *slot = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Channel for FakeChannel {
    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.dtr = Some(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.rts = Some(level);
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.baud = baud;
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.outbox.extend_from_slice(data);
        Ok(())
    }
}

#[test]
fn sync_succeeds_on_first_clean_response() {
    let mut fake = FakeChannel::new();
    fake.push_response(command::CommandType::Sync as u8, 0);

    let mut conn = Connection::new(fake);
    conn.connect(5).unwrap();
}

#[test]
fn sync_retries_past_stray_garbage_then_succeeds() {
    let mut fake = FakeChannel::new();
    // garbage bytes before any delimiter are simply discarded by the decoder
    fake.push_raw_garbage(&[0x11, 0x22, 0x33]);
    fake.push_response(command::CommandType::Sync as u8, 0);

    let mut conn = Connection::new(fake);
    conn.connect(5).unwrap();
}

#[test]
fn connect_fails_after_exhausting_retries_with_no_data() {
    // one retry is enough to prove the failure path; each attempt spins for
    // the full 1s sync timeout since the fake channel never supplies data.
    let fake = FakeChannel::new();
    let mut conn = Connection::new(fake);
    let err = conn.connect(1).unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
}

#[test]
fn command_retries_exhaust_on_persistent_bootloader_error() {
    let mut fake = FakeChannel::new();
    fake.push_response(command::CommandType::Sync as u8, 0);
    let mut conn = Connection::new(fake);
    conn.connect(5).unwrap();

    // queue three failing ReadReg responses (status non-zero): the checked
    // execute path should retry exactly DEFAULT_COMMAND_RETRIES times.
    for _ in 0..3 {
        let mut body = vec![0x01, command::CommandType::ReadReg as u8, 0, 0, 0, 0, 0, 0];
        body.push(0x07); // error: invalid crc
        body.push(0x01); // status: failure
        let mut framed = Vec::new();
        slip::encode(&mut framed, &body).unwrap();
        conn.iface_mut_for_test().extend(framed);
    }

    let err = conn
        .read_reg(0x6001_A004)
        .expect_err("all three attempts should report the bootloader error");
    assert!(matches!(err, Error::Rom(_)));
}

#[test]
fn chunked_flash_read_issues_one_request_per_64_byte_block() {
    let mut fake = FakeChannel::new();
    fake.push_response(command::CommandType::Sync as u8, 0);
    let mut conn = Connection::new(fake);
    conn.connect(5).unwrap();

    // SpiAttachFlash + two ReadFlash chunks (64 + 36 bytes for a 100-byte read)
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::SpiAttachFlash as u8, &[]));
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::ReadFlash as u8, &[0xAAu8; 64]));
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::ReadFlash as u8, &[0xBBu8; 36]));

    let data = flash::read(&mut conn, 0x1000, 100).unwrap();
    assert_eq!(data.len(), 100);
    assert!(data[..64].iter().all(|&b| b == 0xAA));
    assert!(data[64..].iter().all(|&b| b == 0xBB));
}

#[test]
fn uncompressed_write_sequences_flash_begin_data_end_with_padding() {
    let mut fake = FakeChannel::new();
    fake.push_response(command::CommandType::Sync as u8, 0);
    let mut conn = Connection::new(fake);
    conn.connect(5).unwrap();

    // SpiAttachFlash, FlashBegin, three FlashData blocks, FlashEnd.
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::SpiAttachFlash as u8, &[]));
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::FlashBegin as u8, &[]));
    for _ in 0..3 {
        conn.iface_mut_for_test().extend(slip_response(command::CommandType::FlashData as u8, &[]));
    }
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::FlashEnd as u8, &[]));

    let data = vec![0x42u8; 2500];
    flash::write(&mut conn, 0x1000, &data, false).unwrap();

    let sent = decode_commands(&conn.iface_mut().outbox);
    // sent[0] is the Sync issued by connect(), sent[1] is the SpiAttachFlash
    // issued by attach_flash().
    assert_eq!(sent[1].0, command::CommandType::SpiAttachFlash as u8);
    assert_eq!(sent[2].0, command::CommandType::FlashBegin as u8);
    assert_eq!(u32::from_le_bytes(sent[2].1[0..4].try_into().unwrap()), 2500); // erase_size
    assert_eq!(u32::from_le_bytes(sent[2].1[4..8].try_into().unwrap()), 3); // num_blocks
    assert_eq!(u32::from_le_bytes(sent[2].1[8..12].try_into().unwrap()), 0x400); // block_size
    assert_eq!(u32::from_le_bytes(sent[2].1[12..16].try_into().unwrap()), 0x1000); // offset

    for (i, cmd) in sent[3..6].iter().enumerate() {
        assert_eq!(cmd.0, command::CommandType::FlashData as u8);
        let seq = u32::from_le_bytes(cmd.1[4..8].try_into().unwrap());
        assert_eq!(seq, i as u32);
    }

    let last_block_payload = &sent[5].1[16..];
    assert_eq!(last_block_payload.len(), 0x400);
    assert!(last_block_payload[..452].iter().all(|&b| b == 0x42));
    assert!(last_block_payload[452..].iter().all(|&b| b == 0xFF));

    assert_eq!(sent[6].0, command::CommandType::FlashEnd as u8);
    assert_eq!(sent.len(), 7);
}

#[test]
fn compressed_write_sequences_flash_defl_begin_data_with_no_flash_end() {
    let mut fake = FakeChannel::new();
    fake.push_response(command::CommandType::Sync as u8, 0);
    let mut conn = Connection::new(fake);
    conn.connect(5).unwrap();

    // Highly-compressible payload: zlib at best compression collapses 3072
    // identical bytes to well under one 1024-byte block.
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::SpiAttachFlash as u8, &[]));
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::FlashDeflBegin as u8, &[]));
    conn.iface_mut_for_test().extend(slip_response(command::CommandType::FlashDeflData as u8, &[]));

    let data = vec![0u8; 3072];
    flash::write(&mut conn, 0x1000, &data, true).unwrap();

    let sent = decode_commands(&conn.iface_mut().outbox);
    // sent[0] is Sync (connect()), sent[1] is SpiAttachFlash (attach_flash()).
    assert_eq!(sent[1].0, command::CommandType::SpiAttachFlash as u8);
    assert_eq!(sent[2].0, command::CommandType::FlashDeflBegin as u8);
    assert_eq!(u32::from_le_bytes(sent[2].1[0..4].try_into().unwrap()), 3072); // uncompressed erase_size
    let num_blocks = u32::from_le_bytes(sent[2].1[4..8].try_into().unwrap());
    assert_eq!(num_blocks, 1);
    assert_eq!(u32::from_le_bytes(sent[2].1[8..12].try_into().unwrap()), 0x400);

    assert_eq!(sent[3].0, command::CommandType::FlashDeflData as u8);
    let seq = u32::from_le_bytes(sent[3].1[4..8].try_into().unwrap());
    assert_eq!(seq, 0);
    let compressed_len = u32::from_le_bytes(sent[3].1[0..4].try_into().unwrap()) as usize;
    assert!(compressed_len < 0x400, "expected the all-zero payload to compress under one block");

    // no terminal FlashEnd on the compressed path
    assert_eq!(sent.len(), 4);
}

#[test]
fn baud_change_reconfigures_local_port_and_settles() {
    let mut fake = FakeChannel::new();
    fake.push_response(command::CommandType::Sync as u8, 0);
    let mut conn = Connection::new(fake);
    conn.connect(5).unwrap();

    conn.iface_mut_for_test()
        .extend(slip_response(command::CommandType::ChangeBaudrate as u8, &[]));
    conn.change_baud(921_600, 115_200).unwrap();
}

/// Build a SLIP-framed success response for `opcode` with the given
/// payload, as raw bytes ready to feed into a `FakeChannel`'s inbox.
fn slip_response(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(0x01);
    body.push(opcode);
    body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(payload);
    body.push(0x00);
    body.push(0x00);

    let mut framed = Vec::new();
    slip::encode(&mut framed, &body).unwrap();
    framed
}

/// Test-only accessor: push more bytes into the connection's underlying
/// fake channel after it has already been moved into the `Connection`.
trait TestInboxExt {
    fn iface_mut_for_test(&mut self) -> &mut VecDeque<u8>;
}

impl TestInboxExt for Connection<FakeChannel> {
    fn iface_mut_for_test(&mut self) -> &mut VecDeque<u8> {
        &mut self.iface_mut().inbox
    }
}

/// Deframe every command written to `outbox`, returning each as
/// `(opcode, payload)`. Used to inspect the exact command sequence a
/// higher-level operation (like `flash::write`) issued on the wire.
fn decode_commands(outbox: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut decoder = slip::SlipDecoder::new();
    let mut cursor = std::io::Cursor::new(outbox);
    let mut out = Vec::new();

    loop {
        let deadline = std::time::Instant::now() + Duration::from_millis(10);
        match decoder.decode(&mut cursor, deadline) {
            Ok(frame) => {
                let opcode = frame[1];
                let len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
                out.push((opcode, frame[8..8 + len].to_vec()));
            }
            Err(_) => break,
        }
    }

    out
}
