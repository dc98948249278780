//! Command-line argument parsing and subcommand dispatch.
//!
//! Each handler is a thin wrapper: open the serial channel, build the
//! protocol engine, delegate to the library's core operations, then format
//! the result for display. No handler talks to the wire directly.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use serde::Serialize;

use crate::chip::{self, ChipInfo};
use crate::connection::Connection;
use crate::error::Error;
use crate::flash;
use crate::interface::Interface;
use crate::partition::PartitionTable;

const PARTITION_TABLE_OFFSET: u32 = 0x8000;
const PARTITION_TABLE_SIZE: u32 = 0xC00;

#[derive(Debug, Parser)]
#[command(name = "esp32-rom-tool", version, about = "Talk to the ESP32 ROM bootloader over serial")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit verbose protocol-engine logging (equivalent to RUST_LOG=debug).
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print chip identity, features, MAC address, and partition table.
    Info(InfoArgs),
    /// Read a region of flash to a file.
    #[command(alias = "flashRead")]
    FlashRead(FlashReadArgs),
    /// Write a file to a region of flash.
    #[command(alias = "flashWrite")]
    FlashWrite(FlashWriteArgs),
    /// Print this tool's own version.
    Version,
}

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port device path.
    #[arg(short, long, env = "ESP32_ROM_TOOL_PORT")]
    pub port: String,

    /// Baud rate used while establishing the connection.
    #[arg(short = 'b', long, default_value_t = 115_200)]
    pub baud: u32,

    /// Baud rate negotiated for flash transfer once connected.
    #[arg(long, default_value_t = 921_600)]
    pub transfer_baud: u32,

    /// Timeout, in milliseconds, for each connection attempt.
    #[arg(long, default_value_t = 500)]
    pub connect_timeout: u64,

    /// Number of sync attempts before giving up on connecting.
    #[arg(long, default_value_t = 5)]
    pub connect_retries: usize,
}

impl ConnectArgs {
    fn connect(&self) -> Result<Connection<Interface>, Error> {
        let iface = Interface::open(
            &self.port,
            self.baud,
            Duration::from_millis(self.connect_timeout),
        )?;
        let mut conn = Connection::new(iface);
        conn.connect(self.connect_retries)?;
        if self.transfer_baud != self.baud {
            conn.change_baud(self.transfer_baud, self.baud)?;
        }
        Ok(conn)
    }
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Emit the report as JSON instead of a human-readable summary.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct FlashReadArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Flash offset to start reading at. Ignored if `--partition` is given.
    #[arg(long, value_parser = parse_u32, default_value = "0x0")]
    pub offset: u32,

    /// Number of bytes to read. Ignored if `--partition` is given.
    #[arg(long, value_parser = parse_u32, default_value = "0x0")]
    pub size: u32,

    /// Read the named partition instead of an explicit offset/size.
    #[arg(long, conflicts_with_all = ["offset", "size"])]
    pub partition: Option<String>,

    /// Destination file for the read data.
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Debug, Args)]
pub struct FlashWriteArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Flash offset to write at. Ignored if `--partition` is given.
    #[arg(long, value_parser = parse_u32, default_value = "0x0")]
    pub offset: u32,

    /// Write into the named partition instead of an explicit offset.
    #[arg(long, conflicts_with = "offset")]
    pub partition: Option<String>,

    /// Source file whose contents are written to flash.
    #[arg(long)]
    pub file: PathBuf,

    /// Send the image uncompressed instead of zlib-deflating it first.
    #[arg(long)]
    pub no_compress: bool,
}

impl FlashWriteArgs {
    fn compress(&self) -> bool {
        !self.no_compress
    }
}

fn parse_u32(text: &str) -> Result<u32, String> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        text.parse::<u32>().map_err(|e| e.to_string())
    }
}

/// Run the parsed CLI, returning the process exit code.
pub fn run(cli: Cli) -> i32 {
    crate::logging::initialize_logger(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let result = match cli.command {
        Command::Info(args) => info(args),
        Command::FlashRead(args) => flash_read(args),
        Command::FlashWrite(args) => flash_write(args),
        Command::Version => {
            println!("esp32-rom-tool {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}

#[derive(Debug, Serialize)]
struct InfoReport {
    chip_type: String,
    revision: u8,
    mac: String,
    features: Vec<String>,
    coding_scheme: String,
    partitions: Vec<PartitionRow>,
}

#[derive(Debug, Serialize)]
struct PartitionRow {
    name: String,
    ty: String,
    subtype: u8,
    offset: u32,
    size: u32,
}

fn build_report(info: &ChipInfo, table: Option<&PartitionTable>) -> InfoReport {
    InfoReport {
        chip_type: info.description.chip_type.to_string(),
        revision: info.description.revision,
        mac: chip::format_mac(&info.mac),
        features: info.features.iter().map(|f| f.to_string()).collect(),
        coding_scheme: info.coding_scheme.to_string(),
        partitions: table
            .map(|t| {
                t.partitions
                    .iter()
                    .map(|p| PartitionRow {
                        name: p.name.clone(),
                        ty: match p.ty {
                            crate::partition::Type::App => "app".to_string(),
                            crate::partition::Type::Data => "data".to_string(),
                        },
                        subtype: p.subtype,
                        offset: p.offset,
                        size: p.size,
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn info(args: InfoArgs) -> Result<(), Error> {
    let mut conn = args.connect.connect()?;
    let chip_info = chip::read_chip_info(&mut conn)?;

    let table = read_partition_table(&mut conn).ok();

    let report = build_report(&chip_info, table.as_ref());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap());
    } else {
        println!("Chip Type:     {}", report.chip_type);
        println!("Revision:      {}", report.revision);
        println!("MAC Address:   {}", report.mac);
        println!("Coding Scheme: {}", report.coding_scheme);
        println!("Features:      {}", report.features.join(", "));
        if report.partitions.is_empty() {
            println!("Partition Table: (none found)");
        } else {
            println!("Partition Table:");
            for p in &report.partitions {
                println!(
                    "  {:<16} {:<5} {:#04x}  {:#010x}  {:#010x}",
                    p.name, p.ty, p.subtype, p.offset, p.size
                );
            }
        }
    }

    Ok(())
}

fn flash_read(args: FlashReadArgs) -> Result<(), Error> {
    let mut conn = args.connect.connect()?;

    let (offset, size) = match &args.partition {
        Some(name) => resolve_partition(&mut conn, name)?,
        None => (args.offset, args.size),
    };

    let data = flash::read(&mut conn, offset, size)?;
    fs::write(&args.file, &data).map_err(map_io_error)?;
    println!("read {} bytes from {offset:#x} to {}", data.len(), args.file.display());
    Ok(())
}

fn flash_write(args: FlashWriteArgs) -> Result<(), Error> {
    let mut conn = args.connect.connect()?;
    let data = fs::read(&args.file).map_err(map_io_error)?;

    let offset = match &args.partition {
        Some(name) => resolve_partition(&mut conn, name)?.0,
        None => args.offset,
    };

    let compress = args.compress();
    flash::write(&mut conn, offset, &data, compress)?;
    println!("wrote {} bytes to {offset:#x}", data.len());
    Ok(())
}

/// Read and parse the on-flash partition table at its fixed offset.
fn read_partition_table(conn: &mut Connection<Interface>) -> Result<PartitionTable, Error> {
    let table_bytes = flash::read(conn, PARTITION_TABLE_OFFSET, PARTITION_TABLE_SIZE)?;
    let table = PartitionTable::from_bytes(&table_bytes)?;
    info!("read partition table: {} partition(s)", table.partitions.len());
    Ok(table)
}

fn resolve_partition(conn: &mut Connection<Interface>, name: &str) -> Result<(u32, u32), Error> {
    let table = read_partition_table(conn)?;
    table
        .partitions
        .iter()
        .find(|p| p.name == name)
        .map(|p| (p.offset, p.size))
        .ok_or_else(|| Error::Codec(crate::error::CodecError::BadTypeLiteral(name.to_string())))
}

fn map_io_error(err: std::io::Error) -> Error {
    Error::Codec(crate::error::CodecError::Io(err))
}
