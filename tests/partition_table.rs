//! Exercises the partition-table codec against on-disk files, the way a
//! real `flash-read`/`flash-write` round trip would hand it a buffer.

use std::io::Write;

use esp32_rom_tool::partition::PartitionTable;

#[test]
fn csv_file_round_trips_through_binary_file() {
    let mut csv_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv_file, "nvs,      data, nvs,     0x9000,  0x6000").unwrap();
    writeln!(csv_file, "phy_init, data, phy,     0xF000,  0x1000").unwrap();
    writeln!(csv_file, "factory,  app,  factory, 0x10000, 1M").unwrap();

    let csv_text = std::fs::read_to_string(csv_file.path()).unwrap();
    let table = PartitionTable::from_csv(&csv_text).unwrap();

    let bin_bytes = table.to_bytes().unwrap();
    let mut bin_file = tempfile::NamedTempFile::new().unwrap();
    bin_file.write_all(&bin_bytes).unwrap();

    let reloaded_bytes = std::fs::read(bin_file.path()).unwrap();
    let reloaded = PartitionTable::from_bytes(&reloaded_bytes).unwrap();

    assert_eq!(reloaded.partitions, table.partitions);
    assert_eq!(reloaded.partitions.len(), 3);
    assert_eq!(reloaded.partitions[2].offset, 0x10000);
    assert_eq!(reloaded.partitions[2].size, 0x100000);
}

#[test]
fn csv_round_trip_preserves_symbolic_subtype_numerics() {
    let csv_text = "ota_data, data, ota, 0x9000, 0x2000\n";
    let table = PartitionTable::from_csv(csv_text).unwrap();
    assert_eq!(table.partitions[0].subtype, 0x00);

    let rendered = table.to_csv();
    let reparsed = PartitionTable::from_csv(&rendered).unwrap();
    assert_eq!(reparsed.partitions, table.partitions);
}
