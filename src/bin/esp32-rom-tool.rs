use std::process::ExitCode;

use clap::Parser;
use esp32_rom_tool::cli::{self, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();
    ExitCode::from(cli::run(cli) as u8)
}
