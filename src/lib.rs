//! Host-side library for talking to the ESP32 ROM bootloader over a
//! serial UART: SLIP framing, the checksummed command protocol, chunked
//! flash transfer, and the partition-table codec.

pub mod chip;
pub mod command;
pub mod connection;
pub mod error;
pub mod flash;
pub mod interface;
pub mod partition;
pub mod slip;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "cli")]
pub mod logging {
    //! Thin wrapper around `env_logger` so the binary and any embedder
    //! configure logging the same way.

    use env_logger::Env;
    use log::LevelFilter;

    /// Install an `env_logger` instance, honoring `RUST_LOG` if set and
    /// falling back to `default_level` otherwise.
    pub fn initialize_logger(default_level: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()))
            .format_timestamp(None)
            .init();
    }
}

pub use connection::Connection;
pub use error::Error;
pub use interface::Interface;
