//! An [`embedded-hal`]-based driver for Adesto AT45DB series SPI DataFlash
//! chips.
//!
//! The AT45DB family differs from common 25-series NOR flash in that every
//! page program goes through one of two on-chip SRAM buffers, and the chip
//! erases the target page on its own before programming it. This crate
//! exposes those page/buffer primitives plus status, identification and
//! power-down control; wear leveling and file systems are left to higher
//! layers.
//!
//! The AT45DB161E (16 Mbit) is the reference part.
//!
//! [`embedded-hal`]: https://docs.rs/embedded-hal/

#![doc(html_root_url = "https://docs.rs/spi-dataflash/0.1.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;
mod error;
mod utils;

pub mod at45db;

pub use crate::error::Error;

/// Size in bytes of a main-memory page (and of each SRAM buffer) when the
/// chip is configured for "power of 2" binary page size.
pub const PAGE_SIZE: usize = 512;

/// Highest SPI clock frequency the chip is rated for, in Hz.
pub const MAX_SPI_FREQ_HZ: u32 = 16_000_000;

/// Picks the SPI clock frequency for the bus the chip is attached to.
///
/// `embedded-hal` SPI masters own their clock configuration, so the driver
/// cannot program the bus frequency itself. Callers should clamp their bus
/// ceiling through this function when setting up the SPI peripheral.
pub fn spi_frequency(max_bus_hz: u32) -> u32 {
    max_bus_hz.min(MAX_SPI_FREQ_HZ)
}
