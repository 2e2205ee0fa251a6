//! Driver for AT45DB series SPI DataFlash chips.
//!
//! Unlike 25-series NOR flash, the AT45DB programs main memory through one
//! of two internal SRAM buffers and erases the target page by itself. Page
//! program, buffer commit and page erase are asynchronous: the chip starts
//! working when chip-select is released and the caller polls [`Flash::is_ready`]
//! before touching the same page or buffer again.

use crate::{utils::HexSlice, Error};
use bitflags::bitflags;
use core::fmt;
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// Device ID of the AT45DB161E (16 Mbit), the reference part for this driver.
pub const AT45DB161E_ID: u32 = 0x1F_2600;

/// "Power of 2" binary page size configuration sequence.
const BINARY_PAGE_SIZE_SEQ: [u8; 4] = [Opcode::BinaryPageSize as u8, 0x2A, 0x80, 0xA6];

/// Chip erase is a fixed 4-byte sequence rather than opcode + address.
const CHIP_ERASE_SEQ: [u8; 4] = [Opcode::ChipErase as u8, 0x94, 0x80, 0x9A];

/// Reprogramming the page size register takes up to ~35 ms on the AT45DB161E;
/// poll with a generous bound instead of hanging on a dead chip.
const PAGE_SIZE_SWITCH_TIMEOUT_US: u32 = 400_000;
const STATUS_POLL_INTERVAL_US: u32 = 500;

/// Minimum CS wake-up pulse is 20 ns; one tick of the delay provider is the
/// finest granularity we can guarantee.
const UDPD_EXIT_PULSE_US: u32 = 1;
/// tXUDPD: settle time after the wake-up pulse before the chip answers again.
const UDPD_EXIT_SETTLE_US: u32 = 1_000;
/// tRDPD: resume time after leaving (regular) deep power-down.
const DPD_EXIT_RESUME_US: u32 = 35;

enum Opcode {
    /// Main memory page read, bypassing both buffers.
    PageRead = 0xD2,
    /// Write into SRAM buffer 1 / buffer 2.
    Buf1Write = 0x84,
    Buf2Write = 0x87,
    /// Commit buffer 1 / buffer 2 to a main memory page, with built-in erase.
    Buf1ToMemory = 0x83,
    Buf2ToMemory = 0x86,
    /// Page program through buffer 1 / buffer 2, with built-in erase.
    PageProgBuf1 = 0x82,
    PageProgBuf2 = 0x85,
    PageErase = 0x81,
    /// First byte of the 4-byte chip erase sequence.
    ChipErase = 0xC7,
    /// First byte of the 4-byte binary page size sequence.
    BinaryPageSize = 0x3D,
    UltraDeepPowerDown = 0x79,
    DeepPowerDown = 0xB9,
    ResumeDeepPowerDown = 0xAB,
    ReadStatus = 0xD7,
    ReadId = 0x9F,
}

bitflags! {
    /// Status word bits, byte 1 in the upper half and byte 2 in the lower.
    pub struct Status: u16 {
        /// Device is ready for the next command.
        const READY = 1 << 15;
        /// Result of the most recent main memory page to buffer compare.
        const COMP = 1 << 14;
        /// 4-bit density code (`1011` for the 16 Mbit part).
        const DENSITY = 0x3C00;
        /// Sector protection is enabled.
        const PROTECT = 1 << 9;
        /// Pages are the binary 512 bytes rather than the native 528.
        const PAGE_SIZE_BINARY = 1 << 8;
        /// The last erase or program operation failed.
        const EP_ERROR = 1 << 5;
        /// Sector lockdown is enabled.
        const SECTOR_LOCKDOWN = 1 << 3;
    }
}

/// 3-byte manufacturer and device identification.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    /// Manufacturer, family and series bytes as clocked out of the chip.
    bytes: [u8; 3],
}

impl Identification {
    fn from_raw(id: u32) -> Identification {
        Identification {
            bytes: [(id >> 16) as u8, (id >> 8) as u8, id as u8],
        }
    }

    /// The JEDEC manufacturer code (0x1F for Adesto).
    pub fn mfr_code(&self) -> u8 {
        self.bytes[0]
    }

    /// Family and density byte.
    pub fn family_code(&self) -> u8 {
        self.bytes[1]
    }

    /// Sub-series and product variant byte.
    pub fn series_code(&self) -> u8 {
        self.bytes[2]
    }

    /// The identification as a big-endian 24-bit composite.
    pub fn raw(&self) -> u32 {
        (u32::from(self.bytes[0]) << 16) | (u32::from(self.bytes[1]) << 8) | u32::from(self.bytes[2])
    }
}

impl fmt::Debug for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identification")
            .field(&HexSlice(self.bytes))
            .finish()
    }
}

/// Outcome of the identification and page-size setup done by [`Flash::init`].
///
/// Construction never hard-fails on an unexpected chip; callers check this
/// (or [`Flash::device_id`], which is zeroed in both failure states) before
/// trusting the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Expected device found and binary page size confirmed.
    Configured,
    /// Expected device found, but binary page size could not be confirmed.
    Misconfigured,
    /// The device ID did not match the expected part.
    Unidentified,
}

/// Driver for AT45DB series SPI DataFlash chips.
///
/// # Type Parameters
///
/// * **`SPI`**: The SPI master to which the flash chip is attached.
/// * **`CS`**: The **C**hip-**S**elect line attached to the `\CS` pin of the
///   flash chip.
/// * **`D`**: A microsecond delay provider, used for status poll pacing and
///   the power-down exit timings.
#[derive(Debug)]
pub struct Flash<SPI: Transfer<u8>, CS: OutputPin, D: DelayUs<u32>> {
    spi: SPI,
    cs: CS,
    delay: D,
    /// Cached device ID; zeroed when identification or page-size setup fails.
    id: u32,
    init: InitState,
    /// Next page program goes through buffer 1 (alternates every call).
    page_via_buf1: bool,
    /// Buffer currently targeted by `write_buffer`/`buffer_to_memory`.
    load_via_buf1: bool,
}

impl<SPI: Transfer<u8>, CS: OutputPin, D: DelayUs<u32>> Flash<SPI, CS, D> {
    /// Creates a new AT45DB driver and runs the power-on setup.
    ///
    /// Reads and caches the device identification, then makes sure the chip
    /// is configured for the binary 512-byte page size, switching it over if
    /// necessary. Switching programs a nonvolatile register rated for about
    /// 10,000 cycles, so it only ever happens when the bit is actually clear.
    ///
    /// An unexpected device ID or an unconfirmed page size is a *soft*
    /// failure: construction still succeeds, the cached ID is zeroed and
    /// [`Flash::init_state`] reports what went wrong. `Err` is only returned
    /// for transport faults (and for a chip that never reports ready after
    /// the page-size switch).
    ///
    /// # Parameters
    ///
    /// * **`spi`**: An SPI master. Must be configured to operate in SPI mode
    ///   0 or 3, at most [`MAX_SPI_FREQ_HZ`](crate::MAX_SPI_FREQ_HZ).
    /// * **`cs`**: The Chip-Select Pin connected to the `\CS` pin of the
    ///   flash chip. Will be driven low when accessing the device.
    /// * **`delay`**: Microsecond delay provider.
    pub fn init(spi: SPI, cs: CS, delay: D) -> Result<Self, Error<SPI, CS>> {
        let mut this = Self {
            spi,
            cs,
            delay,
            id: 0,
            init: InitState::Unidentified,
            page_via_buf1: true,
            load_via_buf1: true,
        };
        this.cs.set_high().map_err(Error::Gpio)?;

        let id = this.read_id()?;
        if id == AT45DB161E_ID {
            info!("Flash::init: AT45DB161E found");
            this.init = InitState::Configured;
        } else {
            info!("Flash::init: wrong ID {:?}", Identification::from_raw(id));
            this.id = 0;
        }

        let status = this.read_status()?;
        if status.contains(Status::PAGE_SIZE_BINARY) {
            debug!("Flash::init: binary page size already configured");
        } else if this.set_binary_page_size()? {
            info!("Flash::init: switched to binary page size");
        } else {
            // Page size could not be confirmed, signal "not found".
            this.id = 0;
            if this.init == InitState::Configured {
                this.init = InitState::Misconfigured;
            }
            warn!("Flash::init: binary page size not configured");
        }

        Ok(this)
    }

    /// Returns the cached device ID.
    ///
    /// Zero means initialization could not identify and configure the chip;
    /// see [`Flash::init_state`] for the distinction.
    pub fn device_id(&self) -> u32 {
        self.id
    }

    /// Returns the outcome of the setup performed by [`Flash::init`].
    pub fn init_state(&self) -> InitState {
        self.init
    }

    /// Returns the cached identification split into its component bytes.
    pub fn identification(&self) -> Identification {
        Identification::from_raw(self.id)
    }

    /// Releases the SPI bus, chip-select pin and delay provider.
    pub fn free(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }

    /// Runs a whole command frame: assert CS, exchange `bytes` in place,
    /// deassert CS.
    fn command(&mut self, bytes: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        // If the SPI transfer fails, make sure to disable CS anyways
        self.cs.set_low().map_err(Error::Gpio)?;
        let spi_result = self.spi.transfer(bytes).map_err(Error::Spi);
        self.cs.set_high().map_err(Error::Gpio)?;
        spi_result?;
        Ok(())
    }

    /// Runs a command frame with a separate data phase, streaming `data`
    /// after the header while CS stays asserted.
    fn command_with_data(
        &mut self,
        header: &mut [u8],
        data: &mut [u8],
    ) -> Result<(), Error<SPI, CS>> {
        self.cs.set_low().map_err(Error::Gpio)?;
        let mut spi_result = self.spi.transfer(header);
        if spi_result.is_ok() {
            spi_result = self.spi.transfer(data);
        }
        self.cs.set_high().map_err(Error::Gpio)?;
        spi_result.map(|_| ()).map_err(Error::Spi)
    }

    /// Reads the 16-bit status word (byte 1 in the upper half, byte 2 in the
    /// lower half). The word is re-read from the chip on every call.
    pub fn read_status(&mut self) -> Result<Status, Error<SPI, CS>> {
        let mut buf = [Opcode::ReadStatus as u8, 0, 0];
        self.command(&mut buf)?;

        Ok(Status::from_bits_truncate(
            (u16::from(buf[1]) << 8) | u16::from(buf[2]),
        ))
    }

    /// Reads the manufacturer/family/series identification and caches it.
    pub fn read_id(&mut self) -> Result<u32, Error<SPI, CS>> {
        let mut buf = [Opcode::ReadId as u8, 0, 0, 0];
        self.command(&mut buf)?;

        // Skip buf[0] (SPI read response byte)
        let id = (u32::from(buf[1]) << 16) | (u32::from(buf[2]) << 8) | u32::from(buf[3]);
        self.id = id;
        Ok(id)
    }

    /// Whether the chip is ready for the next command.
    pub fn is_ready(&mut self) -> Result<bool, Error<SPI, CS>> {
        Ok(self.read_status()?.contains(Status::READY))
    }

    /// Whether the most recent erase or program operation failed.
    ///
    /// The driver never retries on its own; after an asynchronous operation
    /// finishes, callers decide what to do with a flagged error.
    pub fn is_error_flagged(&mut self) -> Result<bool, Error<SPI, CS>> {
        Ok(self.read_status()?.contains(Status::EP_ERROR))
    }

    /// Polls the status register until the chip reports ready.
    fn wait_ready(&mut self, timeout_us: u32) -> Result<Status, Error<SPI, CS>> {
        let mut waited_us = 0;
        loop {
            let status = self.read_status()?;
            if status.contains(Status::READY) {
                return Ok(status);
            }
            if waited_us >= timeout_us {
                return Err(Error::Timeout);
            }
            self.delay.delay_us(STATUS_POLL_INTERVAL_US);
            waited_us += STATUS_POLL_INTERVAL_US;
        }
    }

    /// Configures the chip for the binary 512-byte page size.
    ///
    /// If the chip already reports binary mode this returns `Ok(true)`
    /// without touching nonvolatile state. Otherwise the switch sequence is
    /// sent and the call blocks (tens of milliseconds) until the chip is
    /// ready again, returning whether binary mode is now reported.
    ///
    /// The setting lives in a nonvolatile register with a ~10,000 cycle
    /// limit. Do not call this speculatively.
    pub fn set_binary_page_size(&mut self) -> Result<bool, Error<SPI, CS>> {
        let mut status = self.read_status()?;
        if !status.contains(Status::PAGE_SIZE_BINARY) {
            let mut cmd_buf = BINARY_PAGE_SIZE_SEQ;
            self.command(&mut cmd_buf)?;
            status = self.wait_ready(PAGE_SIZE_SWITCH_TIMEOUT_US)?;
        }
        Ok(status.contains(Status::PAGE_SIZE_BINARY))
    }

    /// Reads main memory into `buf`, starting at the byte address `addr`.
    ///
    /// The read bypasses both SRAM buffers and leaves their contents
    /// unchanged. When the end of the addressed page is reached the chip
    /// wraps to the *start of the same page*, not the next one; keep
    /// `buf.len()` within one page when that matters.
    pub fn read_page(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        // Opcode + 3 address bytes + 4 dummy bytes for the chip's internal
        // access latency.
        let mut cmd_buf = [
            Opcode::PageRead as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
            0,
            0,
            0,
            0,
        ];
        self.command_with_data(&mut cmd_buf, buf)
    }

    /// Programs one main memory page through an SRAM buffer, with built-in
    /// erase.
    ///
    /// The two buffers are used alternately so a page can stream in while
    /// the previous one is still being programmed. The chip starts erasing
    /// and programming when CS is released; this call does **not** wait for
    /// completion. Poll [`Flash::is_ready`] (and [`Flash::is_error_flagged`])
    /// before the next command touching the same page or buffer.
    ///
    /// `addr` must be page-aligned and `data` must cover the full page,
    /// otherwise whatever happens to be in the chip's buffer is programmed
    /// into the remaining bytes. Neither is checked here.
    pub fn write_page(&mut self, addr: u32, data: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        let opcode = if self.page_via_buf1 {
            Opcode::PageProgBuf1
        } else {
            Opcode::PageProgBuf2
        };
        self.page_via_buf1 = !self.page_via_buf1;

        let mut cmd_buf = [
            opcode as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ];
        self.command_with_data(&mut cmd_buf, data)
    }

    /// Writes `data` into the currently selected SRAM buffer at buffer
    /// offset `addr`, without touching main memory.
    ///
    /// The target buffer is the one the next [`Flash::buffer_to_memory`]
    /// will commit; this call does not advance the buffer rotation. The chip
    /// stays ready during buffer writes.
    pub fn write_buffer(&mut self, addr: u32, data: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        let opcode = if self.load_via_buf1 {
            Opcode::Buf1Write
        } else {
            Opcode::Buf2Write
        };

        let mut cmd_buf = [
            opcode as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ];
        self.command_with_data(&mut cmd_buf, data)
    }

    /// Commits the currently selected SRAM buffer to the main memory page at
    /// `addr`, with built-in erase, and rotates to the other buffer.
    ///
    /// Asynchronous; poll [`Flash::is_ready`] afterwards.
    pub fn buffer_to_memory(&mut self, addr: u32) -> Result<(), Error<SPI, CS>> {
        let opcode = if self.load_via_buf1 {
            Opcode::Buf1ToMemory
        } else {
            Opcode::Buf2ToMemory
        };
        self.load_via_buf1 = !self.load_via_buf1;

        let mut cmd_buf = [
            opcode as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ];
        self.command(&mut cmd_buf)
    }

    /// Erases the main memory page at `addr` (page-aligned).
    ///
    /// Asynchronous; poll [`Flash::is_ready`] afterwards.
    pub fn erase_page(&mut self, addr: u32) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = [
            Opcode::PageErase as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ];
        self.command(&mut cmd_buf)
    }

    /// Erases the entire main memory array.
    ///
    /// Warning: Full erase operations can take a significant amount of time.
    /// Check your device's datasheet for precise numbers.
    ///
    /// Asynchronous; poll [`Flash::is_ready`] afterwards.
    pub fn erase_chip(&mut self) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = CHIP_ERASE_SEQ;
        self.command(&mut cmd_buf)
    }

    /// Puts the chip into deep power-down.
    ///
    /// Only [`Flash::exit_deep_power_down`] is answered in this state.
    pub fn enter_deep_power_down(&mut self) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = [Opcode::DeepPowerDown as u8];
        self.command(&mut cmd_buf)
    }

    /// Resumes from deep power-down and waits the resume time before
    /// returning.
    pub fn exit_deep_power_down(&mut self) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = [Opcode::ResumeDeepPowerDown as u8];
        self.command(&mut cmd_buf)?;
        self.delay.delay_us(DPD_EXIT_RESUME_US);
        Ok(())
    }

    /// Puts the chip into ultra-deep power-down (below 1 µA).
    ///
    /// In this state the chip ignores *every* command, including status
    /// reads. The driver does not guard against that and will never wake the
    /// chip implicitly; call [`Flash::exit_ultra_deep_power_down`] before
    /// anything else.
    pub fn enter_ultra_deep_power_down(&mut self) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = [Opcode::UltraDeepPowerDown as u8];
        self.command(&mut cmd_buf)
    }

    /// Wakes the chip from ultra-deep power-down.
    ///
    /// Pulses CS (datasheet minimum 20 ns, held for one delay tick here),
    /// then waits the settle time before returning. SRAM buffer contents are
    /// undefined after a power-down cycle.
    pub fn exit_ultra_deep_power_down(&mut self) -> Result<(), Error<SPI, CS>> {
        self.cs.set_low().map_err(Error::Gpio)?;
        self.delay.delay_us(UDPD_EXIT_PULSE_US);
        self.cs.set_high().map_err(Error::Gpio)?;
        self.delay.delay_us(UDPD_EXIT_SETTLE_US);
        Ok(())
    }
}
