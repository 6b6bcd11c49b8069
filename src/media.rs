use core::fmt;

use crate::layout::INTERNAL_FLASH_DESCRIPTOR;
use crate::memory::{MemoryError, MemoryMap};
use crate::protection::Protection;
use crate::state::DfuHandle;

/// Reasons for rejecting a media operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediaError {
    /// Device is read-protected.
    ReadProtected,
    /// Address is not covered by any memory region.
    AddressOutOfRange,
    /// The memory layer failed to carry out the operation.
    Memory(MemoryError),
}

impl From<MemoryError> for MediaError {
    fn from(e: MemoryError) -> Self {
        MediaError::Memory(e)
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::ReadProtected => f.write_str("device is read-protected"),
            MediaError::AddressOutOfRange => f.write_str("address out of range"),
            MediaError::Memory(e) => write!(f, "memory error: {}", e),
        }
    }
}

/// Operation the host is about to wait for, used to pick the poll timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediaCommand {
    /// Sector erase.
    Erase,
    /// Block program.
    Program,
}

impl From<u8> for MediaCommand {
    fn from(cmd: u8) -> Self {
        match cmd {
            1 => MediaCommand::Program,
            _ => MediaCommand::Erase,
        }
    }
}

/// Static parameters of a [`FlashMedia`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConfig {
    /// Memory layout string exposed as interface descriptor.
    pub descriptor: &'static str,
    /// Time reported to the host for a sector erase, in milliseconds.
    pub erase_time_ms: u32,
    /// Time reported to the host for a block program, in milliseconds.
    pub program_time_ms: u32,
}

impl MediaConfig {
    /// Internal flash, 50 ms for both erase and program.
    pub const DEFAULT: MediaConfig = MediaConfig {
        descriptor: INTERNAL_FLASH_DESCRIPTOR,
        erase_time_ms: 50,
        program_time_ms: 50,
    };
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Media operations called by the DFU class.
///
/// Calls are always made from the class' own context (usually the USB
/// interrupt), one at a time. Rejections are signalled both by the returned
/// error and by moving `dfu` into the error state.
pub trait DfuMedia {
    /// Memory layout string, see [`layout`](crate::layout).
    fn descriptor(&self) -> &'static str;

    /// Prepare the media.
    fn init(&mut self) -> Result<(), MediaError>;

    /// Release the media.
    fn deinit(&mut self) -> Result<(), MediaError>;

    /// Erase the sector containing `address`.
    fn erase(&mut self, dfu: &mut DfuHandle, address: u32) -> Result<(), MediaError>;

    /// Program `src` at address `dest`.
    fn write(&mut self, dfu: &mut DfuHandle, src: &[u8], dest: u32) -> Result<(), MediaError>;

    /// Read `dest.len()` bytes starting at address `src`.
    ///
    /// Returns the part of `dest` holding the data.
    fn read<'b>(&mut self, dfu: &mut DfuHandle, src: u32, dest: &'b mut [u8]) -> &'b [u8];

    /// Fill in the poll timeout (bytes 1..4 of `status`) for `command`.
    fn get_status(
        &mut self,
        address: u32,
        command: MediaCommand,
        status: &mut [u8; 6],
    ) -> Result<(), MediaError>;

    /// Called after the host has been told that a download operation
    /// completed.
    fn post_process(&mut self) {}
}

/// DFU media backed by a [`MemoryMap`].
///
/// Every erase and write is refused when the device is read-protected or the
/// address falls outside of all registered regions.
pub struct FlashMedia<'a, P: Protection, const N: usize> {
    memory: MemoryMap<'a, N>,
    protection: P,
    config: MediaConfig,
}

impl<'a, P: Protection, const N: usize> FlashMedia<'a, P, N> {
    /// Create media over `memory` using the default configuration.
    pub fn new(memory: MemoryMap<'a, N>, protection: P) -> Self {
        Self::with_config(memory, protection, MediaConfig::default())
    }

    /// Create media with custom layout string and timings.
    pub fn with_config(memory: MemoryMap<'a, N>, protection: P, config: MediaConfig) -> Self {
        Self { memory, protection, config }
    }

    /// Registered memory regions.
    pub fn memory(&self) -> &MemoryMap<'a, N> {
        &self.memory
    }

    /// Protection accessor.
    pub fn protection(&self) -> &P {
        &self.protection
    }

    /// Give back the memory map and protection accessor.
    pub fn release(self) -> (MemoryMap<'a, N>, P) {
        (self.memory, self.protection)
    }

    fn check_download(&self, dfu: &mut DfuHandle, address: u32) -> Result<(), MediaError> {
        if self.protection.is_read_protected() {
            Err(dfu.dnload_rdp_nack())
        } else if self.memory.address_area(address).is_none() {
            Err(dfu.address_nack())
        } else {
            Ok(())
        }
    }
}

impl<P: Protection, const N: usize> DfuMedia for FlashMedia<'_, P, N> {
    fn descriptor(&self) -> &'static str {
        self.config.descriptor
    }

    fn init(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn erase(&mut self, dfu: &mut DfuHandle, address: u32) -> Result<(), MediaError> {
        self.check_download(dfu, address)?;
        debug!("erase {=u32:#x}", address);
        self.memory.erase(address)?;
        Ok(())
    }

    fn write(&mut self, dfu: &mut DfuHandle, src: &[u8], dest: u32) -> Result<(), MediaError> {
        self.check_download(dfu, dest)?;
        debug!("write {=u32:#x} len={=usize}", dest, src.len());
        // The host learns about a failed program only through verification.
        if let Err(_e) = self.memory.write(dest, src) {
            warn!("write {=u32:#x} failed: {}", dest, _e);
        }
        Ok(())
    }

    fn read<'b>(&mut self, dfu: &mut DfuHandle, src: u32, dest: &'b mut [u8]) -> &'b [u8] {
        if self.protection.is_read_protected() {
            dfu.upload_rdp_nack();
        }
        trace!("read {=u32:#x} len={=usize}", src, dest.len());
        self.memory.read(src, dest)
    }

    fn get_status(
        &mut self,
        _address: u32,
        command: MediaCommand,
        status: &mut [u8; 6],
    ) -> Result<(), MediaError> {
        let time = match command {
            MediaCommand::Program => self.config.program_time_ms,
            MediaCommand::Erase => self.config.erase_time_ms,
        };
        let bytes = time.to_le_bytes();
        status[1] = bytes[0];
        status[2] = bytes[1];
        status[3] = 0;
        Ok(())
    }
    fn post_process(&mut self) {
        self.memory.post_process();
    }
}
