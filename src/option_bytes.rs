//! Option-bytes region.
//!
//! A download into the option-bytes area is a packed image of the option
//! registers, one 32-bit little-endian word per register in the order of
//! [`OptionRegister::ALL`]. Only registers fully covered by the payload are
//! written. Loading the new values resets the device, so it is deferred until
//! [`Memory::post_process`].

use crate::memory::{Memory, MemoryError};

/// Option register written from a downloaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OptionRegister {
    /// User options and RDP level.
    Optr,
    /// Non-secure boot address 0.
    NsBootAdd0,
    /// Non-secure boot address 1.
    NsBootAdd1,
    /// Secure boot address 0.
    SecBootAdd0,
    /// Bank 1 secure watermark, start and end page.
    SecWm1R1,
    /// Bank 1 secure watermark, HDP area.
    SecWm1R2,
    /// Bank 1 write protection area A.
    Wrp1A,
    /// Bank 1 write protection area B.
    Wrp1B,
    /// Bank 2 secure watermark, start and end page.
    SecWm2R1,
    /// Bank 2 secure watermark, HDP area.
    SecWm2R2,
    /// Bank 2 write protection area A.
    Wrp2A,
    /// Bank 2 write protection area B.
    Wrp2B,
}

impl OptionRegister {
    /// All registers in image order.
    pub const ALL: [OptionRegister; 12] = [
        OptionRegister::Optr,
        OptionRegister::NsBootAdd0,
        OptionRegister::NsBootAdd1,
        OptionRegister::SecBootAdd0,
        OptionRegister::SecWm1R1,
        OptionRegister::SecWm1R2,
        OptionRegister::Wrp1A,
        OptionRegister::Wrp1B,
        OptionRegister::SecWm2R1,
        OptionRegister::SecWm2R2,
        OptionRegister::Wrp2A,
        OptionRegister::Wrp2B,
    ];

    /// Offset of the register word in the image.
    pub const fn offset(self) -> usize {
        self as usize * 4
    }

    /// Bits of the image word that are programmed, the rest is written as 0.
    pub const fn mask(self) -> u32 {
        match self {
            OptionRegister::Optr | OptionRegister::SecBootAdd0 => 0xffff_ffff,
            // bits 0..7 are reserved
            OptionRegister::NsBootAdd0 | OptionRegister::NsBootAdd1 => 0xffff_ff00,
            OptionRegister::SecWm1R2 | OptionRegister::SecWm2R2 => 0xffff_0000,
            OptionRegister::SecWm1R1
            | OptionRegister::SecWm2R1
            | OptionRegister::Wrp1A
            | OptionRegister::Wrp1B
            | OptionRegister::Wrp2A
            | OptionRegister::Wrp2B => 0x00ff_00ff,
        }
    }

    /// Register value taken from `image`, `None` if the image is too short.
    pub fn value(self, image: &[u8]) -> Option<u32> {
        let offset = self.offset();
        let word = image.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]) & self.mask())
    }
}

/// Access to the option-bytes registers of the flash controller.
pub trait OptionBytesRegisters {
    /// Read a byte of the currently loaded option bytes.
    fn read(&mut self, address: u32) -> u8;

    /// Unlock flash and option registers and clear pending error flags.
    fn unlock(&mut self) -> Result<(), MemoryError>;

    /// Set a single option register.
    fn write_register(&mut self, register: OptionRegister, value: u32);

    /// Start programming of the option registers.
    fn start(&mut self) -> Result<(), MemoryError>;

    /// Load the programmed options and lock the controller.
    ///
    /// Usually resets the device.
    fn launch(&mut self);
}

/// Option-bytes region, programmed from a packed register image.
///
/// The region can be read and written, it cannot be erased.
pub struct OptionBytes<R: OptionBytesRegisters> {
    regs: R,
    launch_pending: bool,
}

impl<R: OptionBytesRegisters> OptionBytes<R> {
    /// Wrap the option registers.
    pub fn new(regs: R) -> Self {
        Self { regs, launch_pending: false }
    }

    /// Returns `true` if new options wait to be loaded.
    pub fn launch_pending(&self) -> bool {
        self.launch_pending
    }

    /// Access the registers.
    pub fn registers(&self) -> &R {
        &self.regs
    }
}

impl<R: OptionBytesRegisters> Memory for OptionBytes<R> {
    fn read(&mut self, address: u32) -> u8 {
        self.regs.read(address)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        debug!("option bytes {=u32:#x} len={=usize}", address, data.len());
        self.regs.unlock()?;
        for register in OptionRegister::ALL {
            let Some(value) = register.value(data) else {
                break;
            };
            trace!("option register {} = {=u32:#x}", register, value);
            self.regs.write_register(register, value);
        }
        self.regs.start()?;
        self.launch_pending = true;
        Ok(())
    }

    fn post_process(&mut self) {
        if core::mem::take(&mut self.launch_pending) {
            debug!("loading option bytes");
            self.regs.launch();
        }
    }
}
