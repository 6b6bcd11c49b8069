#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

//! DFU media interface for USB bootloaders
//!
//! DFU stands for Device Firmware Upgrade. A device in DFU mode exposes its
//! memories to the host, which can then erase, download (program) and upload
//! (read) them in blocks.
//!
//! This crate bridges DFU requests to memory operations:
//! * [`DfuMedia`] is the contract the DFU class uses for erase, write, read and
//!   status queries
//! * [`FlashMedia`] implements it over a [`MemoryMap`] of memory regions and
//!   refuses erase/write on read-protected devices or unmapped addresses
//! * [`DfuClass`] is a `usb-device` DFU mode class driving the media, following
//!   the ST DfuSe extensions (Set Address Pointer and Erase commands)
//!
//! [`OptionBytes`] exposes the option registers as a memory region, new options
//! are loaded once the host has seen the download complete.
//!
//! Read protection state is provided through the [`Protection`] trait so that
//! it can come from the flash controller, a closure or a plain flag.
//!
//! ```
//! use usbd_dfu_media::*;
//!
//! let mut ram = [0u8; 256];
//! let mut ram = SliceMemory::new(0x2000_0000, 0, &mut ram);
//! let desc = ram.descriptor(AreaKind::Ram);
//! let mut media = FlashMedia::new(MemoryMap::new([Region::new(desc, &mut ram)]), false);
//!
//! let mut dfu = DfuHandle::new(0x2000_0000);
//! assert_eq!(media.erase(&mut dfu, 0x3000_0000), Err(MediaError::AddressOutOfRange));
//! ```

#[macro_use]
mod fmt;

/// DFU mode class
pub mod class;
/// Flash page arithmetic
pub mod geometry;
pub mod layout;
/// DFU media interface
pub mod media;
/// Memory regions and the memory-operations layer
pub mod memory;
pub mod option_bytes;
/// Read protection state
pub mod protection;
mod protocol;
/// DFU protocol state shared between the class and the media
pub mod state;

pub use crate::class::DfuClass;
pub use crate::geometry::FlashGeometry;
pub use crate::layout::{MediaLayout, INTERNAL_FLASH_DESCRIPTOR};
pub use crate::media::{DfuMedia, FlashMedia, MediaCommand, MediaConfig, MediaError};
pub use crate::memory::{AreaKind, Memory, MemoryDescriptor, MemoryError, MemoryMap, Region, SliceMemory};
pub use crate::option_bytes::{OptionBytes, OptionBytesRegisters, OptionRegister};
pub use crate::protection::{Protection, ProtectionFn, RdpLevel};
pub use crate::protocol::TRANSFER_SIZE;
pub use crate::state::{DfuHandle, DfuState, DfuStatusCode};
