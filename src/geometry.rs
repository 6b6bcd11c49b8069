/// Flash organisation needed to turn addresses into page numbers.
///
/// `page_size` must not be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashGeometry {
    /// Address of the first byte of bank 1.
    pub base: u32,
    /// Size of a single bank in bytes.
    pub bank_size: u32,
    /// Size of the smallest erasable unit in bytes.
    pub page_size: u32,
}

impl FlashGeometry {
    /// 512 KiB of flash split in two banks of 128 pages, 2 KiB each.
    ///
    /// Matches [`INTERNAL_FLASH_DESCRIPTOR`](crate::layout::INTERNAL_FLASH_DESCRIPTOR).
    pub const DUAL_BANK_512K: FlashGeometry = FlashGeometry {
        base: 0x0800_0000,
        bank_size: 0x4_0000,
        page_size: 0x800,
    };

    /// Bank index (0 or 1) of `address`.
    pub const fn bank(&self, address: u32) -> u32 {
        if address < self.base.saturating_add(self.bank_size) {
            0
        } else {
            1
        }
    }

    /// Page number of `address` within its bank.
    ///
    /// Addresses below `base` map to page 0.
    pub const fn page(&self, address: u32) -> u32 {
        let bank_start = self.base.saturating_add(self.bank(address) * self.bank_size);
        address.saturating_sub(bank_start) / self.page_size
    }

    /// First address of the page containing `address`.
    ///
    /// Addresses below `base` are returned unchanged.
    pub const fn page_start(&self, address: u32) -> u32 {
        address - address.saturating_sub(self.base) % self.page_size
    }
}
