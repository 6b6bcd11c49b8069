use core::cell::Cell;

/// Accessor for the flash read-protection state.
///
/// The state is owned by the flash controller, the media interface only
/// queries it before every erase, write and read.
pub trait Protection {
    /// Returns `true` if the device is read-protected.
    fn is_read_protected(&self) -> bool;
}

impl Protection for bool {
    fn is_read_protected(&self) -> bool {
        *self
    }
}

impl Protection for Cell<bool> {
    fn is_read_protected(&self) -> bool {
        self.get()
    }
}

impl<T: Protection + ?Sized> Protection for &T {
    fn is_read_protected(&self) -> bool {
        (**self).is_read_protected()
    }
}

/// Wrapper turning a closure into a [`Protection`] accessor.
///
/// ```
/// use usbd_dfu_media::{Protection, ProtectionFn};
///
/// let protection = ProtectionFn(|| false);
/// assert!(!protection.is_read_protected());
/// ```
pub struct ProtectionFn<F>(
    /// Returns `true` while the device is read-protected.
    pub F,
);

impl<F: Fn() -> bool> Protection for ProtectionFn<F> {
    fn is_read_protected(&self) -> bool {
        (self.0)()
    }
}

/// Read protection level as programmed in the RDP option byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RdpLevel {
    /// No protection.
    Level0,
    /// Protection of the non-secure area only (TrustZone devices).
    Level0_5,
    /// Memory read protection.
    Level1,
    /// Chip protection, debug and bootloader access permanently disabled.
    Level2,
}

impl RdpLevel {
    /// Decode the RDP option byte.
    pub const fn from_option_byte(rdp: u8) -> Self {
        match rdp {
            0xaa => RdpLevel::Level0,
            0x55 => RdpLevel::Level0_5,
            0xcc => RdpLevel::Level2,
            _ => RdpLevel::Level1,
        }
    }
}

impl Protection for RdpLevel {
    fn is_read_protected(&self) -> bool {
        *self != RdpLevel::Level0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdp_decoding() {
        assert_eq!(RdpLevel::from_option_byte(0xaa), RdpLevel::Level0);
        assert_eq!(RdpLevel::from_option_byte(0x55), RdpLevel::Level0_5);
        assert_eq!(RdpLevel::from_option_byte(0xcc), RdpLevel::Level2);
        assert_eq!(RdpLevel::from_option_byte(0x00), RdpLevel::Level1);
        assert_eq!(RdpLevel::from_option_byte(0xbb), RdpLevel::Level1);
    }

    #[test]
    fn only_level0_is_unprotected() {
        assert!(!RdpLevel::Level0.is_read_protected());
        assert!(RdpLevel::Level0_5.is_read_protected());
        assert!(RdpLevel::Level1.is_read_protected());
        assert!(RdpLevel::Level2.is_read_protected());
    }

    #[test]
    fn cell_follows_external_changes() {
        let state = Cell::new(false);
        let accessor = &state;
        assert!(!accessor.is_read_protected());
        state.set(true);
        assert!(accessor.is_read_protected());
    }
}
