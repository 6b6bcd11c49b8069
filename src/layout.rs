//! Parser for the DFU memory-layout string advertised as the interface descriptor.
//!
//! The string has the form `@<name>/<address>/<area>[,<area>...]` where each area
//! is `<count>*<size><unit><flags>`:
//!
//! * `unit` - ` ` or `B` for bytes, `K` for KiB, `M` for MiB
//! * `flags` - letter `a`..`g`, a bitmask of readable (1), erasable (2) and writable (4)
//!   offset from `a`, e.g. `a` is read-only and `g` allows everything

use core::fmt;
use core::str::Split;

use crate::memory::{AreaKind, MemoryDescriptor};

/// Layout string of the internal flash: 40 KiB read-only followed by 472 KiB of
/// readable, erasable and writable pages.
pub const INTERNAL_FLASH_DESCRIPTOR: &str = "@Internal Flash   /0x08000000/20*002Ka,236*002Kg";

/// Errors detected while parsing a layout string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayoutError {
    /// String does not start with `@`.
    MissingAt,
    /// Name, address or area list is missing.
    MissingField,
    /// Start address is not a hex number.
    BadAddress,
    /// Area is not `<count>*<size><unit><flags>`.
    BadArea,
    /// Unknown size unit.
    BadUnit,
    /// Access flags outside of `a`..`g`.
    BadFlags,
    /// Layout does not cover a single byte.
    Empty,
    /// Sizes do not fit in the 32-bit address space.
    Overflow,
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LayoutError::MissingAt => "layout string must start with '@'",
            LayoutError::MissingField => "layout string is missing a field",
            LayoutError::BadAddress => "invalid start address",
            LayoutError::BadArea => "invalid area definition",
            LayoutError::BadUnit => "invalid size unit",
            LayoutError::BadFlags => "invalid access flags",
            LayoutError::Empty => "layout has zero size",
            LayoutError::Overflow => "layout exceeds the address space",
        };
        f.write_str(msg)
    }
}

/// Operations allowed on a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Access {
    /// Segment can be uploaded.
    pub readable: bool,
    /// Segment can be erased.
    pub erasable: bool,
    /// Segment can be downloaded.
    pub writable: bool,
}

impl Access {
    fn from_flag(flag: u8) -> Result<Self, LayoutError> {
        if !(b'a'..=b'g').contains(&flag) {
            return Err(LayoutError::BadFlags);
        }
        let bits = flag - b'a' + 1;
        Ok(Self {
            readable: bits & 0x1 != 0,
            erasable: bits & 0x2 != 0,
            writable: bits & 0x4 != 0,
        })
    }
}

/// Run of `count` equally sized sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Segment {
    /// Number of sectors.
    pub count: u32,
    /// Size of each sector in bytes.
    pub size: u32,
    /// Allowed operations.
    pub access: Access,
}

impl Segment {
    /// Total size of the segment in bytes, saturating at `u32::MAX`.
    pub const fn len(&self) -> u32 {
        self.count.saturating_mul(self.size)
    }

    /// Returns `true` if the segment has no sectors.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn parse(area: &str) -> Result<Self, LayoutError> {
        let (count, rest) = area.split_once('*').ok_or(LayoutError::BadArea)?;
        let count: u32 = count.trim().parse().map_err(|_| LayoutError::BadArea)?;

        let bytes = rest.as_bytes();
        let [digits @ .., unit, flag] = bytes else {
            return Err(LayoutError::BadArea);
        };
        let multiplier = match *unit {
            b' ' | b'B' => 1,
            b'K' => 1024,
            b'M' => 1024 * 1024,
            _ => return Err(LayoutError::BadUnit),
        };
        let size: u32 = core::str::from_utf8(digits)
            .map_err(|_| LayoutError::BadArea)?
            .parse()
            .map_err(|_| LayoutError::BadArea)?;

        let access = Access::from_flag(*flag)?;
        let size = size.checked_mul(multiplier).ok_or(LayoutError::Overflow)?;
        count.checked_mul(size).ok_or(LayoutError::Overflow)?;

        Ok(Self { count, size, access })
    }
}

/// Parsed memory layout string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaLayout<'a> {
    name: &'a str,
    address: u32,
    size: u32,
    areas: &'a str,
}

impl<'a> MediaLayout<'a> {
    /// Parse the header and validate all areas.
    ///
    /// The layout must cover at least one byte and end within the 32-bit
    /// address space.
    pub fn parse(s: &'a str) -> Result<Self, LayoutError> {
        let s = s.strip_prefix('@').ok_or(LayoutError::MissingAt)?;
        let mut fields = s.splitn(3, '/');
        let name = fields.next().ok_or(LayoutError::MissingField)?;
        let address = fields.next().ok_or(LayoutError::MissingField)?;
        let areas = fields.next().ok_or(LayoutError::MissingField)?;
        if areas.is_empty() {
            return Err(LayoutError::MissingField);
        }

        let hex = address
            .trim()
            .strip_prefix("0x")
            .or_else(|| address.trim().strip_prefix("0X"))
            .ok_or(LayoutError::BadAddress)?;
        let address = u32::from_str_radix(hex, 16).map_err(|_| LayoutError::BadAddress)?;

        let mut layout = Self { name: name.trim_end(), address, size: 0, areas };
        for segment in layout.segments() {
            layout.size = layout.size.checked_add(segment?.len()).ok_or(LayoutError::Overflow)?;
        }
        if layout.size == 0 {
            return Err(LayoutError::Empty);
        }
        address.checked_add(layout.size - 1).ok_or(LayoutError::Overflow)?;
        Ok(layout)
    }

    /// Region name with trailing padding removed.
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Start address of the first segment.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Iterate over segments in address order.
    pub fn segments(&self) -> Segments<'a> {
        Segments { areas: self.areas.split(',') }
    }

    /// Total size of all segments in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Descriptor covering the whole advertised region.
    pub fn descriptor(&self, kind: AreaKind) -> MemoryDescriptor {
        MemoryDescriptor::new(self.address, self.address + (self.size - 1), kind)
    }
}

/// Iterator over segments of a [`MediaLayout`].
pub struct Segments<'a> {
    areas: Split<'a, char>,
}

impl Iterator for Segments<'_> {
    type Item = Result<Segment, LayoutError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.areas.next().map(Segment::parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_flash_layout() {
        let layout = MediaLayout::parse(INTERNAL_FLASH_DESCRIPTOR).unwrap();
        assert_eq!(layout.name(), "Internal Flash");
        assert_eq!(layout.address(), 0x0800_0000);

        let segments: Vec<_> = layout.segments().map(Result::unwrap).collect();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].count, 20);
        assert_eq!(segments[0].size, 2048);
        assert_eq!(
            segments[0].access,
            Access { readable: true, erasable: false, writable: false }
        );
        assert_eq!(segments[1].count, 236);
        assert_eq!(segments[1].size, 2048);
        assert_eq!(
            segments[1].access,
            Access { readable: true, erasable: true, writable: true }
        );

        assert_eq!(layout.size(), 512 * 1024);
        let d = layout.descriptor(AreaKind::Flash);
        assert_eq!(d.start, 0x0800_0000);
        assert_eq!(d.end, 0x0807_ffff);
    }

    #[test]
    fn units_and_flags() {
        let layout = MediaLayout::parse("@RAM/0x20000000/4*128 e,1*1Mb").unwrap();
        let segments: Vec<_> = layout.segments().map(Result::unwrap).collect();
        assert_eq!(segments[0].len(), 512);
        assert_eq!(
            segments[0].access,
            Access { readable: true, erasable: false, writable: true }
        );
        assert_eq!(segments[1].size, 1024 * 1024);
        assert_eq!(
            segments[1].access,
            Access { readable: false, erasable: true, writable: false }
        );
    }

    #[test]
    fn malformed_strings() {
        assert_eq!(MediaLayout::parse("Flash/0x0/1*1Ka"), Err(LayoutError::MissingAt));
        assert_eq!(MediaLayout::parse("@Flash/0x0"), Err(LayoutError::MissingField));
        assert_eq!(MediaLayout::parse("@Flash/0x0/"), Err(LayoutError::MissingField));
        assert_eq!(MediaLayout::parse("@Flash/08000000/1*1Ka"), Err(LayoutError::BadAddress));
        assert_eq!(MediaLayout::parse("@Flash/0x0/1x1Ka"), Err(LayoutError::BadArea));
        assert_eq!(MediaLayout::parse("@Flash/0x0/1*1Ga"), Err(LayoutError::BadUnit));
        assert_eq!(MediaLayout::parse("@Flash/0x0/1*1Kz"), Err(LayoutError::BadFlags));
    }

    #[test]
    fn oversized_areas_are_rejected() {
        assert_eq!(
            MediaLayout::parse("@F/0x08000000/1*5000Ma"),
            Err(LayoutError::Overflow)
        );
        assert_eq!(
            MediaLayout::parse("@F/0x08000000/4096*1Ma"),
            Err(LayoutError::Overflow)
        );
        assert_eq!(
            MediaLayout::parse("@F/0x08000000/2048*1Ma,2048*1Ma"),
            Err(LayoutError::Overflow)
        );
        assert_eq!(
            MediaLayout::parse("@F/0xf8000000/256*1Ma"),
            Err(LayoutError::Overflow)
        );
    }

    #[test]
    fn empty_layouts_are_rejected() {
        assert_eq!(MediaLayout::parse("@F/0x08000000/0*2Ka"), Err(LayoutError::Empty));
        assert_eq!(MediaLayout::parse("@F/0x08000000/4*0Ka,0*1Kg"), Err(LayoutError::Empty));
    }

    #[test]
    fn layout_reaching_end_of_address_space() {
        let layout = MediaLayout::parse("@F/0xff000000/16*1Mg").unwrap();
        assert_eq!(layout.size(), 0x0100_0000);
        assert_eq!(layout.descriptor(AreaKind::Flash).end, u32::MAX);
    }

    #[test]
    fn segment_len_saturates() {
        let segment = Segment {
            count: u32::MAX,
            size: 2,
            access: Access { readable: true, erasable: true, writable: true },
        };
        assert_eq!(segment.len(), u32::MAX);
    }
}
