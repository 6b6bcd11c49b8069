use core::fmt;

/// Kind of memory behind a [`MemoryDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AreaKind {
    /// Internal flash.
    Flash,
    /// SRAM.
    Ram,
    /// Option bytes.
    OptionBytes,
    /// One-time programmable area.
    Otp,
    /// System memory (factory bootloader).
    System,
}

/// Errors reported by the memory-operations layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemoryError {
    /// No region covers the address.
    Unmapped,
    /// The region does not support the operation.
    Unsupported,
    /// Access would run past the end of the region.
    OutOfBounds,
    /// The underlying controller reported a failure.
    Failed,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MemoryError::Unmapped => "address is not mapped to any memory region",
            MemoryError::Unsupported => "operation not supported by memory region",
            MemoryError::OutOfBounds => "access crosses the end of memory region",
            MemoryError::Failed => "memory operation failed",
        };
        f.write_str(msg)
    }
}

/// Address range of a single memory region.
///
/// Both `start` and `end` are inclusive, so `size() == end - start + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryDescriptor {
    /// First address of the region.
    pub start: u32,
    /// Last address of the region.
    pub end: u32,
    /// Region type tag.
    pub kind: AreaKind,
}

impl MemoryDescriptor {
    /// Describe region `[start, end]`.
    pub const fn new(start: u32, end: u32, kind: AreaKind) -> Self {
        Self { start, end, kind }
    }

    /// Size of the region in bytes.
    pub const fn size(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Check if `address` lies in `[start, end]`.
    pub const fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }
}

/// Device-specific operations of a single memory region.
///
/// All addresses are absolute, the implementation is only ever called with
/// addresses that fall inside of its own region.
pub trait Memory {
    /// Read a single byte.
    fn read(&mut self, address: u32) -> u8;

    /// Program `data` starting at `address`.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryError>;

    /// Erase the sector/page containing `address`.
    fn erase(&mut self, address: u32) -> Result<(), MemoryError> {
        let _ = address;
        Err(MemoryError::Unsupported)
    }

    /// Finish work deferred by earlier writes, called once the download
    /// operation has been reported to the host.
    fn post_process(&mut self) {}
}

/// Memory region: address range together with its operations.
pub struct Region<'a> {
    descriptor: MemoryDescriptor,
    ops: &'a mut dyn Memory,
}

impl<'a> Region<'a> {
    /// Bind operations to an address range.
    pub fn new(descriptor: MemoryDescriptor, ops: &'a mut dyn Memory) -> Self {
        Self { descriptor, ops }
    }

    /// Address range of this region.
    pub fn descriptor(&self) -> &MemoryDescriptor {
        &self.descriptor
    }
}

/// Table of all memory regions accessible over DFU.
///
/// Regions are registered at construction and never change afterwards.
pub struct MemoryMap<'a, const N: usize> {
    regions: [Region<'a>; N],
}

impl<'a, const N: usize> MemoryMap<'a, N> {
    /// Create memory map from a set of regions.
    pub fn new(regions: [Region<'a>; N]) -> Self {
        Self { regions }
    }

    /// Iterate over all registered descriptors.
    pub fn descriptors(&self) -> Descriptors<'_, 'a> {
        Descriptors { regions: self.regions.iter() }
    }

    /// Find descriptor of the region containing `address`.
    pub fn descriptor(&self, address: u32) -> Option<&MemoryDescriptor> {
        self.descriptors().find(|d| d.contains(address))
    }

    /// Kind of area the address belongs to, `None` if it is not mapped.
    pub fn address_area(&self, address: u32) -> Option<AreaKind> {
        self.descriptor(address).map(|d| d.kind)
    }

    fn region_mut(&mut self, address: u32) -> Result<&mut Region<'a>, MemoryError> {
        self.regions
            .iter_mut()
            .find(|r| r.descriptor.contains(address))
            .ok_or(MemoryError::Unmapped)
    }

    /// Erase the sector containing `address`.
    pub fn erase(&mut self, address: u32) -> Result<(), MemoryError> {
        let region = self.region_mut(address)?;
        trace!("erase {=u32:#x}", address);
        region.ops.erase(address)
    }

    /// Program `data` at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        let region = self.region_mut(address)?;
        trace!("write {=u32:#x} len={=usize}", address, data.len());
        region.ops.write(address, data)
    }

    /// Run deferred work of every region.
    pub fn post_process(&mut self) {
        for region in self.regions.iter_mut() {
            region.ops.post_process();
        }
    }

    /// Fill `dest` with memory contents starting at `address`.
    ///
    /// Every byte is looked up separately, bytes outside of all regions read as `0`.
    pub fn read<'b>(&mut self, address: u32, dest: &'b mut [u8]) -> &'b [u8] {
        for (i, byte) in dest.iter_mut().enumerate() {
            let addr = address.wrapping_add(i as u32);
            *byte = match self.region_mut(addr) {
                Ok(region) => region.ops.read(addr),
                Err(_) => 0,
            };
        }
        dest
    }
}

/// Iterator over descriptors of a [`MemoryMap`].
pub struct Descriptors<'s, 'a> {
    regions: core::slice::Iter<'s, Region<'a>>,
}

impl<'s> Iterator for Descriptors<'s, '_> {
    type Item = &'s MemoryDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        self.regions.next().map(|r| &r.descriptor)
    }
}

/// Memory region backed by a byte slice.
///
/// Useful for exposing RAM areas, or to emulate flash: erase resets a whole
/// page to `0xff`.
pub struct SliceMemory<'a> {
    base: u32,
    page_size: u32,
    bytes: &'a mut [u8],
}

impl<'a> SliceMemory<'a> {
    /// Map `bytes` at address `base`, erasing `page_size` bytes at a time.
    ///
    /// A `page_size` of 0 makes the region non-erasable.
    pub fn new(base: u32, page_size: u32, bytes: &'a mut [u8]) -> Self {
        Self { base, page_size, bytes }
    }

    /// Descriptor covering the whole slice.
    ///
    /// The end is clamped to `u32::MAX`. An empty slice still yields a single
    /// address range `[base, base]`, every access to it fails as unmapped.
    pub fn descriptor(&self, kind: AreaKind) -> MemoryDescriptor {
        let last = (self.bytes.len() as u32).saturating_sub(1);
        MemoryDescriptor::new(self.base, self.base.saturating_add(last), kind)
    }

    /// Underlying contents.
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    fn offset(&self, address: u32) -> Result<usize, MemoryError> {
        address
            .checked_sub(self.base)
            .map(|o| o as usize)
            .filter(|&o| o < self.bytes.len())
            .ok_or(MemoryError::Unmapped)
    }
}

impl Memory for SliceMemory<'_> {
    fn read(&mut self, address: u32) -> u8 {
        self.offset(address).map(|o| self.bytes[o]).unwrap_or(0)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        let offset = self.offset(address)?;
        let dest = self
            .bytes
            .get_mut(offset..offset + data.len())
            .ok_or(MemoryError::OutOfBounds)?;
        dest.copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, address: u32) -> Result<(), MemoryError> {
        if self.page_size == 0 {
            return Err(MemoryError::Unsupported);
        }
        let offset = self.offset(address)?;
        let page = self.page_size as usize;
        let start = offset - offset % page;
        let end = (start + page).min(self.bytes.len());
        self.bytes[start..end].fill(0xff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_bounds_are_inclusive() {
        let d = MemoryDescriptor::new(0x0800_0000, 0x0803_ffff, AreaKind::Flash);
        assert_eq!(d.size(), 0x4_0000);
        assert!(d.contains(0x0800_0000));
        assert!(d.contains(0x0803_ffff));
        assert!(!d.contains(0x0804_0000));
        assert!(!d.contains(0x07ff_ffff));
    }

    #[test]
    fn address_area_lookup() {
        let mut flash = [0u8; 64];
        let mut ob = [0u8; 8];
        let mut flash = SliceMemory::new(0x0800_0000, 16, &mut flash);
        let mut ob = SliceMemory::new(0x4002_2040, 0, &mut ob);
        let fd = flash.descriptor(AreaKind::Flash);
        let od = ob.descriptor(AreaKind::OptionBytes);
        let map = MemoryMap::new([Region::new(fd, &mut flash), Region::new(od, &mut ob)]);

        assert_eq!(map.address_area(0x0800_0010), Some(AreaKind::Flash));
        assert_eq!(map.address_area(0x4002_2047), Some(AreaKind::OptionBytes));
        assert_eq!(map.address_area(0x4002_2048), None);
        assert_eq!(map.address_area(0x0800_0040), None);
        assert_eq!(map.descriptors().count(), 2);
    }

    #[test]
    fn erase_dispatches_to_owning_region() {
        let mut flash = [0u8; 64];
        let mut ob = [0x11u8; 8];
        {
            let mut f = SliceMemory::new(0x0800_0000, 16, &mut flash);
            let mut o = SliceMemory::new(0x4002_2040, 0, &mut ob);
            let fd = f.descriptor(AreaKind::Flash);
            let od = o.descriptor(AreaKind::OptionBytes);
            let mut map = MemoryMap::new([Region::new(fd, &mut f), Region::new(od, &mut o)]);

            assert_eq!(map.erase(0x0800_0013), Ok(()));
            assert_eq!(map.erase(0x4002_2040), Err(MemoryError::Unsupported));
            assert_eq!(map.erase(0x2000_0000), Err(MemoryError::Unmapped));
        }
        assert!(flash[..16].iter().all(|&b| b == 0));
        assert!(flash[16..32].iter().all(|&b| b == 0xff));
        assert!(flash[32..].iter().all(|&b| b == 0));
        assert_eq!(ob, [0x11; 8]);
    }

    #[test]
    fn write_and_read_back() {
        let mut ram = [0u8; 32];
        let mut r = SliceMemory::new(0x2000_0000, 0, &mut ram);
        let d = r.descriptor(AreaKind::Ram);
        let mut map = MemoryMap::new([Region::new(d, &mut r)]);

        map.write(0x2000_0004, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            map.write(0x2000_001e, &[1, 2, 3, 4]),
            Err(MemoryError::OutOfBounds)
        );

        let mut buf = [0xaa; 6];
        let data = map.read(0x2000_0003, &mut buf);
        assert_eq!(data, &[0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn empty_slice_at_zero() {
        let mut empty = [0u8; 0];
        let mut m = SliceMemory::new(0, 16, &mut empty);
        let d = m.descriptor(AreaKind::Ram);
        assert_eq!((d.start, d.end), (0, 0));
        assert_eq!(m.write(0, &[1]), Err(MemoryError::Unmapped));
        assert_eq!(m.erase(0), Err(MemoryError::Unmapped));
        assert_eq!(m.read(0), 0);
    }

    #[test]
    fn slice_at_top_of_address_space() {
        let mut bytes = [0u8; 16];
        let m = SliceMemory::new(0xffff_fff8, 0, &mut bytes);
        assert_eq!(m.descriptor(AreaKind::Ram).end, u32::MAX);
    }

    #[test]
    fn descriptors_in_registration_order() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut a = SliceMemory::new(0x2000_0000, 0, &mut a);
        let mut b = SliceMemory::new(0x1000_0000, 0, &mut b);
        let (da, db) = (a.descriptor(AreaKind::Ram), b.descriptor(AreaKind::Otp));
        let map = MemoryMap::new([Region::new(da, &mut a), Region::new(db, &mut b)]);

        let starts: Vec<u32> = map.descriptors().map(|d| d.start).collect();
        assert_eq!(starts, [0x2000_0000, 0x1000_0000]);
        assert_eq!(map.descriptor(0x1000_0003), Some(&db));
    }

    #[test]
    fn unmapped_bytes_read_as_zero() {
        let mut ram = [0x5au8; 4];
        let mut r = SliceMemory::new(0x2000_0000, 0, &mut ram);
        let d = r.descriptor(AreaKind::Ram);
        let mut map = MemoryMap::new([Region::new(d, &mut r)]);

        let mut buf = [0xff; 6];
        assert_eq!(map.read(0x2000_0002, &mut buf), &[0x5a, 0x5a, 0, 0, 0, 0]);
    }
}
