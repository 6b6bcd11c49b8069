use crate::media::MediaError;

/// DFU device state (`bState`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuState {
    /// Running the application.
    AppIdle = 0,
    /// Application received DFU_DETACH and waits for USB reset.
    AppDetach = 1,
    /// Waiting for requests in DFU mode.
    Idle = 2,
    /// Block received, waiting for DFU_GETSTATUS.
    DnloadSync = 3,
    /// Block is being programmed or erased.
    DnloadBusy = 4,
    /// Download in progress, expecting DFU_DNLOAD.
    DnloadIdle = 5,
    /// Final block received, waiting for DFU_GETSTATUS to start manifestation.
    ManifestSync = 6,
    /// Manifestation in progress.
    Manifest = 7,
    /// Manifestation done, waiting for reset.
    ManifestWaitReset = 8,
    /// Upload in progress, expecting DFU_UPLOAD.
    UploadIdle = 9,
    /// Error, waiting for DFU_CLRSTATUS.
    Error = 10,
}

/// DFU status code (`bStatus`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuStatusCode {
    /// No error.
    Ok = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File fails vendor-specific verification.
    ErrFile = 0x02,
    /// Unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Address out of range.
    ErrAddress = 0x08,
    /// Zero-length download before all data was received.
    ErrNotDone = 0x09,
    /// Firmware is corrupt.
    ErrFirmware = 0x0a,
    /// Vendor-specific error.
    ErrVendor = 0x0b,
    /// Unexpected USB reset.
    ErrUsbReset = 0x0c,
    /// Unexpected power on reset.
    ErrPowerOnReset = 0x0d,
    /// Unknown error.
    ErrUnknown = 0x0e,
    /// Unexpected request was stalled.
    ErrStalledPkt = 0x0f,
}

/// Byte offsets inside of the DFU_GETSTATUS reply.
const STATUS: usize = 0;
const POLL_TIMEOUT: core::ops::Range<usize> = 1..4;
const STATE: usize = 4;
const STRING: usize = 5;

/// Protocol state owned by the DFU class.
///
/// The media interface receives it with every call so that it can reject
/// a request by moving the protocol into the error state (a "NACK").
#[derive(Debug, Clone)]
pub struct DfuHandle {
    state: DfuState,
    status: [u8; 6],
    block_num: u16,
    length: u16,
    address_pointer: u32,
}

impl DfuHandle {
    /// Create handle in `dfuIDLE` with the address pointer at `address`.
    pub fn new(address: u32) -> Self {
        let mut handle = Self {
            state: DfuState::Idle,
            status: [0; 6],
            block_num: 0,
            length: 0,
            address_pointer: address,
        };
        handle.set_state(DfuState::Idle, DfuStatusCode::Ok);
        handle
    }

    /// Current state.
    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Current status code.
    pub fn status_code(&self) -> u8 {
        self.status[STATUS]
    }

    /// The 6-byte DFU_GETSTATUS reply.
    pub fn status(&self) -> &[u8; 6] {
        &self.status
    }

    /// Mutable access to the DFU_GETSTATUS reply, used to fill in the poll timeout.
    pub fn status_mut(&mut self) -> &mut [u8; 6] {
        &mut self.status
    }

    /// Poll timeout currently reported to the host, in milliseconds.
    pub fn poll_timeout(&self) -> u32 {
        let t = &self.status[POLL_TIMEOUT];
        u32::from_le_bytes([t[0], t[1], t[2], 0])
    }

    /// Block number (`wValue`) of the request being processed.
    pub fn block_num(&self) -> u16 {
        self.block_num
    }

    /// Length (`wLength`) of the request being processed.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Current address pointer.
    pub fn address_pointer(&self) -> u32 {
        self.address_pointer
    }

    pub(crate) fn set_address_pointer(&mut self, address: u32) {
        self.address_pointer = address;
    }

    /// Record the block being transferred.
    pub fn set_block(&mut self, block_num: u16, length: u16) {
        self.block_num = block_num;
        self.length = length;
    }

    /// Switch to `state` and report `status`, clearing poll timeout.
    pub fn set_state(&mut self, state: DfuState, status: DfuStatusCode) {
        self.state = state;
        self.status[STATUS] = status as u8;
        self.status[POLL_TIMEOUT].fill(0);
        self.status[STATE] = state as u8;
        self.status[STRING] = 0;
    }

    fn fail(&mut self, status: DfuStatusCode) {
        self.set_state(DfuState::Error, status);
    }

    /// Reject a download to an address outside of every memory region.
    ///
    /// Only changes state while a block is being processed (`dfuDNBUSY`).
    pub fn address_nack(&mut self) -> MediaError {
        if self.state == DfuState::DnloadBusy {
            warn!("address nack");
            self.fail(DfuStatusCode::ErrTarget);
        }
        MediaError::AddressOutOfRange
    }

    /// Reject a download because the device is read-protected.
    ///
    /// Only changes state while a block is being processed (`dfuDNBUSY`).
    pub fn dnload_rdp_nack(&mut self) -> MediaError {
        if self.state == DfuState::DnloadBusy {
            warn!("download rdp nack");
            self.fail(DfuStatusCode::ErrVendor);
        }
        MediaError::ReadProtected
    }

    /// Reject an upload because the device is read-protected.
    ///
    /// Fires only in `dfuIDLE`/`dfuUPLOAD-IDLE` and when the block number is
    /// above 1. Returns `true` if the protocol moved to the error state, the
    /// class then answers the request with a zero-length packet.
    pub fn upload_rdp_nack(&mut self) -> bool {
        let uploading = matches!(self.state, DfuState::Idle | DfuState::UploadIdle);
        if uploading && self.block_num > 1 {
            warn!("upload rdp nack, block {=u16}", self.block_num);
            self.fail(DfuStatusCode::ErrVendor);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_handle_is_idle() {
        let h = DfuHandle::new(0x0800_0000);
        assert_eq!(h.state(), DfuState::Idle);
        assert_eq!(h.status(), &[0, 0, 0, 0, 2, 0]);
        assert_eq!(h.address_pointer(), 0x0800_0000);
    }

    #[test]
    fn address_nack_only_while_busy() {
        let mut h = DfuHandle::new(0);
        assert_eq!(h.address_nack(), MediaError::AddressOutOfRange);
        assert_eq!(h.state(), DfuState::Idle);

        h.set_state(DfuState::DnloadBusy, DfuStatusCode::Ok);
        h.status_mut()[1] = 50;
        assert_eq!(h.address_nack(), MediaError::AddressOutOfRange);
        assert_eq!(h.state(), DfuState::Error);
        assert_eq!(h.status(), &[0x01, 0, 0, 0, 10, 0]);
    }

    #[test]
    fn dnload_rdp_nack_reports_vendor_error() {
        let mut h = DfuHandle::new(0);
        h.set_state(DfuState::DnloadBusy, DfuStatusCode::Ok);
        assert_eq!(h.dnload_rdp_nack(), MediaError::ReadProtected);
        assert_eq!(h.status(), &[0x0b, 0, 0, 0, 10, 0]);
    }

    #[test]
    fn upload_rdp_nack_skips_first_block() {
        let mut h = DfuHandle::new(0);
        h.set_block(1, 64);
        assert!(!h.upload_rdp_nack());
        assert_eq!(h.state(), DfuState::Idle);

        h.set_state(DfuState::UploadIdle, DfuStatusCode::Ok);
        h.set_block(2, 64);
        assert!(h.upload_rdp_nack());
        assert_eq!(h.state(), DfuState::Error);
        assert_eq!(h.status_code(), DfuStatusCode::ErrVendor as u8);
    }

    #[test]
    fn upload_rdp_nack_ignored_outside_upload_states() {
        let mut h = DfuHandle::new(0);
        h.set_state(DfuState::DnloadIdle, DfuStatusCode::Ok);
        h.set_block(5, 64);
        assert!(!h.upload_rdp_nack());
        assert_eq!(h.state(), DfuState::DnloadIdle);
    }

    #[test]
    fn poll_timeout_is_little_endian() {
        let mut h = DfuHandle::new(0);
        h.status_mut()[1..4].copy_from_slice(&[0x32, 0x01, 0x00]);
        assert_eq!(h.poll_timeout(), 0x132);
    }
}
