use core::cmp::min;

use crate::layout::MediaLayout;
use crate::media::{DfuMedia, MediaCommand, MediaError};
use crate::state::{DfuHandle, DfuState, DfuStatusCode};

/// Size of a single DNLOAD/UPLOAD block (`wTransferSize`).
///
/// Must not exceed the control endpoint buffer of `usb-device`.
pub const TRANSFER_SIZE: u16 = 128;

const CMD_GET_COMMANDS: u8 = 0x00;
const CMD_SET_ADDRESS_POINTER: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;

const SUPPORTED_COMMANDS: [u8; 3] = [CMD_GET_COMMANDS, CMD_SET_ADDRESS_POINTER, CMD_ERASE];

/// Request has been refused, the control transfer must be stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stall;

/// DFU mode state machine, independent of the USB transport.
pub(crate) struct DfuCore<M: DfuMedia> {
    media: M,
    handle: DfuHandle,
    buffer: [u8; TRANSFER_SIZE as usize],
    initial_address: u32,
    pending: bool,
    leave: bool,
}

impl<M: DfuMedia> DfuCore<M> {
    pub fn new(mut media: M) -> Self {
        if let Err(_e) = media.init() {
            warn!("media init failed: {}", _e);
        }
        let initial_address = MediaLayout::parse(media.descriptor())
            .map(|l| l.address())
            .unwrap_or(0);
        Self {
            media,
            handle: DfuHandle::new(initial_address),
            buffer: [0; TRANSFER_SIZE as usize],
            initial_address,
            pending: false,
            leave: false,
        }
    }

    pub fn media(&self) -> &M {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut M {
        &mut self.media
    }

    pub fn handle(&self) -> &DfuHandle {
        &self.handle
    }

    pub fn leave_requested(&self) -> bool {
        self.leave
    }

    pub fn release(mut self) -> M {
        if let Err(_e) = self.media.deinit() {
            warn!("media deinit failed: {}", _e);
        }
        self.media
    }

    fn stall(&mut self) -> Stall {
        self.handle.set_state(DfuState::Error, DfuStatusCode::ErrStalledPkt);
        Stall
    }

    fn block_address(&self, block_num: u16) -> Option<u32> {
        let offset = u32::from(block_num.checked_sub(2)?) * u32::from(TRANSFER_SIZE);
        self.handle.address_pointer().checked_add(offset)
    }

    /// DFU_DNLOAD with `wValue = block_num`.
    pub fn download(&mut self, block_num: u16, data: &[u8]) -> Result<(), Stall> {
        let state = self.handle.state();
        if !matches!(state, DfuState::Idle | DfuState::DnloadIdle) {
            return Err(self.stall());
        }

        if data.is_empty() {
            if state != DfuState::DnloadIdle {
                return Err(self.stall());
            }
            debug!("download complete");
            self.handle.set_block(0, 0);
            self.handle.set_state(DfuState::ManifestSync, DfuStatusCode::Ok);
            return Ok(());
        }

        let valid = match block_num {
            0 => matches!(
                (data[0], data.len()),
                (CMD_SET_ADDRESS_POINTER, 5) | (CMD_ERASE, 5)
            ),
            1 => false,
            _ => data.len() <= self.buffer.len(),
        };
        if !valid {
            return Err(self.stall());
        }

        self.buffer[..data.len()].copy_from_slice(data);
        self.handle.set_block(block_num, data.len() as u16);
        self.handle.set_state(DfuState::DnloadSync, DfuStatusCode::Ok);
        Ok(())
    }

    /// DFU_UPLOAD with `wValue = block_num` and `wLength = length`.
    ///
    /// A zero-length reply means the request has been rejected by the media.
    pub fn upload(&mut self, block_num: u16, length: u16) -> Result<&[u8], Stall> {
        if !matches!(self.handle.state(), DfuState::Idle | DfuState::UploadIdle) || length == 0 {
            return Err(self.stall());
        }
        self.handle.set_block(block_num, length);

        match block_num {
            0 => {
                let len = min(length as usize, SUPPORTED_COMMANDS.len());
                let state = if length as usize > SUPPORTED_COMMANDS.len() {
                    DfuState::Idle
                } else {
                    DfuState::UploadIdle
                };
                self.handle.set_state(state, DfuStatusCode::Ok);
                self.buffer[..len].copy_from_slice(&SUPPORTED_COMMANDS[..len]);
                Ok(&self.buffer[..len])
            }
            1 => Err(self.stall()),
            _ => {
                let Some(address) = self.block_address(block_num) else {
                    self.handle.set_state(DfuState::Error, DfuStatusCode::ErrAddress);
                    return Err(Stall);
                };
                self.handle.set_state(DfuState::UploadIdle, DfuStatusCode::Ok);
                let len = min(length, TRANSFER_SIZE) as usize;
                let data = self.media.read(&mut self.handle, address, &mut self.buffer[..len]);
                if self.handle.state() == DfuState::Error {
                    Ok(&[])
                } else {
                    Ok(data)
                }
            }
        }
    }

    /// DFU_GETSTATUS, returns the 6-byte reply.
    pub fn get_status(&mut self) -> [u8; 6] {
        match self.handle.state() {
            DfuState::DnloadSync if self.handle.length() != 0 => {
                self.handle.set_state(DfuState::DnloadBusy, DfuStatusCode::Ok);
                let erase = self.handle.block_num() == 0 && self.buffer[0] == CMD_ERASE;
                let command = if erase { MediaCommand::Erase } else { MediaCommand::Program };
                let address = self.handle.address_pointer();
                if let Err(_e) = self.media.get_status(address, command, self.handle.status_mut()) {
                    warn!("media status failed: {}", _e);
                }
                self.pending = true;
            }
            DfuState::DnloadSync => {
                // completion has been reported, run deferred media work
                self.handle.set_state(DfuState::DnloadIdle, DfuStatusCode::Ok);
                self.pending = true;
            }
            DfuState::ManifestSync => {
                self.handle.set_state(DfuState::Manifest, DfuStatusCode::Ok);
                self.pending = true;
            }
            _ => {}
        }
        *self.handle.status()
    }

    /// DFU_GETSTATE.
    pub fn get_state(&self) -> u8 {
        self.handle.state() as u8
    }

    /// DFU_CLRSTATUS.
    pub fn clear_status(&mut self) -> Result<(), Stall> {
        if self.handle.state() != DfuState::Error {
            return Err(self.stall());
        }
        self.handle.set_block(0, 0);
        self.handle.set_state(DfuState::Idle, DfuStatusCode::Ok);
        self.pending = false;
        Ok(())
    }

    fn can_abort(&self) -> bool {
        matches!(
            self.handle.state(),
            DfuState::Idle
                | DfuState::DnloadSync
                | DfuState::DnloadIdle
                | DfuState::ManifestSync
                | DfuState::UploadIdle
        )
    }

    /// DFU_ABORT.
    pub fn abort(&mut self) -> Result<(), Stall> {
        if !self.can_abort() {
            return Err(Stall);
        }
        self.handle.set_block(0, 0);
        self.handle.set_state(DfuState::Idle, DfuStatusCode::Ok);
        self.pending = false;
        Ok(())
    }

    /// DFU_DETACH: abort any transfer and ask the application to leave DFU mode.
    pub fn detach(&mut self) {
        if self.can_abort() {
            self.handle.set_block(0, 0);
            self.handle.set_state(DfuState::Idle, DfuStatusCode::Ok);
            self.pending = false;
        }
        self.leave = true;
    }

    /// USB bus reset restarts the protocol.
    pub fn usb_reset(&mut self) {
        self.handle = DfuHandle::new(self.initial_address);
        self.pending = false;
    }

    /// Run the operation scheduled by the last DFU_GETSTATUS.
    pub fn poll(&mut self) {
        if !self.pending {
            return;
        }
        self.pending = false;

        match self.handle.state() {
            DfuState::DnloadBusy => {
                let result = match self.handle.block_num() {
                    0 => self.run_command(),
                    block_num => match self.block_address(block_num) {
                        Some(address) => {
                            let len = self.handle.length() as usize;
                            self.media.write(&mut self.handle, &self.buffer[..len], address)
                        }
                        None => Err(MediaError::AddressOutOfRange),
                    },
                };
                match result {
                    Ok(()) => {
                        self.handle.set_block(0, 0);
                        self.handle.set_state(DfuState::DnloadSync, DfuStatusCode::Ok);
                    }
                    Err(e) => self.fail(e),
                }
            }
            DfuState::DnloadIdle => self.media.post_process(),
            DfuState::Manifest => {
                debug!("manifestation done, waiting for reset");
                self.handle.set_state(DfuState::ManifestWaitReset, DfuStatusCode::Ok);
                self.leave = true;
            }
            _ => {}
        }
    }

    fn run_command(&mut self) -> Result<(), MediaError> {
        let [command, a0, a1, a2, a3] = [
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ];
        let address = u32::from_le_bytes([a0, a1, a2, a3]);
        self.handle.set_address_pointer(address);
        match command {
            CMD_SET_ADDRESS_POINTER => {
                debug!("address pointer {=u32:#x}", address);
                Ok(())
            }
            _ => self.media.erase(&mut self.handle, address),
        }
    }

    fn fail(&mut self, e: MediaError) {
        // NACK helpers already moved the protocol to the error state
        if self.handle.state() != DfuState::DnloadBusy {
            return;
        }
        warn!("download failed: {}", e);
        let status = match e {
            MediaError::ReadProtected => DfuStatusCode::ErrVendor,
            MediaError::AddressOutOfRange => DfuStatusCode::ErrAddress,
            MediaError::Memory(_) if self.handle.block_num() == 0 => DfuStatusCode::ErrErase,
            MediaError::Memory(_) => DfuStatusCode::ErrProg,
        };
        self.handle.set_state(DfuState::Error, status);
    }
}
