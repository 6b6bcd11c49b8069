use usb_device::class_prelude::*;
use usb_device::Result;

use crate::media::DfuMedia;
use crate::protocol::{DfuCore, TRANSFER_SIZE};
use crate::state::DfuHandle;

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xfe;

const DFU_SUBCLASS_FIRMWARE_UPGRADE: u8 = 0x01;

const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

const DFU_TYPE_FUNCTIONAL: u8 = 0x21;
const DFU_WILL_DETACH: u8 = 1 << 3;
const DFU_MANIFESTATION_TOLERANT: u8 = 1 << 2;
const DFU_CAN_UPLOAD: u8 = 1 << 1;
const DFU_CAN_DNLOAD: u8 = 1 << 0;

const DFU_REQ_DETACH: u8 = 0;
const DFU_REQ_DNLOAD: u8 = 1;
const DFU_REQ_UPLOAD: u8 = 2;
const DFU_REQ_GETSTATUS: u8 = 3;
const DFU_REQ_CLRSTATUS: u8 = 4;
const DFU_REQ_GETSTATE: u8 = 5;
const DFU_REQ_ABORT: u8 = 6;

const DFU_DETACH_TIMEOUT_MS: u16 = 255;
const DFU_VERSION: u16 = 0x011a;

/// Body of the DFU functional descriptor.
fn functional_descriptor() -> [u8; 7] {
    let detach_timeout = DFU_DETACH_TIMEOUT_MS.to_le_bytes();
    let transfer_size = TRANSFER_SIZE.to_le_bytes();
    let dfu_version = DFU_VERSION.to_le_bytes();
    [
        (DFU_WILL_DETACH | DFU_CAN_UPLOAD | DFU_CAN_DNLOAD) & !DFU_MANIFESTATION_TOLERANT,  // bmAttributes
        detach_timeout[0], detach_timeout[1],  // wDetachTimeOut
        transfer_size[0], transfer_size[1],  // wTransferSize
        dfu_version[0], dfu_version[1],  // bcdDFUVersion
    ]
}

/// Implementation of DFU mode class.
///
/// Handles DFU requests and forwards erase, program and read operations to
/// the [`DfuMedia`] implementation. Erase and program run from
/// [`UsbClass::poll`] after the host has fetched the poll timeout with
/// DFU_GETSTATUS.
pub struct DfuClass<M: DfuMedia> {
    core: DfuCore<M>,
    iface: InterfaceNumber,
    interface_string: StringIndex,
}

impl<M: DfuMedia> DfuClass<M> {
    /// Create new DFU mode class with the given media, calling its `init`.
    pub fn new<B: UsbBus>(alloc: &UsbBusAllocator<B>, media: M) -> Self {
        Self {
            core: DfuCore::new(media),
            iface: alloc.interface(),
            interface_string: alloc.string(),
        }
    }

    /// Current protocol state.
    pub fn handle(&self) -> &DfuHandle {
        self.core.handle()
    }

    /// Access the media.
    pub fn media(&self) -> &M {
        self.core.media()
    }

    /// Mutable access to the media.
    pub fn media_mut(&mut self) -> &mut M {
        self.core.media_mut()
    }

    /// Returns `true` once the host finished the download or sent DFU_DETACH.
    ///
    /// The application is then expected to reset the device.
    pub fn leave_requested(&self) -> bool {
        self.core.leave_requested()
    }

    /// Deinitialize the media and give it back.
    pub fn release(self) -> M {
        self.core.release()
    }

    fn is_ours(&self, req: &control::Request) -> bool {
        req.request_type == control::RequestType::Class
            && req.recipient == control::Recipient::Interface
            && req.index == u8::from(self.iface) as u16
    }
}

impl<M: DfuMedia, B: UsbBus> UsbClass<B> for DfuClass<M> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.interface_alt(
            self.iface,
            0,
            USB_CLASS_APPLICATION_SPECIFIC,
            DFU_SUBCLASS_FIRMWARE_UPGRADE,
            DFU_PROTOCOL_DFU_MODE,
            Some(self.interface_string))?;

        // DFU Functional Descriptor
        writer.write(DFU_TYPE_FUNCTIONAL, &functional_descriptor())
    }

    fn get_string(&self, index: StringIndex, _lang_id: LangID) -> Option<&str> {
        if index == self.interface_string {
            Some(self.core.media().descriptor())
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.core.usb_reset();
    }

    fn poll(&mut self) {
        self.core.poll();
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();

        if !self.is_ours(&req) {
            return;
        }

        match req.request {
            DFU_REQ_UPLOAD => match self.core.upload(req.value, req.length) {
                Ok(data) => { xfer.accept_with(data).ok(); },
                Err(_) => { xfer.reject().ok(); },
            },
            DFU_REQ_GETSTATUS => {
                let status = self.core.get_status();
                xfer.accept_with(&status).ok();
            },
            DFU_REQ_GETSTATE => {
                xfer.accept_with(&[self.core.get_state()]).ok();
            },
            _ => { xfer.reject().ok(); },
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if !self.is_ours(&req) {
            return;
        }

        let result = match req.request {
            DFU_REQ_DETACH => {
                self.core.detach();
                Ok(())
            },
            DFU_REQ_DNLOAD => self.core.download(req.value, xfer.data()),
            DFU_REQ_CLRSTATUS => self.core.clear_status(),
            DFU_REQ_ABORT => self.core.abort(),
            _ => { xfer.reject().ok(); return; },
        };

        match result {
            Ok(()) => { xfer.accept().ok(); },
            Err(_) => { xfer.reject().ok(); },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb_device::bus::PollResult;
    use usb_device::UsbDirection;

    use crate::media::FlashMedia;
    use crate::memory::{AreaKind, MemoryMap, Region, SliceMemory};
    use crate::layout::INTERNAL_FLASH_DESCRIPTOR;

    struct DummyBus;

    impl UsbBus for DummyBus {
        fn alloc_ep(
            &mut self,
            _ep_dir: UsbDirection,
            _ep_addr: Option<EndpointAddress>,
            _ep_type: EndpointType,
            _max_packet_size: u16,
            _interval: u8,
        ) -> Result<EndpointAddress> {
            Err(UsbError::EndpointOverflow)
        }

        fn enable(&mut self) {}
        fn reset(&self) {}
        fn set_device_address(&self, _addr: u8) {}

        fn write(&self, _ep_addr: EndpointAddress, _buf: &[u8]) -> Result<usize> {
            Err(UsbError::InvalidEndpoint)
        }

        fn read(&self, _ep_addr: EndpointAddress, _buf: &mut [u8]) -> Result<usize> {
            Err(UsbError::InvalidEndpoint)
        }

        fn set_stalled(&self, _ep_addr: EndpointAddress, _stalled: bool) {}
        fn is_stalled(&self, _ep_addr: EndpointAddress) -> bool {
            false
        }
        fn suspend(&self) {}
        fn resume(&self) {}
        fn poll(&self) -> PollResult {
            PollResult::None
        }
    }

    fn request(request_type: control::RequestType, recipient: control::Recipient, index: u16) -> control::Request {
        control::Request {
            direction: UsbDirection::In,
            request_type,
            recipient,
            request: DFU_REQ_GETSTATUS,
            value: 0,
            index,
            length: 6,
        }
    }

    #[test]
    fn functional_descriptor_bytes() {
        let desc = functional_descriptor();
        // willDetach, canUpload and canDnload, not manifestation tolerant
        assert_eq!(desc[0], 0b1011);
        assert_eq!(&desc[1..3], &[0xff, 0x00]);
        assert_eq!(&desc[3..5], &TRANSFER_SIZE.to_le_bytes());
        assert_eq!(&desc[3..5], &[0x80, 0x00]);
        assert_eq!(&desc[5..7], &[0x1a, 0x01]);
    }

    #[test]
    fn requests_are_filtered_by_interface() {
        let alloc = UsbBusAllocator::new(DummyBus);
        let _other = alloc.interface();
        let mut flash = [0u8; 64];
        let mut mem = SliceMemory::new(0x0800_0000, 16, &mut flash);
        let d = mem.descriptor(AreaKind::Flash);
        let dfu = DfuClass::new(&alloc, FlashMedia::new(MemoryMap::new([Region::new(d, &mut mem)]), false));
        let iface = u8::from(dfu.iface) as u16;
        assert_eq!(iface, 1);

        use control::{Recipient, RequestType};
        assert!(dfu.is_ours(&request(RequestType::Class, Recipient::Interface, iface)));
        assert!(!dfu.is_ours(&request(RequestType::Class, Recipient::Interface, 0)));
        assert!(!dfu.is_ours(&request(RequestType::Standard, Recipient::Interface, iface)));
        assert!(!dfu.is_ours(&request(RequestType::Vendor, Recipient::Interface, iface)));
        assert!(!dfu.is_ours(&request(RequestType::Class, Recipient::Device, iface)));
    }

    #[test]
    fn interface_string_is_the_layout() {
        let alloc = UsbBusAllocator::new(DummyBus);
        let mut flash = [0u8; 64];
        let mut mem = SliceMemory::new(0x0800_0000, 16, &mut flash);
        let d = mem.descriptor(AreaKind::Flash);
        let dfu = DfuClass::new(&alloc, FlashMedia::new(MemoryMap::new([Region::new(d, &mut mem)]), false));
        let other = alloc.string();

        let get = |index| UsbClass::<DummyBus>::get_string(&dfu, index, LangID::EN_US);
        assert_eq!(get(dfu.interface_string), Some(INTERNAL_FLASH_DESCRIPTOR));
        assert_eq!(get(other), None);
    }
}
