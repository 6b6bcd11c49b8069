#![no_std]
#![no_main]

use cortex_m::peripheral::{SCB, syst::SystClkSource};
use panic_halt as _;
use cortex_m_rt::entry;
use stm32f0xx_hal as hal;
use hal::{prelude::*, pac};
use usb_device::{device::{UsbVidPid, UsbDeviceBuilder}, prelude::StringDescriptors};
use usbd_dfu_media::{
    AreaKind, DfuClass, FlashGeometry, FlashMedia, MediaConfig, MediaLayout, Memory, MemoryDescriptor,
    MemoryError, MemoryMap, RdpLevel, Region,
};

// stm32f072: 64 pages of 2K, the first 16K hold this bootloader
const FLASH_DESCRIPTOR: &str = "@Internal Flash  /0x08000000/8*002Ka,56*002Kg";

// first page after the bootloader, everything below is never erased or written
const APP_START: u32 = 0x0800_4000;

// RDP option byte
const OB_RDP: u32 = 0x1fff_f800;

const GEOMETRY: FlashGeometry = FlashGeometry {
    base: 0x0800_0000,
    bank_size: 0x2_0000,
    page_size: 0x800,
};

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xcdef_89ab;

// Internal flash programmed through the FLASH peripheral registers
pub struct InternalFlash {
    regs: pac::FLASH,
}

impl InternalFlash {
    fn wait(&self) -> Result<(), MemoryError> {
        while self.regs.sr.read().bsy().bit_is_set() {}
        let sr = self.regs.sr.read();
        let failed = sr.pgerr().bit_is_set() || sr.wrprt().bit_is_set();
        // clear EOP and error flags (write 1 to clear)
        self.regs.sr.write(|w| w.eop().set_bit().pgerr().set_bit().wrprt().set_bit());
        if failed { Err(MemoryError::Failed) } else { Ok(()) }
    }

    fn unlocked<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, MemoryError>) -> Result<T, MemoryError> {
        if self.regs.cr.read().lock().bit_is_set() {
            self.regs.keyr.write(|w| w.fkeyr().bits(FLASH_KEY1));
            self.regs.keyr.write(|w| w.fkeyr().bits(FLASH_KEY2));
        }
        let result = f(self);
        self.regs.cr.modify(|_, w| w.lock().set_bit());
        result
    }

    fn rdp_level(&self) -> RdpLevel {
        // SAFETY: option bytes are always mapped and readable
        RdpLevel::from_option_byte(unsafe { core::ptr::read_volatile(OB_RDP as *const u8) })
    }
}

impl Memory for InternalFlash {
    fn read(&mut self, address: u32) -> u8 {
        // SAFETY: the memory map only calls this for addresses inside of flash
        unsafe { core::ptr::read_volatile(address as *const u8) }
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryError> {
        // flash is programmed in half-words
        if address % 2 != 0 {
            return Err(MemoryError::Unsupported);
        }
        self.unlocked(|flash| {
            flash.regs.cr.modify(|_, w| w.pg().set_bit());
            let mut result = Ok(());
            for (i, chunk) in data.chunks(2).enumerate() {
                // odd tail is padded with the erased value
                let half = u16::from_le_bytes([chunk[0], *chunk.get(1).unwrap_or(&0xff)]);
                let dest = (address + 2 * i as u32) as *mut u16;
                // SAFETY: the address is inside of flash and PG is set
                unsafe { core::ptr::write_volatile(dest, half) };
                result = flash.wait();
                if result.is_err() {
                    break;
                }
            }
            flash.regs.cr.modify(|_, w| w.pg().clear_bit());
            result
        })
    }

    fn erase(&mut self, address: u32) -> Result<(), MemoryError> {
        let page = GEOMETRY.page_start(address);
        self.unlocked(|flash| {
            flash.regs.cr.modify(|_, w| w.per().set_bit());
            flash.regs.ar.write(|w| w.far().bits(page));
            flash.regs.cr.modify(|_, w| w.strt().set_bit());
            let result = flash.wait();
            flash.regs.cr.modify(|_, w| w.per().clear_bit());
            result
        })
    }
}

#[entry]
fn main() -> ! {
    let mut p = pac::Peripherals::take().unwrap();
    let cp = cortex_m::Peripherals::take().unwrap();

    let mut rcc = p.RCC
        .configure()
        .hsi48()
        .sysclk(48.mhz())
        .pclk(24.mhz())
        .enable_crs(p.CRS) // synchronization to USB SOF
        .freeze(&mut p.FLASH);

    // Configure systick to wrap around every millisecond
    let mut systick = cp.SYST;
    systick.set_clock_source(SystClkSource::Core);
    systick.set_reload(48_000 - 1);
    systick.enable_counter();

    let gpioa = p.GPIOA.split(&mut rcc);

    let usb = hal::usb::Peripheral {
        usb: p.USB,
        pin_dp: gpioa.pa12,
        pin_dm: gpioa.pa11
    };
    let usb_bus = hal::usb::UsbBus::new(usb);

    let mut flash = InternalFlash { regs: p.FLASH };
    let rdp = flash.rdp_level();
    let layout = MediaLayout::parse(FLASH_DESCRIPTOR).unwrap();
    let app = MemoryDescriptor::new(APP_START, layout.descriptor(AreaKind::Flash).end, AreaKind::Flash);
    let region = Region::new(app, &mut flash);
    let config = MediaConfig { descriptor: FLASH_DESCRIPTOR, ..MediaConfig::DEFAULT };
    let media = FlashMedia::with_config(MemoryMap::new([region]), rdp, config);

    let mut dfu = DfuClass::new(&usb_bus, media);

    // https://pid.codes
    let mut usb_dev = UsbDeviceBuilder::new(&usb_bus, UsbVidPid(0x1209, 0x0001))
        .strings(&[
            StringDescriptors::default()
                .manufacturer("usbd-dfu-media demo")
                .product("usbd-dfu-media demo")
                .serial_number(env!("CARGO_PKG_VERSION"))
        ])
        .unwrap()
        .build();

    loop {
        // busy wait until the timer wraps around
        while !systick.has_wrapped() {}

        usb_dev.poll(&mut [&mut dfu]);

        if dfu.leave_requested() {
            // Sometimes host fails to reenumerate our device after download,
            // so we force reenumeration and only after that we do reset.
            usb_bus.force_reenumeration(|| SCB::sys_reset());
            SCB::sys_reset();
        }
    }
}
