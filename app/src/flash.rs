//! Calibration storage in the last flash page.
//!
//! The capsense store trait wants EEPROM-style byte-block access, but the
//! F051 only erases whole 1 KiB pages. Writes stage the page in RAM, patch
//! the block, then erase and program the page back, halfword at a time.

use capsense::ThresholdStore;
use stm32f0xx_hal::pac::FLASH;

/// Last page of a 32 KiB part.
const PAGE_ADDR: u32 = 0x0800_7C00;
const PAGE_SIZE: usize = 1024;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

pub struct FlashStore {
    flash: FLASH,
}

impl FlashStore {
    pub fn new(flash: FLASH) -> Self {
        Self { flash }
    }

    fn wait_not_busy(&self) {
        while self.flash.sr.read().bsy().bit_is_set() {}
    }

    fn unlock(&self) {
        if self.flash.cr.read().lock().bit_is_set() {
            self.flash.keyr.write(|w| unsafe { w.bits(KEY1) });
            self.flash.keyr.write(|w| unsafe { w.bits(KEY2) });
        }
    }

    fn lock(&self) {
        self.flash.cr.modify(|_, w| w.lock().set_bit());
    }

    fn erase_page(&self) {
        self.wait_not_busy();
        self.flash.cr.modify(|_, w| w.per().set_bit());
        self.flash.ar.write(|w| unsafe { w.bits(PAGE_ADDR) });
        self.flash.cr.modify(|_, w| w.strt().set_bit());
        self.wait_not_busy();
        self.flash.cr.modify(|_, w| w.per().clear_bit());
    }

    fn program(&self, addr: u32, data: &[u8]) {
        for (i, pair) in data.chunks(2).enumerate() {
            let half = u16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0xff)]);
            self.wait_not_busy();
            self.flash.cr.modify(|_, w| w.pg().set_bit());
            unsafe { core::ptr::write_volatile((addr + 2 * i as u32) as *mut u16, half) };
            self.wait_not_busy();
            self.flash.cr.modify(|_, w| w.pg().clear_bit());
        }
    }
}

impl ThresholdStore for FlashStore {
    fn read(&mut self, addr: u16, buf: &mut [u8]) {
        let base = PAGE_ADDR + addr as u32;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { core::ptr::read_volatile((base + i as u32) as *const u8) };
        }
    }

    fn write(&mut self, addr: u16, data: &[u8]) {
        let mut page = [0u8; PAGE_SIZE];
        self.read(0, &mut page);
        page[addr as usize..addr as usize + data.len()].copy_from_slice(data);

        cortex_m::interrupt::free(|_| {
            self.unlock();
            self.erase_page();
            self.program(PAGE_ADDR, &page);
            self.lock();
        });
    }
}
