#![no_main]
#![no_std]

use core::cell::RefCell;
use core::fmt::Write;
use core::sync::atomic::{AtomicU32, Ordering};
use cortex_m;
use cortex_m::interrupt::Mutex;
use cortex_m_rt::{entry, exception};
use panic_halt as _;

use stm32f0xx_hal as hal;

use capsense::tsc::{Pad, TscOscillator, DEFAULT_TSC_CONFIG};
use capsense::{
    CalPrompt, CalStatus, CapSense, ChannelId, ChannelSet, Rating, SenseConfig, MAX_CHANNELS,
};

use crate::hal::pac;
use crate::hal::pac::interrupt;
use crate::hal::prelude::*;

mod flash;
mod serial;

use flash::FlashStore;

/// SysTick time base rate.
const TICKS_PER_SEC: u32 = 100;
/// Measurement windows per second.
const POLL_FREQ: u32 = 1000;

const fn ch(index: u8) -> ChannelId {
    match ChannelId::new(index) {
        Some(c) => c,
        None => panic!("bad channel index"),
    }
}

static SENSE_CONFIG: SenseConfig = SenseConfig {
    channels: ChannelSet::empty()
        .with(ch(0))
        .with(ch(1))
        .with(ch(2))
        .with(ch(3)),
    filter_length: 4,
    debounce_polls: 10,
    min_threshold: 4,
    ticks_per_bin: 50,
    long_hold_ticks: 30 * TICKS_PER_SEC,
};

// TSC wiring for the four pads, per the board schematic.
static PADS: [Option<Pad>; MAX_CHANNELS] = [
    Some(Pad { group: 1, sample: 2, electrode: 1 }), // PA0, sample cap on PA1
    Some(Pad { group: 2, sample: 3, electrode: 1 }), // PA4, sample cap on PA6
    Some(Pad { group: 3, sample: 4, electrode: 2 }), // PB0, sample cap on PB2
    Some(Pad { group: 6, sample: 2, electrode: 1 }), // PB11, sample cap on PB12
];

static TIME: AtomicU32 = AtomicU32::new(0);
static SENSE: Mutex<RefCell<Option<CapSense<TscOscillator>>>> = Mutex::new(RefCell::new(None));

#[entry]
fn main() -> ! {
    let dp = pac::Peripherals::take().unwrap();
    let cp = cortex_m::Peripherals::take().unwrap();
    let mut nvic = cp.NVIC;

    let mut flash = dp.FLASH;
    let mut rcc = dp.RCC.configure().sysclk(48.mhz()).freeze(&mut flash);
    let gpioa = dp.GPIOA.split(&mut rcc);
    let gpiob = dp.GPIOB.split(&mut rcc);

    // A library requiring a critical section to set a gpio AF register is bad and I just won't.
    let fake_cs = unsafe { cortex_m::interrupt::CriticalSection::new() };

    // Electrode and sample-capacitor pins to the TSC
    let _pad0 = gpioa.pa0.into_alternate_af3(&fake_cs);
    let _pad1 = gpioa.pa4.into_alternate_af3(&fake_cs);
    let _pad2 = gpiob.pb0.into_alternate_af3(&fake_cs);
    let _pad3 = gpiob.pb11.into_alternate_af3(&fake_cs);
    let _cap0 = gpioa.pa1.into_alternate_af3(&fake_cs);
    let _cap1 = gpioa.pa6.into_alternate_af3(&fake_cs);
    let _cap2 = gpiob.pb2.into_alternate_af3(&fake_cs);
    let _cap3 = gpiob.pb12.into_alternate_af3(&fake_cs);

    let mut store = FlashStore::new(flash);

    // TIM16 runs off APB2; the timer clock doubles if the bus is prescaled
    let tim_clk = if rcc.clocks.hclk().0 == rcc.clocks.pclk().0 {
        rcc.clocks.pclk().0
    } else {
        rcc.clocks.pclk().0 * 2
    };

    let mut hw = TscOscillator::new(PADS, DEFAULT_TSC_CONFIG, tim_clk, POLL_FREQ);
    hw.listen();

    let mut sense = CapSense::new(SENSE_CONFIG, hw, 0).expect("bad capsense configuration");
    sense.load_thresholds(&mut store);

    cortex_m::interrupt::free(|cs| {
        SENSE.borrow(cs).borrow_mut().replace(sense);
    });

    unsafe {
        nvic.set_priority(pac::Interrupt::TIM16, 2);
        cortex_m::peripheral::NVIC::unmask(pac::Interrupt::TIM16);
    }

    let mut syst = hal::timers::Timer::syst(cp.SYST, TICKS_PER_SEC.hz(), &mut rcc);
    syst.listen(&hal::timers::Event::TimeOut);

    let tx_pin = gpioa.pa9.into_alternate_af1(&fake_cs);
    let rx_pin = gpioa.pa10.into_alternate_af1(&fake_cs);
    let uart = hal::serial::Serial::usart1(dp.USART1, (tx_pin, rx_pin), 115200.bps(), &mut rcc);
    serial::uart1::init(uart, 4);

    let mut writer = serial::uart1::writer();
    let _ = write!(writer, "keypad ready\r\n");

    let mut calibrating = false;
    let mut last_prompt: Option<CalPrompt> = None;

    loop {
        let ticks = TIME.load(Ordering::Relaxed);

        match serial::uart1::read_byte() {
            Some(b'c') => {
                cortex_m::interrupt::free(|cs| {
                    let mut cell = SENSE.borrow(cs).borrow_mut();
                    cell.as_mut().unwrap().start_calibration(ticks);
                });
                calibrating = true;
                last_prompt = None;
                let _ = write!(writer, "calibration started\r\n");
            }
            Some(b'd') => dump_readings(&mut writer),
            _ => {}
        }

        if calibrating {
            let (status, prompt) = cortex_m::interrupt::free(|cs| {
                let mut cell = SENSE.borrow(cs).borrow_mut();
                let sense = cell.as_mut().unwrap();
                let status = sense.calibrate_step(ticks, &mut store);
                (status, sense.calibration_prompt())
            });

            if prompt != last_prompt {
                match prompt {
                    Some(CalPrompt::HandsOff) => {
                        let _ = write!(writer, "hands off the pads\r\n");
                    }
                    Some(CalPrompt::Press(channel)) => {
                        let _ = write!(writer, "press and release pad {}\r\n", channel.index());
                    }
                    None => {}
                }
                last_prompt = prompt;
            }

            if status == CalStatus::Done {
                calibrating = false;
                report_ratings(&mut writer);
            }
        } else {
            let button = cortex_m::interrupt::free(|cs| {
                SENSE.borrow(cs).borrow_mut().as_mut().unwrap().take_button()
            });
            if let Some(button) = button {
                let _ = write!(writer, "pressed pad {}\r\n", button.index());
            }
        }
    }
}

fn dump_readings(writer: &mut serial::uart1::Uart1Tx) {
    cortex_m::interrupt::free(|cs| {
        let cell = SENSE.borrow(cs).borrow();
        let sense = cell.as_ref().unwrap();
        for channel in SENSE_CONFIG.channels.iter() {
            let _ = write!(
                writer,
                "pad {}: reading={} baseline={} sensitivity={}\r\n",
                channel.index(),
                sense.reading(channel),
                sense.baseline(channel),
                sense.sensitivity(channel)
            );
        }
    });
}

fn report_ratings(writer: &mut serial::uart1::Uart1Tx) {
    cortex_m::interrupt::free(|cs| {
        let cell = SENSE.borrow(cs).borrow();
        let sense = cell.as_ref().unwrap();
        for channel in SENSE_CONFIG.channels.iter() {
            let rating = match sense.rating(channel) {
                Rating::Fail => "FAIL",
                Rating::Ok => "ok",
                Rating::Great => "great",
            };
            let _ = write!(
                writer,
                "pad {}: threshold={} {}\r\n",
                channel.index(),
                sense.sensitivity(channel),
                rating
            );
        }
    });
}

#[exception]
fn SysTick() {
    let time = TIME.load(Ordering::Relaxed);
    TIME.store(time + 1, Ordering::Relaxed);
}

#[interrupt]
fn TIM16() {
    // We don't need the mutex, because the IRQ is the highest prio accessor.
    let fake_cs = unsafe { cortex_m::interrupt::CriticalSection::new() };
    let mut cell = SENSE.borrow(&fake_cs).borrow_mut();
    let sense = cell.as_mut().unwrap();

    let ticks = TIME.load(Ordering::Relaxed);
    sense.poll(ticks);
    sense.poll_done();
}
