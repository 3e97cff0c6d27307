#![no_std]
#![no_main]

use core::cell::RefCell;

use critical_section::Mutex;
use defmt::*;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_rp::bind_interrupts;
use embassy_rp::interrupt::typelevel::{Handler, Interrupt, USBCTRL_IRQ};
use embassy_time::Timer;
use panic_probe as _;

use spiprog::config::{USB_PID, USB_VID};
use spiprog::rp2040::{self, BoardUsb};
use spiprog::Timeouts;

// =============================================================================
// Shared state between the USB interrupt and the main loop
// =============================================================================

/// USB core. The interrupt only records work here; the main loop serves it.
static USB_CORE: Mutex<RefCell<Option<BoardUsb>>> = Mutex::new(RefCell::new(None));

// =============================================================================
// Interrupt bindings
// =============================================================================

struct UsbInterrupt;

impl Handler<USBCTRL_IRQ> for UsbInterrupt {
    unsafe fn on_interrupt() {
        critical_section::with(|cs| {
            if let Some(core) = USB_CORE.borrow_ref_mut(cs).as_mut() {
                core.on_interrupt();
            }
        });
    }
}

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => UsbInterrupt;
});

// =============================================================================
// Entry point
// =============================================================================

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    info!("spiprog starting up");

    let (mut usb, mut dispatcher) = rp2040::init(p, Timeouts::default());
    usb.attach();
    critical_section::with(|cs| {
        USB_CORE.borrow(cs).replace(Some(usb));
    });

    USBCTRL_IRQ::unpend();
    // SAFETY: the handler only touches USB_CORE, which is initialised above.
    unsafe { USBCTRL_IRQ::enable() };

    info!("spiprog ready, VID:PID = {:04x}:{:04x}", USB_VID, USB_PID);

    loop {
        critical_section::with(|cs| {
            if let Some(core) = USB_CORE.borrow_ref_mut(cs).as_mut() {
                dispatcher.poll(core);
            }
        });
        Timer::after_micros(100).await;
    }
}
