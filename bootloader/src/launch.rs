// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use consts::{ISR_RAM_ADDR, MARKER_APP};
use cortex_m::peripheral::NVIC;
use defmt::info;
use embassy_nrf::interrupt::Interrupt;

use crate::platform::write_marker;

/// Starts the image whose vectors are live at `ISR_RAM_ADDR`.
///
/// # Safety
///
/// The image must be loaded and its vector block exchanged into place. This
/// modifies the stack pointer and vector table and never returns.
pub unsafe fn launch_image() -> ! {
    // A reset from the image comes back with the image marked resident.
    write_marker(MARKER_APP);

    NVIC::mask(Interrupt::UARTE0_UART0);
    NVIC::mask(Interrupt::SPIM3);
    NVIC::mask(Interrupt::RTC1);

    let msp = core::ptr::read_volatile(ISR_RAM_ADDR as *const u32);
    let rv = core::ptr::read_volatile((ISR_RAM_ADDR + 4) as *const u32);
    info!("launch: msp = {=u32:x}, rv = {=u32:x}", msp, rv);

    critical_section::with(|_| {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        scb.vtor.write(ISR_RAM_ADDR);
        cortex_m::asm::dsb();
        cortex_m::asm::isb();

        // These instructions perform the following operations:
        //
        // * Modify control register to use MSP as stack pointer (clear spsel bit)
        // * Synchronize instruction barrier
        // * Initialize stack pointer from the image's vector block
        // * Set link register to not return (0xFF)
        // * Jump to the image's reset vector
        core::arch::asm!(
            "mrs {tmp}, CONTROL",
            "bics {tmp}, {spsel}",
            "msr CONTROL, {tmp}",
            "isb",
            "msr MSP, {msp}",
            "mov lr, {new_lr}",
            "bx {rv}",
            // `out(reg) _` is not permitted in a `noreturn` asm! call,
            // so instead use `in(reg) 0` and don't restore it afterwards.
            tmp = in(reg) 0,
            spsel = in(reg) 2,
            new_lr = in(reg) 0xFFFFFFFFu32,
            msp = in(reg) msp,
            rv = in(reg) rv,
            options(noreturn),
        );
    })
}
