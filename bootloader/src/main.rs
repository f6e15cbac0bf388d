// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]

mod launch;
mod link;
mod platform;

use defmt_rtt as _;
// global logger
use embassy_nrf as _;
// time driver
use panic_probe as _;

use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_futures::yield_now;
use embassy_nrf::gpio::{Level, Output, OutputDrive};
use embassy_nrf::{bind_interrupts, peripherals, spim, uarte};
use launch::launch_image;
use link::{spi_task, uart_rx_task, uart_tx_task, FlashSpi, UartLink, Uptime};
use platform::RamPlatform;
use serial_boot::{BootConfig, Outcome, UpdateProtocol};

bind_interrupts!(struct Irqs {
    UARTE0_UART0 => uarte::InterruptHandler<peripherals::UARTE0>;
    SPIM3 => spim::InterruptHandler<peripherals::SPI3>;
});

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_nrf::init(Default::default());

    let mut config_uart = uarte::Config::default();
    config_uart.parity = uarte::Parity::EXCLUDED;
    config_uart.baudrate = uarte::Baudrate::BAUD115200;

    // Uarte config
    let uart = uarte::Uarte::new(p.UARTE0, Irqs, p.P0_08, p.P0_06, config_uart);
    let (tx, rx) = uart.split();

    // External NOR flash, mode 0
    let mut config_spi = spim::Config::default();
    config_spi.frequency = spim::Frequency::M8;
    config_spi.mode = spim::MODE_0;

    #[cfg(feature = "flash-pins-board")]
    let (spim, cs) = (
        spim::Spim::new(p.SPI3, Irqs, p.P0_19, p.P0_21, p.P0_20, config_spi),
        Output::new(p.P0_17, Level::High, OutputDrive::Standard),
    );
    #[cfg(feature = "flash-pins-devkit")]
    let (spim, cs) = (
        spim::Spim::new(p.SPI3, Irqs, p.P1_15, p.P1_14, p.P1_13, config_spi),
        Output::new(p.P1_12, Level::High, OutputDrive::Standard),
    );

    unwrap!(spawner.spawn(uart_rx_task(rx)));
    unwrap!(spawner.spawn(uart_tx_task(tx)));
    unwrap!(spawner.spawn(spi_task(spim, cs)));

    info!("bootloader up");

    let mut boot = UpdateProtocol::new(UartLink, FlashSpi, Uptime, RamPlatform, BootConfig::default());

    loop {
        match boot.poll() {
            Outcome::Continue => yield_now().await,
            Outcome::Reset => cortex_m::peripheral::SCB::sys_reset(),
            Outcome::Launch => {
                // SAFETY: the image was verified and its vectors exchanged into place.
                unsafe { launch_image() }
            }
        }
    }
}
