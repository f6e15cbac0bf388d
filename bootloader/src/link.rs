// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Peripheral tasks and the handles the update state machine polls.
//!
//! Tasks own the UARTE and SPIM drivers and only exchange messages with the
//! superloop, which never waits on them.

use consts::{DATA_FRAME_SIZE, FLASH_CMD_HEADER_LEN, PAGE_SIZE};
use core::sync::atomic::{AtomicBool, Ordering};
use defmt::{trace, warn};
use embassy_nrf::gpio::Output;
use embassy_nrf::peripherals::{SPI3, UARTE0};
use embassy_nrf::spim::Spim;
use embassy_nrf::uarte::{UarteRx, UarteTx};
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::Instant;
use heapless::Vec;
use serial_boot::{Clock, SpiBus, SpiError, Transport, TransportError};

const SPI_BUF_LEN: usize = FLASH_CMD_HEADER_LEN + PAGE_SIZE;

type Frame = Vec<u8, DATA_FRAME_SIZE>;
type SpiBuf = Vec<u8, SPI_BUF_LEN>;

static RX_ARM: Signal<ThreadModeRawMutex, usize> = Signal::new();
static RX_FRAME: Channel<ThreadModeRawMutex, Frame, 1> = Channel::new();
static TX_DATA: Channel<ThreadModeRawMutex, Vec<u8, PAGE_SIZE>, 1> = Channel::new();
static TX_BUSY: AtomicBool = AtomicBool::new(false);
static SPI_REQUEST: Channel<ThreadModeRawMutex, SpiBuf, 1> = Channel::new();
static SPI_DONE: Channel<ThreadModeRawMutex, Result<SpiBuf, SpiError>, 1> = Channel::new();

/// Receives exactly the armed number of bytes, then waits to be armed again.
#[embassy_executor::task]
pub async fn uart_rx_task(mut rx: UarteRx<'static, UARTE0>) {
    let mut buf = [0u8; DATA_FRAME_SIZE];
    loop {
        let len = RX_ARM.wait().await.min(DATA_FRAME_SIZE);
        match rx.read(&mut buf[..len]).await {
            Ok(()) => {
                trace!("rx {} bytes", len);
                // `len` is capped to the frame capacity above.
                let _ = RX_FRAME.try_send(Vec::from_slice(&buf[..len]).unwrap_or_default());
            }
            Err(e) => {
                warn!("uart rx error: {:?}", e);
                RX_ARM.signal(len);
            }
        }
    }
}

#[embassy_executor::task]
pub async fn uart_tx_task(mut tx: UarteTx<'static, UARTE0>) {
    loop {
        let data = TX_DATA.receive().await;
        if let Err(e) = tx.write(&data).await {
            warn!("uart tx error: {:?}", e);
        }
        TX_BUSY.store(false, Ordering::Release);
    }
}

/// Runs one flash transfer at a time with chip select held for its length.
#[embassy_executor::task]
pub async fn spi_task(mut spim: Spim<'static, SPI3>, mut cs: Output<'static>) {
    loop {
        let tx = SPI_REQUEST.receive().await;
        let mut rx = SpiBuf::new();
        // Same length as `tx`, which has the same capacity.
        let _ = rx.resize(tx.len(), 0);

        cs.set_low();
        let result = spim.transfer(&mut rx, &tx).await;
        cs.set_high();

        let reply = match result {
            Ok(()) => Ok(rx),
            Err(e) => {
                warn!("spi error: {:?}", e);
                Err(SpiError::Aborted)
            }
        };
        SPI_DONE.send(reply).await;
    }
}

pub struct UartLink;

impl Transport for UartLink {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if TX_BUSY.load(Ordering::Acquire) {
            return Err(TransportError::Busy);
        }
        let buf = Vec::from_slice(data).map_err(|_| TransportError::TooLong(data.len()))?;
        TX_BUSY.store(true, Ordering::Release);
        TX_DATA.try_send(buf).map_err(|_| {
            TX_BUSY.store(false, Ordering::Release);
            TransportError::Busy
        })
    }

    fn tx_done(&self) -> bool {
        !TX_BUSY.load(Ordering::Acquire)
    }

    fn receive(&mut self, len: usize) {
        RX_ARM.signal(len);
    }

    fn poll_received(&mut self, buf: &mut [u8]) -> Option<usize> {
        let frame = RX_FRAME.try_receive().ok()?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Some(len)
    }
}

pub struct FlashSpi;

impl SpiBus for FlashSpi {
    fn start_transfer(&mut self, tx: &[u8]) -> Result<(), SpiError> {
        let buf = Vec::from_slice(tx).map_err(|_| SpiError::Rejected)?;
        SPI_REQUEST.try_send(buf).map_err(|_| SpiError::Rejected)
    }

    fn poll_transfer(&mut self, rx: &mut [u8]) -> Option<Result<(), SpiError>> {
        let reply = SPI_DONE.try_receive().ok()?;
        Some(reply.map(|data| {
            let len = data.len().min(rx.len());
            rx[..len].copy_from_slice(&data[..len]);
        }))
    }
}

pub struct Uptime;

impl Clock for Uptime {
    fn uptime_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}
