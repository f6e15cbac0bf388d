// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Collaborators the bootloader core is driven through.
//!
//! Implementations sit on top of interrupt driven peripheral drivers. None of
//! the methods may block: completion is observed by polling.

/// Failure reported by the SPI peripheral for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiError {
    /// The peripheral did not accept the transfer.
    Rejected,
    /// The transfer started but did not end with "transfer done".
    Aborted,
}

impl core::fmt::Display for SpiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Rejected => write!(f, "spi transfer rejected"),
            Self::Aborted => write!(f, "spi transfer aborted"),
        }
    }
}

/// Full duplex SPI with chip select handled by the implementation.
/// One transfer at a time.
pub trait SpiBus {
    /// Starts clocking out `tx`. As many bytes are clocked in.
    fn start_transfer(&mut self, tx: &[u8]) -> Result<(), SpiError>;

    /// `None` while the transfer runs. Once it ended, copies the received
    /// bytes into `rx` and reports how it went.
    fn poll_transfer(&mut self, rx: &mut [u8]) -> Option<Result<(), SpiError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// A previous send has not been transmitted yet.
    Busy,
    /// More bytes than the transmit buffer holds.
    TooLong(usize),
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Busy => write!(f, "transmitter busy"),
            Self::TooLong(len) => write!(f, "{len} bytes do not fit the transmit buffer"),
        }
    }
}

/// Byte oriented serial link.
pub trait Transport {
    /// Queues `data` for transmission.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// True once everything queued with [`send`](Self::send) left the wire.
    fn tx_done(&self) -> bool;

    /// Arms the receiver for exactly `len` bytes, replacing a previous request.
    fn receive(&mut self, len: usize);

    /// Once the armed number of bytes arrived, copies them into `buf` and
    /// returns their count. The receiver is disarmed until the next
    /// [`receive`](Self::receive).
    fn poll_received(&mut self, buf: &mut [u8]) -> Option<usize>;
}

/// Monotonic time since power on.
pub trait Clock {
    fn uptime_ms(&self) -> u64;
}

/// Execution environment the verified image is handed to.
pub trait Platform {
    /// Word left in retained memory by whatever ran before the last reset.
    fn resident_marker(&self) -> u32;

    /// Places `data` at `offset` into the image execution region.
    fn load_image_chunk(&mut self, offset: u32, data: &[u8]);

    /// Keeps the image's vector block aside. The live vector block is untouched.
    fn stage_vectors(&mut self, vectors: &[u8]);

    /// Swaps the live vector block with the staged one.
    fn exchange_vectors(&mut self);
}
