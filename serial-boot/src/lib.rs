// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Core of the serial bootloader: a polled SPI NOR flash controller and the
//! update state machine that drives it from frames received over a serial link.
//!
//! Peripherals are reached through the traits in [`hal`], so the same code runs
//! on the target and against simulated devices in tests.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod config;
pub mod flash;
pub mod hal;
mod protocol;
mod validator;

pub use config::BootConfig;
pub use flash::{FlashController, FlashError, FlashOperation, FlashStatus, OperationKind};
pub use hal::{Clock, Platform, SpiBus, SpiError, Transport, TransportError};
pub use protocol::{BootSession, Outcome, UpdateProtocol};
pub use validator::ImageValidator;
