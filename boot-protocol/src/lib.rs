// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host to bootloader protocol over a serial link.
//! The host drives every exchange; the bootloader answers each accepted command
//! with one acknowledgement frame.
//! Defines the command set, the 16-byte frames and the application metadata stored in flash.

#![cfg_attr(not(test), no_std)]

mod checksum;
mod frame;
mod image;

pub use checksum::checksum;
pub use frame::{AckFrame, CommandFrame, FrameError, InfoReport};
pub use image::{
    decode_version, encode_version, AppImageMetadata, ImageError, ImageLayout, ISR_BLOCK_MAX, METADATA_HEADER_SIZE,
};

use bitflags::bitflags;

/// Commands understood by the bootloader. The discriminant is the value sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum Command {
    /// Placeholder, never accepted
    Unknown = 0,
    /// Validate the stored image and launch it
    SelfCheck = 1,
    /// Go back to waiting for commands
    Ready = 2,
    /// Stay in the bootloader: forget that an application is resident
    SaveBrick = 3,
    /// Reset the device once the acknowledgement is out
    Reset = 4,
    /// Mark the session as bootloader resident
    EnterBoot = 5,
    /// Mark the session as application resident
    EnterApp = 6,
    /// Announce the length of the next frame (16 or 272)
    NextSet = 7,
    /// Erase the sectors covering `length` bytes at `address`
    Erase = 8,
    /// Program the payload that follows the frame at `address`
    Write = 9,
    /// Read `length` bytes at `address` and send them back
    Read = 10,
    /// Launch a verified image
    Jump = 11,
    /// Report boot mode and session flags
    Info = 12,
}

impl Command {
    /// Number of defined commands, `Unknown` included.
    pub const COUNT: u32 = 13;
}

impl TryFrom<u32> for Command {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Unknown,
            1 => Self::SelfCheck,
            2 => Self::Ready,
            3 => Self::SaveBrick,
            4 => Self::Reset,
            5 => Self::EnterBoot,
            6 => Self::EnterApp,
            7 => Self::NextSet,
            8 => Self::Erase,
            9 => Self::Write,
            10 => Self::Read,
            11 => Self::Jump,
            12 => Self::Info,
            other => return Err(FrameError::UnknownCommand(other)),
        })
    }
}

/// Which program owns the device, as reported by [`Command::Info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum BootMode {
    Bootloader = 0,
    Application = 1,
}

impl BootMode {
    /// Anything but 1 reads as bootloader mode.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Application,
            _ => Self::Bootloader,
        }
    }
}

bitflags! {
    /// Session state reported by [`Command::Info`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u32 {
        const APP_RESIDENT = 1 << 0;
        const IMAGE_VERIFIED = 1 << 1;
        const FLASH_ERROR = 1 << 2;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for SessionFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "SessionFlags({=u32:#x})", self.bits())
    }
}
