// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use boot_protocol::ImageLayout;
use consts::{APP_INFO_FLASH_ADDR, SAVE_BRICK_GRACE_MS};

/// Runtime settings of the update state machine. `Default` matches the
/// flash layout in `consts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootConfig {
    /// Flash address of the metadata block.
    pub metadata_flash_addr: u32,
    /// Where the image and its vector block are expected.
    pub layout: ImageLayout,
    /// Uptime before a resident application is checked and launched.
    pub grace_period_ms: u64,
    /// Whether a residency marker that is neither the bootloader's nor the
    /// application's counts as an application being resident.
    pub unrecognized_marker_is_resident: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            metadata_flash_addr: APP_INFO_FLASH_ADDR,
            layout: ImageLayout::DEFAULT,
            grace_period_ms: SAVE_BRICK_GRACE_MS,
            unrecognized_marker_is_resident: true,
        }
    }
}
