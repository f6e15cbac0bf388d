// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Image placement in RAM: the execution region, the staged vector block and
//! the live vector block the core fetches from after launch.

use consts::{APP_ISR_SIZE, APP_MAX_SIZE, APP_RAM_ADDR, BOOT_MARKER_ADDR, ISR_RAM_ADDR, ISR_TEMP_RAM_ADDR};
use defmt::warn;
use serial_boot::Platform;

pub fn write_marker(marker: u32) {
    // SAFETY: the marker word is outside the bootloader's RAM and reserved for this use.
    unsafe { core::ptr::write_volatile(BOOT_MARKER_ADDR as *mut u32, marker) }
}

pub struct RamPlatform;

impl Platform for RamPlatform {
    fn resident_marker(&self) -> u32 {
        // SAFETY: see `write_marker`.
        unsafe { core::ptr::read_volatile(BOOT_MARKER_ADDR as *const u32) }
    }

    fn load_image_chunk(&mut self, offset: u32, data: &[u8]) {
        if offset as usize + data.len() > APP_MAX_SIZE as usize {
            warn!("image chunk at {=u32:#x} outside the execution region", offset);
            return;
        }
        // SAFETY: bounds checked against the execution region, which the
        // bootloader's own memory does not overlap (see build.rs).
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), (APP_RAM_ADDR + offset) as *mut u8, data.len());
        }
    }

    fn stage_vectors(&mut self, vectors: &[u8]) {
        let len = vectors.len().min(APP_ISR_SIZE as usize);
        // SAFETY: the staging area is the APP_ISR_SIZE bytes right below the execution region.
        unsafe {
            core::ptr::copy_nonoverlapping(vectors.as_ptr(), ISR_TEMP_RAM_ADDR as *mut u8, len);
        }
    }

    fn exchange_vectors(&mut self) {
        // SAFETY: both blocks are APP_ISR_SIZE bytes, word aligned and disjoint.
        unsafe {
            let live = core::slice::from_raw_parts_mut(ISR_RAM_ADDR as *mut u32, APP_ISR_SIZE as usize / 4);
            let staged = core::slice::from_raw_parts_mut(ISR_TEMP_RAM_ADDR as *mut u32, APP_ISR_SIZE as usize / 4);
            live.swap_with_slice(staged);
        }
    }
}
