// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Generates `memory.x` from the shared layout constants and puts it where
//! the linker finds it. The bootloader keeps clear of the RAM the image is
//! loaded to, the live vector block and the residency marker.

use consts::{APP_MAX_SIZE, APP_RAM_ADDR, BOOT_MARKER_ADDR, ISR_RAM_ADDR};
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// nRF52840 SRAM size.
const RAM_SIZE: u32 = 256 * 1024;

fn main() {
    let boot_ram_start = APP_RAM_ADDR + APP_MAX_SIZE;
    let ram_end = ISR_RAM_ADDR + RAM_SIZE;
    assert!(BOOT_MARKER_ADDR < APP_RAM_ADDR, "marker must not be overwritten by the image");

    let memory_x_content = format!(
        r##"
        MEMORY
        {{
            /* NOTE 1 K = 1 KiBi = 1024 bytes */
            /* The bootloader runs from internal flash; images live in the external NOR flash */
            FLASH : ORIGIN = 0x00000000, LENGTH = 64K
            /* Everything below the image's end belongs to the image and its vector blocks */
            RAM : ORIGIN = {:#X}, LENGTH = {:#X}
        }}
        "##,
        boot_ram_start,
        ram_end - boot_ram_start
    );
    // Put `memory.x` in our output directory and ensure it's
    // on the linker search path.
    let out = &PathBuf::from(env::var_os("OUT_DIR").unwrap());
    File::create(out.join("memory.x"))
        .unwrap()
        .write_all(memory_x_content.as_bytes())
        .unwrap();
    println!("cargo:rustc-link-search={}", out.display());

    println!("cargo:rerun-if-changed=build.rs");

    println!("cargo:rustc-link-arg-bins=--nmagic");
    println!("cargo:rustc-link-arg-bins=-Tlink.x");
    println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
}
