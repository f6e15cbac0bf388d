// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Multi-command flows.
//!
//! The device acknowledges a command when it accepts it and the next frame
//! replaces whatever it was still doing. Flash commands are therefore followed
//! by a pause long enough for the part to finish; asking the device in the
//! meantime would cancel the pending operation just the same.

use crate::image::PackedImage;
use crate::link::{BootLink, Error};
use boot_protocol::{Command, SessionFlags};
use consts::{APP_INFO_FLASH_ADDR, DATA_FRAME_SIZE, FRAME_SIZE, PAGE_SIZE, SECTOR_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Pauses after commands that keep the flash busy past their acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// After each sector erase. NOR parts take up to a few hundred ms per 64 KiB.
    pub erase_settle: Duration,
    /// After each page program.
    pub write_settle: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            erase_settle: Duration::from_millis(500),
            write_settle: Duration::from_millis(5),
        }
    }
}

/// What a self-check ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckVerdict {
    /// The bootloader stopped answering: the image was verified and launched.
    Launched,
    /// The image was rejected and autoboot is off.
    Rejected,
    /// Still checking after every attempt.
    Pending,
}

/// Sector start addresses touched by `length` bytes from `address`.
pub fn sectors(address: u32, length: u32) -> impl Iterator<Item = u32> {
    let first = address & !(SECTOR_SIZE - 1);
    let count = if length == 0 {
        0
    } else {
        (address + length - first).div_ceil(SECTOR_SIZE)
    };
    (0..count).map(move |i| first + i * SECTOR_SIZE)
}

/// Erases one sector per command, giving each time to finish.
pub async fn erase_sectors<P>(link: &mut BootLink<P>, address: u32, length: u32, pacing: &Pacing) -> Result<(), Error>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    for sector in sectors(address, length) {
        log::info!("erasing sector {sector:#x}");
        link.command(Command::Erase, sector, SECTOR_SIZE).await?;
        tokio::time::sleep(pacing.erase_settle).await;
    }
    Ok(())
}

/// Writes `data` page by page from `address`, switching the device to data
/// frames for the duration.
pub async fn write_pages<P>(link: &mut BootLink<P>, address: u32, data: &[u8], pacing: &Pacing) -> Result<(), Error>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let restore = !link.data_frames();
    if restore {
        link.set_frame_length(DATA_FRAME_SIZE as u32).await?;
    }
    for (i, page) in data.chunks(PAGE_SIZE).enumerate() {
        let page_addr = address + (i * PAGE_SIZE) as u32;
        link.data_command(Command::Write, page_addr, page.len() as u32, page)
            .await?;
        tokio::time::sleep(pacing.write_settle).await;
        log::info!("wrote {} / {} bytes", i * PAGE_SIZE + page.len(), data.len());
    }
    if restore {
        link.set_frame_length(FRAME_SIZE as u32).await?;
    }
    Ok(())
}

/// Erases and writes a packed image and its metadata page.
pub async fn upload<P>(link: &mut BootLink<P>, image: &PackedImage, pacing: &Pacing) -> Result<(), Error>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let app_addr = image.metadata.flash_address;
    erase_sectors(link, app_addr, image.app_erase_len(), pacing).await?;
    erase_sectors(link, APP_INFO_FLASH_ADDR, SECTOR_SIZE, pacing).await?;

    let mut page = [0u8; PAGE_SIZE];
    let len = image.metadata.serialize(&mut page).map_err(Error::Image)?;

    link.set_frame_length(DATA_FRAME_SIZE as u32).await?;
    write_pages(link, app_addr, &image.app, pacing).await?;
    write_pages(link, APP_INFO_FLASH_ADDR, &page[..len], pacing).await?;
    link.set_frame_length(FRAME_SIZE as u32).await?;
    Ok(())
}

/// Starts a self-check and waits for its outcome.
///
/// After each `wait` the device is asked for its flags. Silence means the image
/// was launched. A report without `APP_RESIDENT` means it was rejected. If the
/// question interrupted a running check, the bootloader starts it again by
/// itself since the application is still marked resident.
pub async fn check_image<P>(link: &mut BootLink<P>, wait: Duration, attempts: u32) -> Result<CheckVerdict, Error>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    link.command(Command::SelfCheck, 0, 0).await?;
    for _ in 0..attempts {
        tokio::time::sleep(wait).await;
        let report = match link.info().await {
            Ok(report) => report,
            Err(Error::Io(e)) => return Err(Error::Io(e)),
            Err(e) => {
                log::debug!("no bootloader reply after self-check: {e}");
                return Ok(CheckVerdict::Launched);
            }
        };
        log::debug!("after self-check: {:?} {:?}", report.mode, report.flags);
        if !report.flags.contains(SessionFlags::APP_RESIDENT) {
            return Ok(CheckVerdict::Rejected);
        }
    }
    Ok(CheckVerdict::Pending)
}
