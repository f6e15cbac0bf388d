// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Turns a linked firmware binary into what gets written to flash.

use boot_protocol::{encode_version, AppImageMetadata, ImageError, ImageLayout};
use consts::{APP_BIN_OFFSET, APP_ISR_SIZE, SECTOR_SIZE};

#[derive(Debug)]
pub enum PackError {
    /// The binary ends before the application part starts.
    TooShort(usize),
    /// Version fields do not fit the packed version word.
    Version(semver::Version),
    Image(ImageError),
}

impl From<ImageError> for PackError {
    fn from(e: ImageError) -> Self {
        PackError::Image(e)
    }
}

impl std::fmt::Display for PackError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PackError::TooShort(len) => write!(
                f,
                "firmware binary of {len} bytes ends before the application offset {APP_BIN_OFFSET:#x}"
            ),
            PackError::Version(v) => {
                write!(f, "version {v} does not fit major <= 255, minor <= 255, patch <= 65535")
            }
            PackError::Image(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PackError {}

/// Application bytes and the metadata page describing them.
#[derive(Debug)]
pub struct PackedImage {
    pub app: Vec<u8>,
    pub metadata: AppImageMetadata,
}

impl PackedImage {
    /// Splits a binary linked for the vector block address: the vector block is
    /// its first `APP_ISR_SIZE` bytes, the application starts at `APP_BIN_OFFSET`.
    pub fn from_binary(bin: &[u8], version: &semver::Version) -> Result<Self, PackError> {
        let version_word = pack_version(version)?;
        if bin.len() <= APP_BIN_OFFSET as usize {
            return Err(PackError::TooShort(bin.len()));
        }
        let isr = &bin[..APP_ISR_SIZE as usize];
        let app = bin[APP_BIN_OFFSET as usize..].to_vec();
        let metadata = AppImageMetadata::for_image(version_word, &ImageLayout::DEFAULT, &app, isr)?;
        let max = ImageLayout::DEFAULT.app_max_size;
        if metadata.length > max {
            return Err(ImageError::ImageTooLarge {
                length: metadata.length,
                max,
            }
            .into());
        }
        Ok(Self { app, metadata })
    }

    /// Sector aligned erase ranges covering the application.
    pub fn app_erase_len(&self) -> u32 {
        self.metadata.length.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
    }
}

fn pack_version(version: &semver::Version) -> Result<u32, PackError> {
    let major = u8::try_from(version.major).map_err(|_| PackError::Version(version.clone()))?;
    let minor = u8::try_from(version.minor).map_err(|_| PackError::Version(version.clone()))?;
    let patch = u16::try_from(version.patch).map_err(|_| PackError::Version(version.clone()))?;
    Ok(encode_version(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_protocol::checksum;
    use consts::{APP_FLASH_ADDR, APP_ISR_FLASH_ADDR, APP_MAX_SIZE};

    fn binary(app_len: usize) -> Vec<u8> {
        let mut bin = vec![0u8; APP_BIN_OFFSET as usize + app_len];
        for (i, b) in bin.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        bin
    }

    #[test]
    fn splits_vector_block_and_application() {
        let bin = binary(5000);
        let packed = PackedImage::from_binary(&bin, &semver::Version::new(1, 4, 2)).unwrap();

        assert_eq!(packed.app, &bin[APP_BIN_OFFSET as usize..]);
        assert_eq!(&packed.metadata.isr_block[..], &bin[..APP_ISR_SIZE as usize]);
        assert_eq!(packed.metadata.version, 0x0104_0002);
        assert_eq!(packed.metadata.flash_address, APP_FLASH_ADDR);
        assert_eq!(packed.metadata.isr_flash_address, APP_ISR_FLASH_ADDR);
        assert_eq!(packed.metadata.length, 5000);
        assert_eq!(packed.app_erase_len(), SECTOR_SIZE);

        let seed = packed.metadata.image_checksum_seed();
        assert_eq!(packed.metadata.checksum, checksum(&packed.app, seed));
        assert_eq!(packed.metadata.validate(&ImageLayout::DEFAULT), Ok(()));
    }

    #[test]
    fn rejects_truncated_binary() {
        let bin = vec![0u8; APP_BIN_OFFSET as usize];
        assert!(matches!(
            PackedImage::from_binary(&bin, &semver::Version::new(1, 0, 0)),
            Err(PackError::TooShort(_))
        ));
    }

    #[test]
    fn rejects_oversized_application() {
        let bin = binary(APP_MAX_SIZE as usize + 1);
        assert!(matches!(
            PackedImage::from_binary(&bin, &semver::Version::new(1, 0, 0)),
            Err(PackError::Image(ImageError::ImageTooLarge { .. }))
        ));
    }

    #[test]
    fn rejects_unpackable_version() {
        let bin = binary(16);
        assert!(matches!(
            PackedImage::from_binary(&bin, &semver::Version::new(256, 0, 0)),
            Err(PackError::Version(_))
        ));
    }
}
