// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Application metadata block stored in front of the vector block in flash.
//!
//! Layout, all words little endian:
//!
//! | offset | field |
//! |--------|-------|
//! | 0  | image checksum (over bytes 4..16, then the whole image) |
//! | 4  | version |
//! | 8  | image flash address |
//! | 12 | image length |
//! | 16 | vector block checksum (over bytes 20..32, then the vector block) |
//! | 20 | vector block version |
//! | 24 | vector block flash address |
//! | 28 | vector block length |
//! | 32 | vector block |

use crate::checksum::checksum;
use consts::{APP_FLASH_ADDR, APP_ISR_FLASH_ADDR, APP_ISR_SIZE, APP_MAX_SIZE, PAGE_SIZE};
use heapless::Vec;

/// Size of the metadata words in front of the vector block.
pub const METADATA_HEADER_SIZE: usize = 32;

/// Largest vector block that still fits in one flash page with its header.
pub const ISR_BLOCK_MAX: usize = PAGE_SIZE - METADATA_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageError {
    /// The metadata read back from flash is shorter than header plus vector block.
    TooShort(usize),
    /// The vector block size does not fit in one page next to the header.
    IsrBlockTooLarge(usize),
    LoadAddressMismatch { expected: u32, found: u32 },
    IsrVersionMismatch { expected: u32, found: u32 },
    IsrAddressMismatch { expected: u32, found: u32 },
    IsrLengthMismatch { expected: u32, found: u32 },
    IsrChecksumMismatch { expected: u32, computed: u32 },
    ImageChecksumMismatch { expected: u32, computed: u32 },
    ImageTooLarge { length: u32, max: u32 },
    SerializeBufferTooSmall,
}

impl core::fmt::Display for ImageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "metadata too short: {len} bytes"),
            Self::IsrBlockTooLarge(len) => write!(f, "vector block of {len} bytes does not fit one page"),
            Self::LoadAddressMismatch { expected, found } => {
                write!(f, "image address {found:#010x} != {expected:#010x}")
            }
            Self::IsrVersionMismatch { expected, found } => {
                write!(f, "vector block version {found:#010x} != image version {expected:#010x}")
            }
            Self::IsrAddressMismatch { expected, found } => {
                write!(f, "vector block address {found:#010x} != {expected:#010x}")
            }
            Self::IsrLengthMismatch { expected, found } => {
                write!(f, "vector block length {found} != {expected}")
            }
            Self::IsrChecksumMismatch { expected, computed } => {
                write!(f, "vector block checksum {computed:#010x} != {expected:#010x}")
            }
            Self::ImageChecksumMismatch { expected, computed } => {
                write!(f, "image checksum {computed:#010x} != {expected:#010x}")
            }
            Self::ImageTooLarge { length, max } => write!(f, "image length {length} exceeds {max}"),
            Self::SerializeBufferTooSmall => write!(f, "buffer too small for metadata"),
        }
    }
}

/// Where an image is expected to live. Metadata that disagrees is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageLayout {
    pub app_flash_addr: u32,
    pub isr_flash_addr: u32,
    pub isr_size: u32,
    pub app_max_size: u32,
}

impl ImageLayout {
    pub const DEFAULT: Self = Self {
        app_flash_addr: APP_FLASH_ADDR,
        isr_flash_addr: APP_ISR_FLASH_ADDR,
        isr_size: APP_ISR_SIZE,
        app_max_size: APP_MAX_SIZE,
    };

    /// Bytes read from flash to get the metadata and the vector block in one go.
    pub const fn metadata_read_len(&self) -> usize {
        METADATA_HEADER_SIZE + self.isr_size as usize
    }
}

impl Default for ImageLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Packs a `major.minor.patch` version into the metadata version word.
pub const fn encode_version(major: u8, minor: u8, patch: u16) -> u32 {
    (major as u32) << 24 | (minor as u32) << 16 | patch as u32
}

pub const fn decode_version(version: u32) -> (u8, u8, u16) {
    ((version >> 24) as u8, (version >> 16) as u8, version as u16)
}

fn words_checksum(words: [u32; 3], seed: u32) -> u32 {
    let mut buf = [0u8; 12];
    for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    checksum(&buf, seed)
}

fn word(data: &[u8], index: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&data[index * 4..index * 4 + 4]);
    u32::from_le_bytes(w)
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppImageMetadata {
    pub checksum: u32,
    pub version: u32,
    pub flash_address: u32,
    pub length: u32,
    pub isr_checksum: u32,
    pub isr_version: u32,
    pub isr_flash_address: u32,
    pub isr_length: u32,
    pub isr_block: Vec<u8, ISR_BLOCK_MAX>,
}

impl AppImageMetadata {
    /// Decodes metadata read from flash. `isr_size` bytes of vector block are
    /// taken after the header, whatever the stored length says; the stored
    /// length is compared in [`validate`](Self::validate).
    pub fn parse(data: &[u8], isr_size: usize) -> Result<Self, ImageError> {
        if isr_size > ISR_BLOCK_MAX {
            return Err(ImageError::IsrBlockTooLarge(isr_size));
        }
        if data.len() < METADATA_HEADER_SIZE + isr_size {
            return Err(ImageError::TooShort(data.len()));
        }
        let mut isr_block = Vec::new();
        // Capacity was checked against ISR_BLOCK_MAX above.
        let _ = isr_block.extend_from_slice(&data[METADATA_HEADER_SIZE..METADATA_HEADER_SIZE + isr_size]);

        Ok(Self {
            checksum: word(data, 0),
            version: word(data, 1),
            flash_address: word(data, 2),
            length: word(data, 3),
            isr_checksum: word(data, 4),
            isr_version: word(data, 5),
            isr_flash_address: word(data, 6),
            isr_length: word(data, 7),
            isr_block,
        })
    }

    /// Checks everything that can be checked without reading the image:
    /// load address, image size, vector block header and vector block checksum.
    pub fn validate(&self, layout: &ImageLayout) -> Result<(), ImageError> {
        if self.flash_address != layout.app_flash_addr {
            return Err(ImageError::LoadAddressMismatch {
                expected: layout.app_flash_addr,
                found: self.flash_address,
            });
        }
        if self.length > layout.app_max_size {
            return Err(ImageError::ImageTooLarge {
                length: self.length,
                max: layout.app_max_size,
            });
        }
        if self.isr_version != self.version {
            return Err(ImageError::IsrVersionMismatch {
                expected: self.version,
                found: self.isr_version,
            });
        }
        if self.isr_flash_address != layout.isr_flash_addr {
            return Err(ImageError::IsrAddressMismatch {
                expected: layout.isr_flash_addr,
                found: self.isr_flash_address,
            });
        }
        if self.isr_length != layout.isr_size {
            return Err(ImageError::IsrLengthMismatch {
                expected: layout.isr_size,
                found: self.isr_length,
            });
        }
        let computed = self.computed_isr_checksum();
        if computed != self.isr_checksum {
            return Err(ImageError::IsrChecksumMismatch {
                expected: self.isr_checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Seed for the running image checksum: the version, address and length words.
    pub fn image_checksum_seed(&self) -> u32 {
        words_checksum([self.version, self.flash_address, self.length], 0)
    }

    pub fn computed_isr_checksum(&self) -> u32 {
        let seed = words_checksum([self.isr_version, self.isr_flash_address, self.isr_length], 0);
        checksum(&self.isr_block, seed)
    }

    /// Compares a running checksum, seeded with [`image_checksum_seed`](Self::image_checksum_seed)
    /// and carried over the whole image, against the stored one.
    pub fn verify_image_checksum(&self, computed: u32) -> Result<(), ImageError> {
        if computed == self.checksum {
            Ok(())
        } else {
            Err(ImageError::ImageChecksumMismatch {
                expected: self.checksum,
                computed,
            })
        }
    }

    /// Builds the metadata for `image` as the host packs it before flashing.
    pub fn for_image(version: u32, layout: &ImageLayout, image: &[u8], isr_block: &[u8]) -> Result<Self, ImageError> {
        let length = u32::try_from(image.len()).map_err(|_| ImageError::ImageTooLarge {
            length: u32::MAX,
            max: layout.app_max_size,
        })?;
        if isr_block.len() != layout.isr_size as usize {
            return Err(ImageError::IsrLengthMismatch {
                expected: layout.isr_size,
                found: isr_block.len() as u32,
            });
        }
        let isr_block = Vec::from_slice(isr_block).map_err(|_| ImageError::IsrBlockTooLarge(layout.isr_size as usize))?;

        let mut meta = Self {
            checksum: 0,
            version,
            flash_address: layout.app_flash_addr,
            length,
            isr_checksum: 0,
            isr_version: version,
            isr_flash_address: layout.isr_flash_addr,
            isr_length: layout.isr_size,
            isr_block,
        };
        meta.checksum = checksum(image, meta.image_checksum_seed());
        meta.isr_checksum = meta.computed_isr_checksum();
        Ok(meta)
    }

    /// Writes header and vector block; returns the number of bytes written.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, ImageError> {
        let len = METADATA_HEADER_SIZE + self.isr_block.len();
        if buf.len() < len {
            return Err(ImageError::SerializeBufferTooSmall);
        }
        let words = [
            self.checksum,
            self.version,
            self.flash_address,
            self.length,
            self.isr_checksum,
            self.isr_version,
            self.isr_flash_address,
            self.isr_length,
        ];
        for (chunk, word) in buf[..METADATA_HEADER_SIZE].chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        buf[METADATA_HEADER_SIZE..len].copy_from_slice(&self.isr_block);
        Ok(len)
    }

    /// The full metadata page as written to flash, zero padded.
    pub fn to_page(&self) -> Result<[u8; PAGE_SIZE], ImageError> {
        let mut page = [0u8; PAGE_SIZE];
        self.serialize(&mut page)?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image(len: usize) -> std::vec::Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    fn sample_isr() -> [u8; APP_ISR_SIZE as usize] {
        let mut isr = [0u8; APP_ISR_SIZE as usize];
        for (i, b) in isr.iter_mut().enumerate() {
            *b = i as u8 ^ 0x5A;
        }
        isr
    }

    #[test]
    fn packed_metadata_validates() {
        let image = sample_image(1000);
        let meta = AppImageMetadata::for_image(encode_version(1, 2, 3), &ImageLayout::DEFAULT, &image, &sample_isr()).unwrap();
        let page = meta.to_page().unwrap();
        assert_eq!(&page[8..12], &APP_FLASH_ADDR.to_le_bytes());

        let parsed = AppImageMetadata::parse(&page, APP_ISR_SIZE as usize).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.validate(&ImageLayout::DEFAULT), Ok(()));

        let running = image.chunks(PAGE_SIZE).fold(parsed.image_checksum_seed(), |seed, chunk| checksum(chunk, seed));
        assert_eq!(parsed.verify_image_checksum(running), Ok(()));
    }

    #[test]
    fn image_checksum_covers_header_words_then_image() {
        let image = sample_image(300);
        let meta = AppImageMetadata::for_image(7, &ImageLayout::DEFAULT, &image, &sample_isr()).unwrap();
        let page = meta.to_page().unwrap();

        let mut whole = std::vec::Vec::new();
        whole.extend_from_slice(&page[4..16]);
        whole.extend_from_slice(&image);
        assert_eq!(meta.checksum, checksum(&whole, 0));

        let mut isr_whole = std::vec::Vec::new();
        isr_whole.extend_from_slice(&page[20..32]);
        isr_whole.extend_from_slice(&sample_isr());
        assert_eq!(meta.isr_checksum, checksum(&isr_whole, 0));
    }

    #[test]
    fn wrong_load_address_is_rejected() {
        let image = sample_image(64);
        let mut meta = AppImageMetadata::for_image(1, &ImageLayout::DEFAULT, &image, &sample_isr()).unwrap();
        meta.flash_address = APP_FLASH_ADDR + 0x100;
        assert_eq!(
            meta.validate(&ImageLayout::DEFAULT),
            Err(ImageError::LoadAddressMismatch {
                expected: APP_FLASH_ADDR,
                found: APP_FLASH_ADDR + 0x100
            })
        );
    }

    #[test]
    fn isr_header_mismatches_are_rejected() {
        let image = sample_image(64);
        let meta = AppImageMetadata::for_image(1, &ImageLayout::DEFAULT, &image, &sample_isr()).unwrap();

        let mut bad = meta.clone();
        bad.isr_version = 2;
        assert!(matches!(bad.validate(&ImageLayout::DEFAULT), Err(ImageError::IsrVersionMismatch { .. })));

        let mut bad = meta.clone();
        bad.isr_flash_address = 0;
        assert!(matches!(bad.validate(&ImageLayout::DEFAULT), Err(ImageError::IsrAddressMismatch { .. })));

        let mut bad = meta.clone();
        bad.isr_length = 0x50;
        assert!(matches!(bad.validate(&ImageLayout::DEFAULT), Err(ImageError::IsrLengthMismatch { .. })));

        let mut bad = meta;
        bad.isr_block[3] ^= 1;
        assert!(matches!(bad.validate(&ImageLayout::DEFAULT), Err(ImageError::IsrChecksumMismatch { .. })));
    }

    #[test]
    fn oversized_image_is_rejected() {
        let image = sample_image(16);
        let mut meta = AppImageMetadata::for_image(1, &ImageLayout::DEFAULT, &image, &sample_isr()).unwrap();
        meta.length = APP_MAX_SIZE + 1;
        assert!(matches!(meta.validate(&ImageLayout::DEFAULT), Err(ImageError::ImageTooLarge { .. })));
    }

    #[test]
    fn truncated_metadata() {
        assert_eq!(AppImageMetadata::parse(&[0u8; 40], APP_ISR_SIZE as usize), Err(ImageError::TooShort(40)));
        assert_eq!(
            AppImageMetadata::parse(&[0u8; PAGE_SIZE], ISR_BLOCK_MAX + 1),
            Err(ImageError::IsrBlockTooLarge(ISR_BLOCK_MAX + 1))
        );
    }

    #[test]
    fn version_word() {
        assert_eq!(encode_version(1, 2, 3), 0x0102_0003);
        assert_eq!(decode_version(0x0102_0003), (1, 2, 3));
    }
}
