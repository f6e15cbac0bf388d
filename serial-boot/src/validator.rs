// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use boot_protocol::{checksum, AppImageMetadata, ImageError, ImageLayout};
use consts::PAGE_SIZE;

/// Running check of a flashed image: metadata first, then the image in page
/// sized chunks, each folded into the checksum.
#[derive(Debug, Default)]
pub struct ImageValidator {
    metadata: Option<AppImageMetadata>,
    running: u32,
    progress: u32,
}

impl ImageValidator {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Image bytes streamed so far.
    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn metadata(&self) -> Option<&AppImageMetadata> {
        self.metadata.as_ref()
    }

    /// Takes the metadata block and vector block as read from flash.
    /// Streaming can start once this returned `Ok`.
    pub fn load_metadata(&mut self, data: &[u8], layout: &ImageLayout) -> Result<&AppImageMetadata, ImageError> {
        self.reset();
        let metadata = AppImageMetadata::parse(data, layout.isr_size as usize)?;
        metadata.validate(layout)?;
        self.running = metadata.image_checksum_seed();
        Ok(&*self.metadata.insert(metadata))
    }

    /// Flash address and length of the next chunk, `None` once the whole image went through.
    pub fn next_chunk(&self) -> Option<(u32, usize)> {
        let metadata = self.metadata.as_ref()?;
        let remaining = metadata.length - self.progress;
        if remaining == 0 {
            return None;
        }
        Some((metadata.flash_address + self.progress, (remaining as usize).min(PAGE_SIZE)))
    }

    /// Folds one chunk into the checksum. Returns the image offset the chunk belongs at.
    pub fn absorb(&mut self, data: &[u8]) -> u32 {
        let offset = self.progress;
        self.running = checksum(data, self.running);
        self.progress += data.len() as u32;
        offset
    }

    /// Compares the checksum over everything absorbed against the stored one.
    pub fn finish(&self) -> Result<(), ImageError> {
        match &self.metadata {
            Some(metadata) => metadata.verify_image_checksum(self.running),
            None => Err(ImageError::TooShort(0)),
        }
    }
}
