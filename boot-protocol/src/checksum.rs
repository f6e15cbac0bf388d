// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crc::{Crc, CRC_32_ISO_HDLC};

/// IEEE CRC-32, the same polynomial and reflection as zlib's `crc32`.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the CRC-32 of `data`, continuing from `seed`.
///
/// A seed of 0 starts a fresh checksum. Passing the result of a previous call
/// as the seed continues over the concatenated input, so
/// `checksum(b, checksum(a, 0)) == checksum(a ++ b, 0)`.
pub fn checksum(data: &[u8], seed: u32) -> u32 {
    // The crc register holds the un-finalized value, bit-reversed for reflected algorithms.
    let mut digest = CRC32.digest_with_initial((!seed).reverse_bits());
    digest.update(data);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(checksum(b"123456789", 0), 0xCBF4_3926);
    }

    #[test]
    fn empty_input_keeps_seed() {
        assert_eq!(checksum(&[], 0), 0);
        assert_eq!(checksum(&[], 0x1234_5678), 0x1234_5678);
    }

    #[test]
    fn chunked_equals_monolithic() {
        let mut image = [0u8; 1000];
        for (i, b) in image.iter_mut().enumerate() {
            *b = (i * 7 + 3) as u8;
        }
        let whole = checksum(&image, 0);

        for chunk_size in [1, 13, 256, 999] {
            let running = image.chunks(chunk_size).fold(0, |seed, chunk| checksum(chunk, seed));
            assert_eq!(running, whole, "chunk size {chunk_size}");
        }
    }
}
