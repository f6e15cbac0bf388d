#![no_std]

/// Size of one NOR flash program page in bytes.
/// Page program and the bootloader's read chunks never cross this size.
pub const PAGE_SIZE: usize = 256;

/// Size of one NOR flash erase sector in bytes (64 KiB sector erase, opcode 0xD8).
pub const SECTOR_SIZE: u32 = 65536;

/// Opcode plus 24-bit address that precede the payload of every flash command.
pub const FLASH_CMD_HEADER_LEN: usize = 4;

/// Highest address reachable with 3-byte addressing.
pub const FLASH_ADDRESS_LIMIT: u32 = 1 << 24;

/// Size of a command or acknowledgement frame on the serial link.
pub const FRAME_SIZE: usize = 16;

/// Size of a command frame followed by one page of payload.
pub const DATA_FRAME_SIZE: usize = FRAME_SIZE + PAGE_SIZE;

/// Default baud rate of the serial link.
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Flash address of the application metadata (checksum, version, address, length).
pub const APP_INFO_FLASH_ADDR: u32 = 0x003F_0000;
pub const APP_INFO_SIZE: u32 = 0x10;

/// Flash address of the vector block header (checksum, version, address, length).
pub const APP_ISR_INFO_FLASH_ADDR: u32 = 0x003F_0010;
pub const APP_ISR_INFO_SIZE: u32 = 0x10;

/// Flash address and size of the application vector block.
/// 0xC0 bytes hold the 16 core exception entries plus 32 device interrupts.
pub const APP_ISR_FLASH_ADDR: u32 = 0x003F_0020;
pub const APP_ISR_SIZE: u32 = 0xC0;

/// Flash address of the application image.
pub const APP_FLASH_ADDR: u32 = 0x0040_0000;

/// Address the core fetches vectors from once the application is launched.
pub const ISR_RAM_ADDR: u32 = 0x2000_0000;

/// RAM execution address of the application image.
pub const APP_RAM_ADDR: u32 = 0x2001_0000;

/// Holding area for the application vector block until the exchange at launch.
pub const ISR_TEMP_RAM_ADDR: u32 = APP_RAM_ADDR - APP_ISR_SIZE;

/// Retained RAM word telling the bootloader what ran before the last reset.
pub const BOOT_MARKER_ADDR: u32 = 0x2000_FF00;

/// Largest application that fits between `APP_RAM_ADDR` and the bootloader's own RAM.
pub const APP_MAX_SIZE: u32 = 0x0002_8000;

/// Offset of the application inside a linked firmware binary.
/// Everything before it is the vector region, of which the first `APP_ISR_SIZE` bytes are kept.
pub const APP_BIN_OFFSET: u32 = APP_RAM_ADDR - ISR_RAM_ADDR;

/// Residency marker left by the bootloader itself.
pub const MARKER_BOOT: u32 = 0xB000_0000;

/// Residency marker left by a launched application.
pub const MARKER_APP: u32 = 0xB000_0001;

/// Uptime after which a resident application is checked and launched
/// unless the host reclaimed the bootloader.
pub const SAVE_BRICK_GRACE_MS: u64 = 1000;

const _: () = assert!(32 + APP_ISR_SIZE as usize <= PAGE_SIZE);
const _: () = assert!(APP_ISR_INFO_FLASH_ADDR == APP_INFO_FLASH_ADDR + APP_INFO_SIZE);
const _: () = assert!(APP_ISR_FLASH_ADDR == APP_ISR_INFO_FLASH_ADDR + APP_ISR_INFO_SIZE);
const _: () = assert!(APP_FLASH_ADDR + APP_MAX_SIZE <= FLASH_ADDRESS_LIMIT);
