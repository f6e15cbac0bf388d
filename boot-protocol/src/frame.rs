// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::checksum::checksum;
use crate::{BootMode, Command, SessionFlags};
use consts::{DATA_FRAME_SIZE, FRAME_SIZE, PAGE_SIZE};

/// Errors raised while decoding or checking frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Fewer than [`FRAME_SIZE`] bytes were supplied.
    TooShort(usize),
    /// The stored checksum does not cover the frame body.
    ChecksumMismatch { expected: u32, computed: u32 },
    /// The command word is not a known [`Command`].
    UnknownCommand(u32),
    /// An acknowledgement answered a different command.
    CommandMismatch { expected: u32, found: u32 },
    /// An acknowledgement echoed different address/length values.
    EchoMismatch { expected: (u32, u32), found: (u32, u32) },
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "frame too short: {len} bytes"),
            Self::ChecksumMismatch { expected, computed } => {
                write!(f, "frame checksum mismatch: stored {expected:#010x}, computed {computed:#010x}")
            }
            Self::UnknownCommand(cmd) => write!(f, "unknown command {cmd}"),
            Self::CommandMismatch { expected, found } => {
                write!(f, "ack for command {found}, expected {expected}")
            }
            Self::EchoMismatch { expected, found } => write!(
                f,
                "ack echoed {:#x}/{}, expected {:#x}/{}",
                found.0, found.1, expected.0, expected.1
            ),
        }
    }
}

fn read_word(bytes: &[u8], index: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[index * 4..index * 4 + 4]);
    u32::from_le_bytes(word)
}

/// Checksum of the three body words, the part of a frame the checksum covers.
fn body_checksum(w1: u32, w2: u32, w3: u32) -> u32 {
    let mut body = [0u8; 12];
    body[..4].copy_from_slice(&w1.to_le_bytes());
    body[4..8].copy_from_slice(&w2.to_le_bytes());
    body[8..].copy_from_slice(&w3.to_le_bytes());
    checksum(&body, 0)
}

fn encode(words: [u32; 4]) -> [u8; FRAME_SIZE] {
    let mut buf = [0u8; FRAME_SIZE];
    for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    buf
}

fn decode(bytes: &[u8]) -> Result<[u32; 4], FrameError> {
    if bytes.len() < FRAME_SIZE {
        return Err(FrameError::TooShort(bytes.len()));
    }
    Ok([read_word(bytes, 0), read_word(bytes, 1), read_word(bytes, 2), read_word(bytes, 3)])
}

/// Host to device command: `[checksum][command][address][length]`, little endian.
///
/// The checksum covers bytes 4..16 only. A payload that follows the header
/// (for [`Command::Write`]) carries no checksum of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandFrame {
    pub checksum: u32,
    pub command: u32,
    pub address: u32,
    pub length: u32,
}

impl CommandFrame {
    pub const SIZE: usize = FRAME_SIZE;

    /// Builds a frame with a correct checksum.
    pub fn new(command: Command, address: u32, length: u32) -> Self {
        let command = command as u32;
        Self {
            checksum: body_checksum(command, address, length),
            command,
            address,
            length,
        }
    }

    /// Decodes the first [`FRAME_SIZE`] bytes without checking them.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let [checksum, command, address, length] = decode(bytes)?;
        Ok(Self {
            checksum,
            command,
            address,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        encode([self.checksum, self.command, self.address, self.length])
    }

    /// Encodes the frame followed by one page of payload, zero padded.
    /// Payload beyond one page is cut off.
    pub fn to_bytes_with_payload(&self, payload: &[u8]) -> [u8; DATA_FRAME_SIZE] {
        let mut buf = [0u8; DATA_FRAME_SIZE];
        buf[..FRAME_SIZE].copy_from_slice(&self.to_bytes());
        let len = payload.len().min(PAGE_SIZE);
        buf[FRAME_SIZE..FRAME_SIZE + len].copy_from_slice(&payload[..len]);
        buf
    }

    pub fn is_valid(&self) -> bool {
        self.checksum == body_checksum(self.command, self.address, self.length)
    }

    pub fn command(&self) -> Result<Command, FrameError> {
        Command::try_from(self.command)
    }

    /// Decodes and checks a received frame. Only a frame with a matching
    /// checksum and a known command is accepted.
    pub fn validate(bytes: &[u8]) -> Result<(Command, Self), FrameError> {
        let frame = Self::from_bytes(bytes)?;
        let computed = body_checksum(frame.command, frame.address, frame.length);
        if frame.checksum != computed {
            return Err(FrameError::ChecksumMismatch {
                expected: frame.checksum,
                computed,
            });
        }
        Ok((frame.command()?, frame))
    }
}

/// Device to host acknowledgement: `[checksum][~command][code0][code1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AckFrame {
    pub checksum: u32,
    pub command_complement: u32,
    pub code0: u32,
    pub code1: u32,
}

impl AckFrame {
    pub const SIZE: usize = FRAME_SIZE;

    pub fn new(command: Command, code0: u32, code1: u32) -> Self {
        let command_complement = u32::MAX - command as u32;
        Self {
            checksum: body_checksum(command_complement, code0, code1),
            command_complement,
            code0,
            code1,
        }
    }

    /// Acknowledgement for an accepted command, echoing its address and length.
    pub fn echo(frame: &CommandFrame) -> Self {
        let command_complement = u32::MAX - frame.command;
        Self {
            checksum: body_checksum(command_complement, frame.address, frame.length),
            command_complement,
            code0: frame.address,
            code1: frame.length,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let [checksum, command_complement, code0, code1] = decode(bytes)?;
        Ok(Self {
            checksum,
            command_complement,
            code0,
            code1,
        })
    }

    pub fn to_bytes(&self) -> [u8; FRAME_SIZE] {
        encode([self.checksum, self.command_complement, self.code0, self.code1])
    }

    pub fn command(&self) -> Result<Command, FrameError> {
        Command::try_from(u32::MAX - self.command_complement)
    }

    /// Checks an acknowledgement the way the host expects it: valid checksum,
    /// the complement of `command`, and `address`/`length` echoed back.
    pub fn check(bytes: &[u8], command: Command, address: u32, length: u32) -> Result<Self, FrameError> {
        let ack = Self::from_bytes(bytes)?;
        let computed = body_checksum(ack.command_complement, ack.code0, ack.code1);
        if ack.checksum != computed {
            return Err(FrameError::ChecksumMismatch {
                expected: ack.checksum,
                computed,
            });
        }
        let found = u32::MAX - ack.command_complement;
        if found != command as u32 {
            return Err(FrameError::CommandMismatch {
                expected: command as u32,
                found,
            });
        }
        if (ack.code0, ack.code1) != (address, length) {
            return Err(FrameError::EchoMismatch {
                expected: (address, length),
                found: (ack.code0, ack.code1),
            });
        }
        Ok(ack)
    }
}

/// Reply to [`Command::Info`], sent after its acknowledgement in an ack-shaped frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InfoReport {
    pub mode: BootMode,
    pub flags: SessionFlags,
}

impl InfoReport {
    pub fn to_frame(&self) -> AckFrame {
        AckFrame::new(Command::Info, self.mode as u32, self.flags.bits())
    }

    pub fn from_frame(frame: &AckFrame) -> Result<Self, FrameError> {
        let computed = body_checksum(frame.command_complement, frame.code0, frame.code1);
        if frame.checksum != computed {
            return Err(FrameError::ChecksumMismatch {
                expected: frame.checksum,
                computed,
            });
        }
        let command = frame.command()?;
        if command != Command::Info {
            return Err(FrameError::CommandMismatch {
                expected: Command::Info as u32,
                found: command as u32,
            });
        }
        Ok(Self {
            mode: BootMode::from_u32(frame.code0),
            flags: SessionFlags::from_bits_truncate(frame.code1),
        })
    }
}
