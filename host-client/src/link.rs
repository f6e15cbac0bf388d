// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use boot_protocol::{AckFrame, Command, CommandFrame, FrameError, ImageError, InfoReport};
use consts::{DATA_FRAME_SIZE, FRAME_SIZE, PAGE_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// No reply within the link timeout.
    Timeout(Command),
    /// The acknowledgement did not match the command sent.
    Ack(Command, FrameError),
    /// The device only accepts frames of 16 or 272 bytes.
    FrameLength(u32),
    Image(ImageError),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "serial I/O error: {e}"),
            Error::Timeout(cmd) => write!(f, "no reply to {cmd:?}"),
            Error::Ack(cmd, e) => write!(f, "bad reply to {cmd:?}: {e}"),
            Error::FrameLength(len) => write!(f, "unsupported frame length {len}"),
            Error::Image(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

/// Host side of the bootloader link.
///
/// Tracks the frame length the device is armed for so every frame goes out
/// with the size it waits for.
pub struct BootLink<P> {
    port: P,
    data_frames: bool,
    timeout: Duration,
}

impl<P: AsyncRead + AsyncWrite + Unpin> BootLink<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            data_frames: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// For a device left in data frame mode by an earlier session.
    pub fn assume_data_frames(mut self, on: bool) -> Self {
        self.data_frames = on;
        self
    }

    pub fn data_frames(&self) -> bool {
        self.data_frames
    }

    /// Sends a command without payload and waits for its acknowledgement.
    pub async fn command(&mut self, command: Command, address: u32, length: u32) -> Result<AckFrame, Error> {
        self.transact(command, address, length, &[]).await
    }

    /// Sends a command followed by one page of payload. The device must be in
    /// data frame mode.
    pub async fn data_command(
        &mut self,
        command: Command,
        address: u32,
        length: u32,
        payload: &[u8],
    ) -> Result<AckFrame, Error> {
        self.transact(command, address, length, payload).await
    }

    /// Switches the frame length the device waits for.
    pub async fn set_frame_length(&mut self, length: u32) -> Result<(), Error> {
        if length as usize != FRAME_SIZE && length as usize != DATA_FRAME_SIZE {
            return Err(Error::FrameLength(length));
        }
        self.command(Command::NextSet, 0, length).await?;
        self.data_frames = length as usize == DATA_FRAME_SIZE;
        Ok(())
    }

    pub async fn info(&mut self) -> Result<InfoReport, Error> {
        self.command(Command::Info, 0, 0).await?;
        let bytes = self.read_exact(Command::Info, FRAME_SIZE).await?;
        let frame = AckFrame::from_bytes(&bytes).map_err(|e| Error::Ack(Command::Info, e))?;
        InfoReport::from_frame(&frame).map_err(|e| Error::Ack(Command::Info, e))
    }

    /// Reads `length` bytes of flash, which arrive one page at a time after the ack.
    pub async fn read_flash(&mut self, address: u32, length: u32) -> Result<Vec<u8>, Error> {
        self.command(Command::Read, address, length).await?;
        let mut data = Vec::with_capacity(length as usize);
        while data.len() < length as usize {
            let chunk = (length as usize - data.len()).min(PAGE_SIZE);
            data.extend(self.read_exact(Command::Read, chunk).await?);
        }
        Ok(data)
    }

    /// Prints whatever the device sends until `duration` passes without traffic.
    pub async fn listen(&mut self, duration: Duration) -> Result<(), Error> {
        let mut buf = [0u8; DATA_FRAME_SIZE];
        while let Ok(read) = tokio::time::timeout(duration, self.port.read(&mut buf)).await {
            let n = read?;
            if n == 0 {
                break;
            }
            println!("<<{:02x?}", &buf[..n]);
        }
        Ok(())
    }

    async fn transact(
        &mut self,
        command: Command,
        address: u32,
        length: u32,
        payload: &[u8],
    ) -> Result<AckFrame, Error> {
        let frame = CommandFrame::new(command, address, length);
        if self.data_frames {
            self.port.write_all(&frame.to_bytes_with_payload(payload)).await?;
        } else {
            self.port.write_all(&frame.to_bytes()).await?;
        }
        self.port.flush().await?;
        log::trace!("{command:?} {address:#x} {length} sent");

        let reply = self.read_exact(command, FRAME_SIZE).await?;
        let ack = AckFrame::check(&reply, command, address, length).map_err(|e| Error::Ack(command, e))?;
        log::debug!("{command:?} acknowledged");
        Ok(ack)
    }

    async fn read_exact(&mut self, command: Command, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(self.timeout, self.port.read_exact(&mut buf))
            .await
            .map_err(|_| Error::Timeout(command))??;
        Ok(buf)
    }
}
