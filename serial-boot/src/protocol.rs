// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bootloader state machine.
//!
//! Every accepted [`CommandFrame`] becomes the current state and is
//! acknowledged at once. State handlers then run on each [`UpdateProtocol::poll`]
//! until they hand back to [`Command::Ready`].

use crate::config::BootConfig;
use crate::flash::{FlashController, FlashError, FlashStatus};
use crate::hal::{Clock, Platform, SpiBus, Transport};
use crate::validator::ImageValidator;
use boot_protocol::{AckFrame, BootMode, Command, CommandFrame, InfoReport, SessionFlags};
use consts::{DATA_FRAME_SIZE, FRAME_SIZE, MARKER_APP, MARKER_BOOT, PAGE_SIZE};

/// What the caller has to do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Continue,
    /// Reset the CPU.
    Reset,
    /// Vectors are exchanged; hand control to the loaded image.
    Launch,
}

/// State owned by the state machine for the lifetime of the bootloader.
#[derive(Debug)]
pub struct BootSession {
    pub state: Command,
    pub last_accepted: CommandFrame,
    /// Frame length announced by the last `NextSet`.
    pub next_frame_length: u32,
    pub is_app_resident: bool,
    pub is_image_verified: bool,
    pub check: ImageValidator,
    payload: [u8; PAGE_SIZE],
    payload_len: usize,
    /// The flash operation of the current Erase or Write was issued.
    op_issued: bool,
    /// A flash read for the current state is in progress.
    read_pending: bool,
    read_cursor: u32,
    read_remaining: u32,
}

impl BootSession {
    fn new() -> Self {
        Self {
            state: Command::Unknown,
            last_accepted: CommandFrame::default(),
            next_frame_length: FRAME_SIZE as u32,
            is_app_resident: false,
            is_image_verified: false,
            check: ImageValidator::default(),
            payload: [0; PAGE_SIZE],
            payload_len: 0,
            op_issued: false,
            read_pending: false,
            read_cursor: 0,
            read_remaining: 0,
        }
    }

    pub fn check_progress(&self) -> u32 {
        self.check.progress()
    }

    /// Length the receiver is armed with for the next frame.
    pub fn expected_frame_len(&self) -> usize {
        if self.next_frame_length as usize == DATA_FRAME_SIZE {
            DATA_FRAME_SIZE
        } else {
            FRAME_SIZE
        }
    }
}

pub struct UpdateProtocol<T, S, C, P> {
    transport: T,
    flash: FlashController<S>,
    clock: C,
    platform: P,
    config: BootConfig,
    session: BootSession,
    rx: [u8; DATA_FRAME_SIZE],
}

impl<T, S, C, P> UpdateProtocol<T, S, C, P>
where
    T: Transport,
    S: SpiBus,
    C: Clock,
    P: Platform,
{
    /// Arms the receiver for the first command frame.
    pub fn new(mut transport: T, spi: S, clock: C, platform: P, config: BootConfig) -> Self {
        transport.receive(FRAME_SIZE);
        Self {
            transport,
            flash: FlashController::new(spi),
            clock,
            platform,
            config,
            session: BootSession::new(),
            rx: [0; DATA_FRAME_SIZE],
        }
    }

    pub fn session(&self) -> &BootSession {
        &self.session
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn flash(&self) -> &FlashController<S> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut FlashController<S> {
        &mut self.flash
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn session_flags(&self) -> SessionFlags {
        let mut flags = SessionFlags::empty();
        flags.set(SessionFlags::APP_RESIDENT, self.session.is_app_resident);
        flags.set(SessionFlags::IMAGE_VERIFIED, self.session.is_image_verified);
        flags.set(
            SessionFlags::FLASH_ERROR,
            self.flash.status().contains(FlashStatus::ERROR),
        );
        flags
    }

    /// One superloop iteration: take a received frame, advance the flash,
    /// run the current state.
    pub fn poll(&mut self) -> Outcome {
        if let Some(len) = self.transport.poll_received(&mut self.rx) {
            self.ingest(len);
            self.transport.receive(self.session.expected_frame_len());
        }
        self.flash.process();
        self.step()
    }

    fn ingest(&mut self, len: usize) {
        let (command, frame) = match CommandFrame::validate(&self.rx[..len]) {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("frame dropped: {:?}", e);
                return;
            }
        };
        if command == Command::Write && len < DATA_FRAME_SIZE {
            debug!("write frame without payload dropped");
            return;
        }
        debug!("{:?} addr {:#x} len {}", command, frame.address, frame.length);

        let session = &mut self.session;
        session.last_accepted = frame;
        session.op_issued = false;
        session.read_pending = false;
        session.check.reset();

        match command {
            Command::NextSet => session.next_frame_length = frame.length,
            Command::Erase | Command::SaveBrick => session.is_image_verified = false,
            Command::Write => {
                session.is_image_verified = false;
                let n = (frame.length as usize).min(PAGE_SIZE);
                session.payload[..n].copy_from_slice(&self.rx[FRAME_SIZE..FRAME_SIZE + n]);
                session.payload_len = n;
            }
            Command::Read => {
                session.read_cursor = frame.address;
                session.read_remaining = frame.length;
            }
            _ => {}
        }
        session.state = command;

        if let Err(e) = self.transport.send(&AckFrame::echo(&frame).to_bytes()) {
            warn!("ack for {:?} not sent: {:?}", command, e);
        }
    }

    fn step(&mut self) -> Outcome {
        let next = match self.session.state {
            Command::Unknown => self.on_unknown(),
            Command::Ready => self.on_ready(),
            Command::SaveBrick => {
                info!("save brick: autoboot disabled");
                self.session.is_app_resident = false;
                self.session.is_image_verified = false;
                Command::Ready
            }
            Command::EnterBoot => {
                self.session.is_app_resident = false;
                Command::Ready
            }
            Command::EnterApp => {
                self.session.is_app_resident = true;
                Command::Ready
            }
            Command::NextSet => Command::Ready,
            Command::Erase | Command::Write => self.on_flash_command(),
            Command::Read => self.on_read(),
            Command::SelfCheck => self.on_self_check(),
            Command::Info => self.on_info(),
            Command::Reset => return self.on_reset(),
            Command::Jump => return self.on_jump(),
        };
        self.enter(next);
        Outcome::Continue
    }

    fn enter(&mut self, next: Command) {
        if next == self.session.state {
            return;
        }
        trace!("{:?} -> {:?}", self.session.state, next);
        if next == Command::SelfCheck {
            self.session.check.reset();
            self.session.read_pending = false;
        }
        self.session.state = next;
    }

    fn on_unknown(&mut self) -> Command {
        let marker = self.platform.resident_marker();
        self.session.is_app_resident = match marker {
            MARKER_APP => true,
            MARKER_BOOT => false,
            other => {
                warn!("unrecognized residency marker {:#x}", other);
                self.config.unrecognized_marker_is_resident
            }
        };
        info!("application resident: {}", self.session.is_app_resident);
        Command::Ready
    }

    fn on_ready(&mut self) -> Command {
        if self.session.is_image_verified {
            return Command::Jump;
        }
        if self.session.is_app_resident && self.clock.uptime_ms() > self.config.grace_period_ms {
            info!("checking resident image");
            return Command::SelfCheck;
        }
        Command::Ready
    }

    fn on_flash_command(&mut self) -> Command {
        let state = self.session.state;
        let frame = self.session.last_accepted;

        if !self.session.op_issued {
            if self.flash.is_busy() {
                return state;
            }
            let result = match state {
                Command::Erase => self.flash.erase(frame.address, frame.length),
                _ => self
                    .flash
                    .write(frame.address, &self.session.payload[..self.session.payload_len]),
            };
            match result {
                Ok(()) => self.session.op_issued = true,
                Err(FlashError::Busy) => return state,
                Err(e) => {
                    warn!("{:?} at {:#x} refused: {:?}", state, frame.address, e);
                    return Command::Ready;
                }
            }
        }

        if self.flash.is_busy() || !self.transport.tx_done() {
            return state;
        }
        if self.flash.status().contains(FlashStatus::ERROR) {
            warn!(
                "{:?} at {:#x} failed, {} flash errors",
                state,
                frame.address,
                self.flash.error_count()
            );
        }
        Command::Ready
    }

    fn on_read(&mut self) -> Command {
        if self.session.read_pending {
            if self.flash.is_busy() || !self.transport.tx_done() {
                return Command::Read;
            }
            self.session.read_pending = false;
            if self.flash.status().contains(FlashStatus::ERROR) {
                warn!("read at {:#x} failed", self.session.read_cursor);
                return Command::Ready;
            }
            let data = self.flash.read_data();
            if let Err(e) = self.transport.send(data) {
                warn!("read data not sent: {:?}", e);
                return Command::Ready;
            }
            let n = data.len() as u32;
            self.session.read_cursor += n;
            self.session.read_remaining -= n;
        }

        if self.session.read_remaining == 0 {
            return Command::Ready;
        }
        if self.flash.is_busy() {
            return Command::Read;
        }
        let len = (self.session.read_remaining as usize).min(PAGE_SIZE);
        match self.flash.read(self.session.read_cursor, len) {
            Ok(()) => self.session.read_pending = true,
            Err(FlashError::Busy) => {}
            Err(e) => {
                warn!("read at {:#x} refused: {:?}", self.session.read_cursor, e);
                return Command::Ready;
            }
        }
        Command::Read
    }

    fn on_self_check(&mut self) -> Command {
        let layout = self.config.layout;

        if self.session.read_pending {
            if self.flash.is_busy() {
                return Command::SelfCheck;
            }
            self.session.read_pending = false;
            if self.flash.status().contains(FlashStatus::ERROR) {
                warn!("self-check read failed, retrying");
                return Command::SelfCheck;
            }

            let data = self.flash.read_data();
            if self.session.check.metadata().is_none() {
                match self.session.check.load_metadata(data, &layout) {
                    Ok(metadata) => {
                        info!(
                            "image version {:#x}, {} bytes",
                            metadata.version, metadata.length
                        );
                        self.platform.stage_vectors(&metadata.isr_block);
                    }
                    Err(e) => {
                        warn!("image metadata rejected: {:?}", e);
                        return Command::SaveBrick;
                    }
                }
            } else {
                let offset = self.session.check.absorb(data);
                self.platform.load_image_chunk(offset, data);
            }
        }

        let chunk = if self.session.check.metadata().is_none() {
            Some((self.config.metadata_flash_addr, layout.metadata_read_len()))
        } else {
            self.session.check.next_chunk()
        };
        let Some((address, len)) = chunk else {
            return match self.session.check.finish() {
                Ok(()) => {
                    info!("image verified");
                    self.session.is_image_verified = true;
                    self.session.check.reset();
                    Command::Ready
                }
                Err(e) => {
                    warn!("image rejected: {:?}", e);
                    Command::SaveBrick
                }
            };
        };

        if self.flash.is_busy() {
            return Command::SelfCheck;
        }
        match self.flash.read(address, len) {
            Ok(()) => self.session.read_pending = true,
            Err(FlashError::Busy) => {}
            Err(e) => {
                warn!("self-check read at {:#x} refused: {:?}", address, e);
                return Command::SaveBrick;
            }
        }
        Command::SelfCheck
    }

    fn on_info(&mut self) -> Command {
        if !self.transport.tx_done() {
            return Command::Info;
        }
        let mode = if self.session.is_app_resident {
            BootMode::Application
        } else {
            BootMode::Bootloader
        };
        let report = InfoReport {
            mode,
            flags: self.session_flags(),
        };
        if let Err(e) = self.transport.send(&report.to_frame().to_bytes()) {
            warn!("info report not sent: {:?}", e);
        }
        Command::Ready
    }

    fn on_reset(&mut self) -> Outcome {
        if !self.transport.tx_done() {
            return Outcome::Continue;
        }
        info!("reset");
        self.session.state = Command::Unknown;
        Outcome::Reset
    }

    fn on_jump(&mut self) -> Outcome {
        if !self.session.is_image_verified {
            warn!("jump refused: image not verified");
            self.enter(Command::Ready);
            return Outcome::Continue;
        }
        if !self.transport.tx_done() {
            return Outcome::Continue;
        }
        info!("launching image");
        self.platform.exchange_vectors();
        self.session.is_image_verified = false;
        self.session.state = Command::Ready;
        Outcome::Launch
    }
}
