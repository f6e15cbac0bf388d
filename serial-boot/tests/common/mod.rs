// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(dead_code)]

use boot_protocol::{AckFrame, AppImageMetadata, Command, CommandFrame, ImageLayout};
use consts::{
    APP_FLASH_ADDR, APP_INFO_FLASH_ADDR, APP_ISR_SIZE, APP_MAX_SIZE, FLASH_ADDRESS_LIMIT, FLASH_CMD_HEADER_LEN,
    MARKER_BOOT, PAGE_SIZE, SECTOR_SIZE,
};
use serial_boot::{BootConfig, Clock, Outcome, Platform, SpiBus, SpiError, Transport, TransportError, UpdateProtocol};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

const WIP: u8 = 0x01;
const WEL: u8 = 0x02;

/// NOR flash part on an SPI bus. Erase and program only take effect with the
/// write enable latch set and the part idle; anything else counts as a violation.
pub struct SimFlash {
    pub memory: Vec<u8>,
    /// Status polls reporting "write in progress" after each erase or program.
    pub busy_polls: u32,
    /// Transfers until one fails, counted from the next one started.
    pub fail_in: Option<usize>,
    pub transfers: usize,
    pub violations: usize,
    wel: bool,
    wip_left: u32,
    reply: Option<Result<Vec<u8>, SpiError>>,
}

impl Default for SimFlash {
    fn default() -> Self {
        Self {
            memory: vec![0xFF; FLASH_ADDRESS_LIMIT as usize],
            busy_polls: 2,
            fail_in: None,
            transfers: 0,
            violations: 0,
            wel: false,
            wip_left: 0,
            reply: None,
        }
    }
}

impl SimFlash {
    pub fn load(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
    }

    pub fn slice(&self, address: u32, len: usize) -> &[u8] {
        &self.memory[address as usize..address as usize + len]
    }

    fn address(tx: &[u8]) -> usize {
        (tx[1] as usize) << 16 | (tx[2] as usize) << 8 | tx[3] as usize
    }

    fn execute(&mut self, tx: &[u8]) -> Vec<u8> {
        let mut rx = vec![0u8; tx.len()];
        match tx[0] {
            0x05 => {
                let busy = if self.wip_left > 0 {
                    self.wip_left -= 1;
                    WIP
                } else {
                    0
                };
                rx[1] = busy | if self.wel { WEL } else { 0 };
            }
            _ if self.wip_left > 0 => self.violations += 1,
            0x06 => self.wel = true,
            0xD8 if self.wel => {
                let base = Self::address(tx) & !(SECTOR_SIZE as usize - 1);
                self.memory[base..base + SECTOR_SIZE as usize].fill(0xFF);
                self.wel = false;
                self.wip_left = self.busy_polls;
            }
            0x02 if self.wel => {
                let address = Self::address(tx);
                let page = address & !(PAGE_SIZE - 1);
                for (i, b) in tx[FLASH_CMD_HEADER_LEN..].iter().enumerate() {
                    let offset = (address - page + i) % PAGE_SIZE;
                    self.memory[page + offset] &= b;
                }
                self.wel = false;
                self.wip_left = self.busy_polls;
            }
            0x03 => {
                let address = Self::address(tx);
                let len = tx.len() - FLASH_CMD_HEADER_LEN;
                rx[FLASH_CMD_HEADER_LEN..].copy_from_slice(&self.memory[address..address + len]);
            }
            _ => self.violations += 1,
        }
        rx
    }
}

impl SpiBus for SimFlash {
    fn start_transfer(&mut self, tx: &[u8]) -> Result<(), SpiError> {
        assert!(self.reply.is_none(), "transfer started while another is in flight");
        self.transfers += 1;
        if let Some(n) = self.fail_in.as_mut() {
            if *n == 0 {
                self.fail_in = None;
                self.reply = Some(Err(SpiError::Aborted));
                return Ok(());
            }
            *n -= 1;
        }
        let rx = self.execute(tx);
        self.reply = Some(Ok(rx));
        Ok(())
    }

    fn poll_transfer(&mut self, rx: &mut [u8]) -> Option<Result<(), SpiError>> {
        match self.reply.take()? {
            Ok(data) => {
                rx.copy_from_slice(&data);
                Some(Ok(()))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Serial link as a byte stream in each direction.
#[derive(Default)]
pub struct MockTransport {
    pub inbound: VecDeque<u8>,
    pub outbound: Vec<Vec<u8>>,
    pub armed: Option<usize>,
    /// `tx_done` queries answered with `false` after each send.
    pub tx_latency: u32,
    tx_pending: Cell<u32>,
}

impl MockTransport {
    pub fn push(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }
}

impl Transport for MockTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.tx_pending.get() > 0 {
            return Err(TransportError::Busy);
        }
        self.outbound.push(data.to_vec());
        self.tx_pending.set(self.tx_latency);
        Ok(())
    }

    fn tx_done(&self) -> bool {
        let pending = self.tx_pending.get();
        if pending > 0 {
            self.tx_pending.set(pending - 1);
        }
        pending == 0
    }

    fn receive(&mut self, len: usize) {
        self.armed = Some(len);
    }

    fn poll_received(&mut self, buf: &mut [u8]) -> Option<usize> {
        let len = self.armed?;
        if self.inbound.len() < len {
            return None;
        }
        for (dst, src) in buf.iter_mut().zip(self.inbound.drain(..len)) {
            *dst = src;
        }
        self.armed = None;
        Some(len)
    }
}

#[derive(Clone, Default)]
pub struct MockClock(pub Rc<Cell<u64>>);

impl Clock for MockClock {
    fn uptime_ms(&self) -> u64 {
        self.0.get()
    }
}

pub struct MockPlatform {
    pub marker: u32,
    pub ram: Vec<u8>,
    pub staged_vectors: Vec<u8>,
    pub exchanges: usize,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            marker: MARKER_BOOT,
            ram: vec![0; APP_MAX_SIZE as usize],
            staged_vectors: Vec::new(),
            exchanges: 0,
        }
    }
}

impl Platform for MockPlatform {
    fn resident_marker(&self) -> u32 {
        self.marker
    }

    fn load_image_chunk(&mut self, offset: u32, data: &[u8]) {
        let offset = offset as usize;
        self.ram[offset..offset + data.len()].copy_from_slice(data);
    }

    fn stage_vectors(&mut self, vectors: &[u8]) {
        self.staged_vectors = vectors.to_vec();
    }

    fn exchange_vectors(&mut self) {
        self.exchanges += 1;
    }
}

pub type Boot = UpdateProtocol<MockTransport, SimFlash, MockClock, MockPlatform>;

pub struct Rig {
    pub boot: Boot,
    pub clock: Rc<Cell<u64>>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with(MockPlatform::default(), BootConfig::default())
    }

    pub fn with(platform: MockPlatform, config: BootConfig) -> Self {
        let clock = MockClock::default();
        let handle = clock.0.clone();
        let boot = UpdateProtocol::new(MockTransport::default(), SimFlash::default(), clock, platform, config);
        Self { boot, clock: handle }
    }

    pub fn flash(&self) -> &SimFlash {
        self.boot.flash().bus()
    }

    pub fn flash_mut(&mut self) -> &mut SimFlash {
        self.boot.flash_mut().bus_mut()
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.boot.transport_mut().push(bytes);
    }

    pub fn command(&mut self, command: Command, address: u32, length: u32) {
        self.send(&CommandFrame::new(command, address, length).to_bytes());
    }

    /// Sends a command padded to a data frame.
    pub fn data_command(&mut self, command: Command, address: u32, length: u32, payload: &[u8]) {
        self.send(&CommandFrame::new(command, address, length).to_bytes_with_payload(payload));
    }

    /// Polls until the input is consumed, the flash is idle and the state is
    /// back to `Ready`, or until something other than `Continue` comes out.
    pub fn settle(&mut self) -> Outcome {
        for _ in 0..100_000 {
            let outcome = self.boot.poll();
            if outcome != Outcome::Continue {
                return outcome;
            }
            let idle = self.boot.transport().inbound.is_empty()
                && !self.boot.flash().is_busy()
                && self.boot.session().state == Command::Ready;
            if idle {
                return Outcome::Continue;
            }
        }
        panic!("bootloader did not settle in state {:?}", self.boot.session().state);
    }

    /// Polls until the device answers, the way a host waits for an ack, and
    /// returns the answer. Pending flash work is left running.
    pub fn await_ack(&mut self, command: Command, address: u32, length: u32) {
        for _ in 0..100_000 {
            self.boot.poll();
            if !self.boot.transport().outbound.is_empty() {
                let out = self.outbound();
                AckFrame::check(&out[0], command, address, length).unwrap();
                return;
            }
        }
        panic!("no ack for {command:?}");
    }

    /// Polls `count` times with no input, standing in for a host-side pause.
    pub fn idle(&mut self, count: usize) {
        for _ in 0..count {
            assert_eq!(self.boot.poll(), Outcome::Continue);
        }
    }

    pub fn outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.boot.transport_mut().outbound)
    }

    pub fn expect_ack(&mut self, command: Command, address: u32, length: u32) {
        let out = self.outbound();
        assert_eq!(out.len(), 1, "expected exactly one ack for {command:?}");
        AckFrame::check(&out[0], command, address, length).unwrap();
    }
}

pub fn sample_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 37 + i / 256) as u8).collect()
}

pub fn sample_isr() -> Vec<u8> {
    (0..APP_ISR_SIZE as usize).map(|i| 0xA0 ^ i as u8).collect()
}

pub fn metadata_for(image: &[u8]) -> AppImageMetadata {
    AppImageMetadata::for_image(0x0001_0002, &ImageLayout::DEFAULT, image, &sample_isr()).unwrap()
}

/// Places an image and its metadata page in flash, as a finished update leaves them.
pub fn install(flash: &mut SimFlash, image: &[u8], metadata: &AppImageMetadata) {
    flash.load(APP_FLASH_ADDR, image);
    flash.load(APP_INFO_FLASH_ADDR, &metadata.to_page().unwrap());
}
