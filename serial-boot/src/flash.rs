// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Polled erase, program and read on an SPI NOR flash.
//!
//! Requests are recorded and return at once. [`FlashController::process`]
//! advances the active operation by at most one SPI transfer per call.

use crate::hal::{SpiBus, SpiError};
use bitflags::bitflags;
use consts::{FLASH_ADDRESS_LIMIT, FLASH_CMD_HEADER_LEN, PAGE_SIZE, SECTOR_SIZE};
use heapless::Vec;

const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_SECTOR_ERASE: u8 = 0xD8;
const CMD_PAGE_PROGRAM: u8 = 0x02;
const CMD_READ: u8 = 0x03;
const CMD_READ_STATUS: u8 = 0x05;

/// Write in progress bit of the status register.
const SR_WIP: u8 = 0x01;

const BUF_LEN: usize = FLASH_CMD_HEADER_LEN + PAGE_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlashStatus: u8 {
        const READY = 1 << 0;
        const WRITE_ENABLING = 1 << 1;
        const ERASING = 1 << 2;
        const WRITING = 1 << 3;
        const READING = 1 << 4;
        /// Last operation was abandoned after a failed transfer.
        const ERROR = 1 << 5;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for FlashStatus {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "FlashStatus({=u8:#x})", self.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Another operation is in progress.
    Busy,
    /// The range does not fit 24-bit addressing.
    AddressOutOfRange(u32),
    /// More than one page was requested for a program or read.
    LengthTooLong(usize),
    Transfer(SpiError),
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Busy => write!(f, "flash busy"),
            Self::AddressOutOfRange(addr) => write!(f, "flash address {addr:#x} out of range"),
            Self::LengthTooLong(len) => write!(f, "{len} bytes exceed one flash page"),
            Self::Transfer(e) => write!(f, "flash transfer failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperationKind {
    Erase,
    Write,
    Read,
}

/// Next transfer of the active operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Step {
    WriteEnable,
    Command,
    PollStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashOperation {
    pub kind: OperationKind,
    pub address: u32,
    pub remaining_bytes: u32,
    /// Offset into the transmit buffer of the data still to be programmed.
    staged: usize,
    step: Step,
}

pub struct FlashController<S> {
    spi: S,
    tx: [u8; BUF_LEN],
    rx: [u8; BUF_LEN],
    /// Length of the transfer in flight, if any.
    in_flight: Option<usize>,
    op: Option<FlashOperation>,
    read_data: Vec<u8, PAGE_SIZE>,
    failed: bool,
    error_count: u32,
}

fn check_range(address: u32, length: u32) -> Result<(), FlashError> {
    match address.checked_add(length) {
        Some(end) if end <= FLASH_ADDRESS_LIMIT => Ok(()),
        _ => Err(FlashError::AddressOutOfRange(address)),
    }
}

impl<S: SpiBus> FlashController<S> {
    pub fn new(spi: S) -> Self {
        Self {
            spi,
            tx: [0; BUF_LEN],
            rx: [0; BUF_LEN],
            in_flight: None,
            op: None,
            read_data: Vec::new(),
            failed: false,
            error_count: 0,
        }
    }

    pub fn bus(&self) -> &S {
        &self.spi
    }

    pub fn bus_mut(&mut self) -> &mut S {
        &mut self.spi
    }

    pub fn is_busy(&self) -> bool {
        self.op.is_some() || self.in_flight.is_some()
    }

    pub fn status(&self) -> FlashStatus {
        let mut status = match self.op {
            None => FlashStatus::READY,
            Some(op) => {
                let mut status = match op.kind {
                    OperationKind::Erase => FlashStatus::ERASING,
                    OperationKind::Write => FlashStatus::WRITING,
                    OperationKind::Read => FlashStatus::READING,
                };
                if op.step == Step::WriteEnable {
                    status |= FlashStatus::WRITE_ENABLING;
                }
                status
            }
        };
        if self.failed {
            status |= FlashStatus::ERROR;
        }
        status
    }

    pub fn operation(&self) -> Option<&FlashOperation> {
        self.op.as_ref()
    }

    /// Number of failed transfers since power on or the last reset of the counter.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn reset_error_count(&mut self) {
        self.error_count = 0;
    }

    /// Clears [`FlashStatus::ERROR`].
    pub fn reset_status(&mut self) {
        self.failed = false;
    }

    /// Data of the last completed read.
    pub fn read_data(&self) -> &[u8] {
        &self.read_data
    }

    /// Erases every sector touched by `length` bytes from `address`, one sector
    /// per step. An unaligned range is widened to whole sectors on both ends.
    pub fn erase(&mut self, address: u32, length: u32) -> Result<(), FlashError> {
        check_range(address, length)?;
        if length == 0 {
            return self.begin(OperationKind::Erase, address, 0);
        }
        let first = address & !(SECTOR_SIZE - 1);
        let sectors = (address + length - first).div_ceil(SECTOR_SIZE);
        self.begin(OperationKind::Erase, first, sectors * SECTOR_SIZE)
    }

    /// Copies `data` into the transmit buffer and programs it at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.is_busy() {
            return Err(FlashError::Busy);
        }
        if data.len() > PAGE_SIZE {
            return Err(FlashError::LengthTooLong(data.len()));
        }
        self.tx[FLASH_CMD_HEADER_LEN..FLASH_CMD_HEADER_LEN + data.len()].copy_from_slice(data);
        self.write_staged(address, data.len())
    }

    /// Payload area of the transmit buffer, for callers that fill it in place
    /// before [`write_staged`](Self::write_staged).
    pub fn payload_mut(&mut self) -> Result<&mut [u8], FlashError> {
        if self.is_busy() {
            return Err(FlashError::Busy);
        }
        Ok(&mut self.tx[FLASH_CMD_HEADER_LEN..])
    }

    /// Programs the first `length` payload bytes already in the transmit buffer.
    pub fn write_staged(&mut self, address: u32, length: usize) -> Result<(), FlashError> {
        if length > PAGE_SIZE {
            return Err(FlashError::LengthTooLong(length));
        }
        self.begin(OperationKind::Write, address, length as u32)
    }

    /// Reads up to one page from `address` into [`read_data`](Self::read_data).
    pub fn read(&mut self, address: u32, length: usize) -> Result<(), FlashError> {
        if length > PAGE_SIZE {
            return Err(FlashError::LengthTooLong(length));
        }
        self.begin(OperationKind::Read, address, length as u32)
    }

    fn begin(&mut self, kind: OperationKind, address: u32, length: u32) -> Result<(), FlashError> {
        if self.is_busy() {
            return Err(FlashError::Busy);
        }
        check_range(address, length)?;

        self.failed = false;
        if kind == OperationKind::Read {
            self.read_data.clear();
        }
        if length == 0 {
            trace!("flash {:?} of 0 bytes at {:#x}", kind, address);
            return Ok(());
        }

        let step = match kind {
            OperationKind::Read => Step::Command,
            OperationKind::Erase | OperationKind::Write => Step::WriteEnable,
        };
        self.op = Some(FlashOperation {
            kind,
            address,
            remaining_bytes: length,
            staged: 0,
            step,
        });
        debug!("flash {:?} of {} bytes at {:#x}", kind, length, address);
        Ok(())
    }

    /// Advances the active operation. Call once per loop iteration.
    pub fn process(&mut self) {
        if let Some(len) = self.in_flight {
            match self.spi.poll_transfer(&mut self.rx[..len]) {
                None => return,
                Some(Ok(())) => {
                    self.in_flight = None;
                    self.transfer_done();
                }
                Some(Err(e)) => {
                    self.in_flight = None;
                    self.abandon(e);
                    return;
                }
            }
        }

        if self.in_flight.is_none() {
            self.start_next();
        }
    }

    fn abandon(&mut self, e: SpiError) {
        self.error_count = self.error_count.wrapping_add(1);
        self.failed = true;
        if let Some(op) = self.op.take() {
            warn!(
                "flash {:?} abandoned at {:#x}: {:?} (errors: {})",
                op.kind, op.address, e, self.error_count
            );
        }
    }

    fn chunk_len(op: &FlashOperation) -> usize {
        match op.kind {
            OperationKind::Erase => op.remaining_bytes.min(SECTOR_SIZE) as usize,
            // Never cross a page boundary: the part would wrap inside the page.
            OperationKind::Write => {
                let to_boundary = PAGE_SIZE - op.address as usize % PAGE_SIZE;
                (op.remaining_bytes as usize).min(to_boundary)
            }
            OperationKind::Read => op.remaining_bytes as usize,
        }
    }

    fn start_next(&mut self) {
        let Some(op) = self.op else {
            return;
        };

        let result = match op.step {
            Step::WriteEnable => {
                self.tx[0] = CMD_WRITE_ENABLE;
                self.start(0, 1)
            }
            Step::PollStatus => {
                self.tx[0] = CMD_READ_STATUS;
                self.tx[1] = 0;
                self.start(0, 2)
            }
            Step::Command => {
                let opcode = match op.kind {
                    OperationKind::Erase => CMD_SECTOR_ERASE,
                    OperationKind::Write => CMD_PAGE_PROGRAM,
                    OperationKind::Read => CMD_READ,
                };
                let (start, len) = match op.kind {
                    OperationKind::Erase => (0, FLASH_CMD_HEADER_LEN),
                    // The header goes right in front of the unprogrammed data.
                    OperationKind::Write => (op.staged, FLASH_CMD_HEADER_LEN + Self::chunk_len(&op)),
                    OperationKind::Read => {
                        let len = FLASH_CMD_HEADER_LEN + Self::chunk_len(&op);
                        self.tx[FLASH_CMD_HEADER_LEN..len].fill(0);
                        (0, len)
                    }
                };
                let [_, a2, a1, a0] = op.address.to_be_bytes();
                self.tx[start..start + FLASH_CMD_HEADER_LEN].copy_from_slice(&[opcode, a2, a1, a0]);
                self.start(start, len)
            }
        };

        if let Err(e) = result {
            self.abandon(e);
        }
    }

    fn start(&mut self, start: usize, len: usize) -> Result<(), SpiError> {
        self.spi.start_transfer(&self.tx[start..start + len])?;
        self.in_flight = Some(len);
        Ok(())
    }

    fn transfer_done(&mut self) {
        let Some(mut op) = self.op else {
            return;
        };

        match op.step {
            Step::WriteEnable => op.step = Step::Command,
            Step::Command => match op.kind {
                OperationKind::Read => {
                    let len = Self::chunk_len(&op);
                    // Capacity is one page, reads are capped at one page.
                    let _ = self
                        .read_data
                        .extend_from_slice(&self.rx[FLASH_CMD_HEADER_LEN..FLASH_CMD_HEADER_LEN + len]);
                    self.advance(op, len);
                    return;
                }
                OperationKind::Erase | OperationKind::Write => op.step = Step::PollStatus,
            },
            Step::PollStatus => {
                if self.rx[1] & SR_WIP == 0 {
                    let len = Self::chunk_len(&op);
                    self.advance(op, len);
                    return;
                }
            }
        }
        self.op = Some(op);
    }

    fn advance(&mut self, mut op: FlashOperation, len: usize) {
        op.remaining_bytes -= len as u32;
        match op.kind {
            OperationKind::Erase => op.address = op.address.wrapping_add(SECTOR_SIZE),
            OperationKind::Write | OperationKind::Read => op.address += len as u32,
        }
        op.staged += len;

        if op.remaining_bytes == 0 {
            trace!("flash {:?} done", op.kind);
            self.op = None;
        } else {
            op.step = match op.kind {
                OperationKind::Read => Step::Command,
                OperationKind::Erase | OperationKind::Write => Step::WriteEnable,
            };
            self.op = Some(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec as StdVec;

    /// Bus that records every transfer and answers from a script.
    #[derive(Default)]
    struct ScriptedBus {
        sent: StdVec<StdVec<u8>>,
        /// Replies for the status register, consumed front first. Idle once empty.
        status: VecDeque<u8>,
        fail_next: Option<SpiError>,
        pending: bool,
    }

    impl SpiBus for ScriptedBus {
        fn start_transfer(&mut self, tx: &[u8]) -> Result<(), SpiError> {
            self.sent.push(tx.to_vec());
            self.pending = true;
            Ok(())
        }

        fn poll_transfer(&mut self, rx: &mut [u8]) -> Option<Result<(), SpiError>> {
            if !self.pending {
                return None;
            }
            self.pending = false;
            if let Some(e) = self.fail_next.take() {
                return Some(Err(e));
            }
            let last = self.sent.last().unwrap();
            match last[0] {
                CMD_READ_STATUS => rx[1] = self.status.pop_front().unwrap_or(0),
                CMD_READ => {
                    for (i, b) in rx[FLASH_CMD_HEADER_LEN..].iter_mut().enumerate() {
                        *b = i as u8;
                    }
                }
                _ => {}
            }
            Some(Ok(()))
        }
    }

    fn run(flash: &mut FlashController<ScriptedBus>) {
        for _ in 0..1000 {
            if !flash.is_busy() {
                return;
            }
            flash.process();
        }
        panic!("flash never finished");
    }

    #[test]
    fn erase_enables_writes_before_every_sector() {
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.erase(0x0001_0000, 2 * SECTOR_SIZE).unwrap();
        assert!(flash.is_busy());
        assert!(flash.status().contains(FlashStatus::ERASING | FlashStatus::WRITE_ENABLING));
        run(&mut flash);

        let opcodes: StdVec<u8> = flash.bus().sent.iter().map(|t| t[0]).collect();
        assert_eq!(
            opcodes,
            [
                CMD_WRITE_ENABLE,
                CMD_SECTOR_ERASE,
                CMD_READ_STATUS,
                CMD_WRITE_ENABLE,
                CMD_SECTOR_ERASE,
                CMD_READ_STATUS
            ]
        );
        assert_eq!(flash.bus().sent[1], [CMD_SECTOR_ERASE, 0x01, 0x00, 0x00]);
        assert_eq!(flash.bus().sent[4], [CMD_SECTOR_ERASE, 0x02, 0x00, 0x00]);
        assert_eq!(flash.status(), FlashStatus::READY);
    }

    #[test]
    fn unaligned_erase_covers_every_touched_sector() {
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.erase(0x0001_F000, 0x2000).unwrap();
        run(&mut flash);

        let erases: StdVec<&StdVec<u8>> = flash.bus().sent.iter().filter(|t| t[0] == CMD_SECTOR_ERASE).collect();
        assert_eq!(erases.len(), 2);
        assert_eq!(erases[0][1..], [0x01, 0x00, 0x00]);
        assert_eq!(erases[1][1..], [0x02, 0x00, 0x00]);

        // A short range inside one sector still erases exactly that sector.
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.erase(0x0004_0100, 16).unwrap();
        run(&mut flash);
        let erases: StdVec<&StdVec<u8>> = flash.bus().sent.iter().filter(|t| t[0] == CMD_SECTOR_ERASE).collect();
        assert_eq!(erases.len(), 1);
        assert_eq!(erases[0][1..], [0x04, 0x00, 0x00]);
    }

    #[test]
    fn status_is_polled_until_write_completes() {
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.bus_mut().status.extend([SR_WIP, SR_WIP, 0]);
        flash.write(0x1000, &[1, 2, 3]).unwrap();
        run(&mut flash);

        let sent = &flash.bus().sent;
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[1], [CMD_PAGE_PROGRAM, 0x00, 0x10, 0x00, 1, 2, 3]);
        assert!(sent[2..].iter().all(|t| t[0] == CMD_READ_STATUS));
    }

    #[test]
    fn write_is_split_at_page_boundary() {
        let mut flash = FlashController::new(ScriptedBus::default());
        let data: StdVec<u8> = (0..16).collect();
        flash.write(0x10F8, &data).unwrap();
        run(&mut flash);

        let programs: StdVec<&StdVec<u8>> = flash.bus().sent.iter().filter(|t| t[0] == CMD_PAGE_PROGRAM).collect();
        assert_eq!(programs.len(), 2);
        assert_eq!(programs[0][1..4], [0x00, 0x10, 0xF8]);
        assert_eq!(programs[0][4..], data[..8]);
        assert_eq!(programs[1][1..4], [0x00, 0x11, 0x00]);
        assert_eq!(programs[1][4..], data[8..]);
    }

    #[test]
    fn staged_payload_is_programmed_without_copy() {
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.payload_mut().unwrap()[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        flash.write_staged(0x20, 4).unwrap();
        run(&mut flash);
        assert_eq!(flash.bus().sent[1][4..], [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn read_exposes_data() {
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.read(0x0003_0000, 8).unwrap();
        assert!(flash.status().contains(FlashStatus::READING));
        run(&mut flash);
        assert_eq!(flash.bus().sent.len(), 1);
        assert_eq!(flash.bus().sent[0][..4], [CMD_READ, 0x03, 0x00, 0x00]);
        assert_eq!(flash.read_data(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn second_request_while_busy_is_refused() {
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.erase(0, SECTOR_SIZE).unwrap();
        assert_eq!(flash.read(0, 4), Err(FlashError::Busy));
        assert_eq!(flash.write(0, &[0]), Err(FlashError::Busy));
        assert_eq!(flash.payload_mut().err(), Some(FlashError::Busy));
        run(&mut flash);
        assert_eq!(flash.read(0, 4), Ok(()));
    }

    #[test]
    fn range_and_length_limits() {
        let mut flash = FlashController::new(ScriptedBus::default());
        assert_eq!(
            flash.erase(FLASH_ADDRESS_LIMIT - 4, 8),
            Err(FlashError::AddressOutOfRange(FLASH_ADDRESS_LIMIT - 4))
        );
        assert_eq!(flash.read(0, PAGE_SIZE + 1), Err(FlashError::LengthTooLong(PAGE_SIZE + 1)));
        assert_eq!(flash.write(0, &[0u8; PAGE_SIZE + 1]), Err(FlashError::LengthTooLong(PAGE_SIZE + 1)));
        assert!(!flash.is_busy());
    }

    #[test]
    fn failed_transfer_abandons_operation() {
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.erase(0, 4 * SECTOR_SIZE).unwrap();
        flash.process();
        flash.process();
        flash.bus_mut().fail_next = Some(SpiError::Aborted);
        flash.process();

        assert!(!flash.is_busy());
        assert_eq!(flash.error_count(), 1);
        assert_eq!(flash.status(), FlashStatus::READY | FlashStatus::ERROR);

        // No retry on its own.
        let sent = flash.bus().sent.len();
        flash.process();
        assert_eq!(flash.bus().sent.len(), sent);

        flash.reset_status();
        assert_eq!(flash.status(), FlashStatus::READY);
        flash.reset_error_count();
        assert_eq!(flash.error_count(), 0);
    }

    #[test]
    fn new_operation_clears_error_flag() {
        let mut flash = FlashController::new(ScriptedBus::default());
        flash.read(0, 4).unwrap();
        flash.process();
        flash.bus_mut().fail_next = Some(SpiError::Aborted);
        flash.process();
        assert!(flash.status().contains(FlashStatus::ERROR));

        flash.read(0, 4).unwrap();
        assert!(!flash.status().contains(FlashStatus::ERROR));
        assert_eq!(flash.error_count(), 1);
    }
}
