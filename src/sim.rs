//! Simulated card answering on the bus byte by byte, for tests.

use crate::{
    consts::{commands, tokens, BLOCK_SIZE},
    crc::{crc16, CRC7},
    csd::tests::{csd_v1, csd_v2},
    CidData, Clock, CsdData, Prescaler, SdCard, SpiClock,
};

use core::{
    cell::{Cell, RefCell},
    convert::Infallible,
};
use embedded_hal::blocking::spi::Transfer;
use std::{
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    vec::Vec,
};
use switch_hal::OutputSwitch;

pub(crate) const SIM_CID: CidData = [
    0x1B, b'S', b'M', b'E', b'B', b'1', b'Q', b'T', 0x30, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x67, 0x01,
];

/// Bus clock the simulated session is created with.
pub(crate) const SIM_BUS_CLOCK_HZ: u32 = 36_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SentCommand {
    pub index: u8,
    pub arg: u32,
    pub app: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Version {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Command,
    WriteSingle { block: u32 },
    WriteMultiple { block: u32 },
    Receive { block: u32, multiple: bool },
}

pub(crate) struct CardModel {
    pub version: Version,
    pub high_capacity: bool,
    /// ACMD41 polls answered with the idle state before the card is ready.
    pub idle_polls: usize,
    pub cid: CidData,
    pub csd: CsdData,
    /// Pattern echoed by SEND_IF_COND instead of the requested one.
    pub echo_pattern: Option<u8>,
    /// Card never drives the line.
    pub mute: bool,
    pub corrupt_read_crc: bool,
    pub data_error_token: Option<u8>,
    /// Block index inside a write and the data response code it gets.
    pub reject_block: Option<(usize, u8)>,
    pub busy_forever: bool,
    /// Written blocks get no data response token.
    pub silent_data_response: bool,
    /// Line stays low after STOP_TRANSMISSION.
    pub hold_after_stop: bool,
    pub r2: u8,
    pub fail_transfers: bool,

    pub selected: bool,
    pub commands: Vec<SentCommand>,
    pub prescalers: Vec<Prescaler>,
    pub cs_changes: Vec<bool>,
    pub blocks: BTreeMap<u32, Vec<u8>>,
    pub stop_tokens: usize,

    ready: bool,
    app_cmd: bool,
    acmd41_polls: usize,
    stuck: bool,
    frame: Vec<u8>,
    rx: Vec<u8>,
    out: VecDeque<u8>,
    phase: Phase,
    read_next: Option<u32>,
    write_index: usize,
    written: u32,
}

impl CardModel {
    fn new(version: Version, high_capacity: bool, csd: CsdData) -> Self {
        CardModel {
            version,
            high_capacity,
            idle_polls: 2,
            cid: SIM_CID,
            csd,
            echo_pattern: None,
            mute: false,
            corrupt_read_crc: false,
            data_error_token: None,
            reject_block: None,
            busy_forever: false,
            silent_data_response: false,
            hold_after_stop: false,
            r2: 0x00,
            fail_transfers: false,
            selected: false,
            commands: Vec::new(),
            prescalers: Vec::new(),
            cs_changes: Vec::new(),
            blocks: BTreeMap::new(),
            stop_tokens: 0,
            ready: false,
            app_cmd: false,
            acmd41_polls: 0,
            stuck: false,
            frame: Vec::new(),
            rx: Vec::new(),
            out: VecDeque::new(),
            phase: Phase::Command,
            read_next: None,
            write_index: 0,
            written: 0,
        }
    }

    /// 128 MiB high capacity card.
    pub fn sdhc() -> Self {
        CardModel::new(Version::V2, true, csd_v2(0x00FF))
    }

    /// Extended capacity card, just above 32 GiB.
    pub fn sdxc() -> Self {
        CardModel::new(Version::V2, true, csd_v2(0x01_0000))
    }

    /// Version 1 standard capacity card of about 1 GB.
    pub fn sdsc_v1() -> Self {
        let mut model = CardModel::new(Version::V1, false, csd_v1(0x0F22, 7));
        model.idle_polls = 1;
        model
    }

    pub fn command_indices(&self) -> Vec<u8> {
        self.commands.iter().map(|command| command.index).collect()
    }

    /// Commands sent after the last one with `index`.
    pub fn commands_after(&self, index: u8) -> Vec<SentCommand> {
        match self.commands.iter().rposition(|command| command.index == index) {
            Some(position) => self.commands[position + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Contents of a block: what was written, or a pattern derived from its index.
    pub fn block(&self, index: u32) -> Vec<u8> {
        match self.blocks.get(&index) {
            Some(data) => data.clone(),
            None => (0..BLOCK_SIZE)
                .map(|i| (index as u8).wrapping_add(i as u8))
                .collect(),
        }
    }

    fn idle_bit(&self) -> u8 {
        if self.ready {
            0x00
        } else {
            0x01
        }
    }

    fn block_index(&self, arg: u32) -> Option<u32> {
        if self.high_capacity {
            Some(arg)
        } else if arg % BLOCK_SIZE as u32 == 0 {
            Some(arg / BLOCK_SIZE as u32)
        } else {
            None
        }
    }

    fn push_payload(&mut self, payload: &[u8], corrupt: bool) {
        let crc = crc16(payload) ^ u16::from(corrupt);

        self.out.push_back(tokens::AVAILABLE);
        self.out.push_back(tokens::DATA_START_BLOCK);
        self.out.extend(payload.iter().copied());
        self.out.extend(crc.to_be_bytes());
    }

    fn push_block(&mut self, index: u32) {
        match self.data_error_token {
            Some(token) => self.out.extend([tokens::AVAILABLE, token]),
            None => {
                let data = self.block(index);
                let corrupt = self.corrupt_read_crc;
                self.push_payload(&data, corrupt);
            }
        }
    }

    fn pop(&mut self) -> u8 {
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }

        if let Some(index) = self.read_next {
            self.read_next = Some(index + 1);
            self.push_block(index);
            return self.out.pop_front().unwrap_or(tokens::AVAILABLE);
        }

        if self.stuck {
            0x00
        } else {
            tokens::AVAILABLE
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected || self.mute {
            return tokens::AVAILABLE;
        }

        if let Phase::Receive { block, multiple } = self.phase {
            self.rx.push(mosi);
            if self.rx.len() == BLOCK_SIZE + 2 {
                self.finish_block(block, multiple);
            }
            return tokens::AVAILABLE;
        }

        if !self.frame.is_empty() {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                self.command();
            }
            return tokens::AVAILABLE;
        }

        match (mosi, self.phase) {
            (tokens::AVAILABLE, _) => return self.pop(),
            (0x40..=0x7F, _) => self.frame.push(mosi),
            (tokens::DATA_START_BLOCK, Phase::WriteSingle { block }) => {
                self.phase = Phase::Receive {
                    block,
                    multiple: false,
                };
            }
            (tokens::WRITE_MULTIPLE, Phase::WriteMultiple { block }) => {
                self.phase = Phase::Receive {
                    block,
                    multiple: true,
                };
            }
            (tokens::STOP_TRAN, Phase::WriteMultiple { .. }) => {
                self.phase = Phase::Command;
                self.stop_tokens += 1;
                self.out.extend([0x00, 0x00]);
            }
            _ => {}
        }

        tokens::AVAILABLE
    }

    fn finish_block(&mut self, block: u32, multiple: bool) {
        let received = core::mem::take(&mut self.rx);
        let (data, crc) = received.split_at(BLOCK_SIZE);
        let crc_ok = crc16(data).to_be_bytes()[..] == crc[..];

        let index = self.write_index;
        self.write_index += 1;

        if self.silent_data_response {
            self.out.clear();
            self.phase = Phase::Command;
            return;
        }

        let response = match self.reject_block {
            Some((at, code)) if at == index => code,
            _ if !crc_ok => tokens::DATA_RES_CRC_ERROR,
            _ => tokens::DATA_RES_ACCEPTED,
        };

        self.out.clear();
        self.out.push_back(0xE0 | response);

        if response == tokens::DATA_RES_ACCEPTED {
            self.blocks.insert(block, data.to_vec());
            self.written += 1;
            self.out.extend([0x00, 0x00]);
            self.stuck = self.busy_forever;
            self.phase = if multiple {
                Phase::WriteMultiple { block: block + 1 }
            } else {
                Phase::Command
            };
        } else {
            self.phase = Phase::Command;
        }
    }

    fn command(&mut self) {
        let frame = core::mem::take(&mut self.frame);
        let index = frame[0] & commands::CMD_INDEX_MASK;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = core::mem::replace(&mut self.app_cmd, false);

        self.commands.push(SentCommand { index, arg, app });
        self.out.clear();
        self.out.push_back(tokens::AVAILABLE);

        if frame[5] != (CRC7.compute(&frame[..5]) << 1) | 0x01 {
            self.out.push_back(0x08 | self.idle_bit());
            return;
        }

        let r1 = self.idle_bit();
        match (app, index) {
            (_, commands::CMD0) => {
                self.ready = false;
                self.stuck = false;
                self.acmd41_polls = 0;
                self.read_next = None;
                self.phase = Phase::Command;
                self.out.push_back(0x01);
            }
            (_, commands::CMD8) => match self.version {
                Version::V1 => self.out.push_back(0x05),
                Version::V2 => {
                    let pattern = self.echo_pattern.unwrap_or(arg as u8);
                    self.out
                        .extend([0x01, 0x00, 0x00, ((arg >> 8) & 0x0F) as u8, pattern]);
                }
            },
            (_, commands::CMD55) => {
                self.app_cmd = true;
                self.out.push_back(r1);
            }
            (true, commands::ACMD41) => {
                self.acmd41_polls += 1;
                if self.acmd41_polls > self.idle_polls {
                    self.ready = true;
                }
                self.out.push_back(self.idle_bit());
            }
            (true, commands::ACMD22) => {
                self.out.push_back(r1);
                let written = self.written.to_be_bytes();
                self.push_payload(&written, false);
            }
            (_, commands::CMD58) => {
                let ccs = if self.high_capacity { 0x40 } else { 0x00 };
                self.out.extend([r1, 0x80 | ccs, 0xFF, 0x80, 0x00]);
            }
            (_, commands::CMD10) => {
                self.out.push_back(r1);
                let cid = self.cid;
                self.push_payload(&cid, false);
            }
            (_, commands::CMD9) => {
                self.out.push_back(r1);
                let csd = self.csd;
                self.push_payload(&csd, false);
            }
            (_, commands::CMD12) => {
                self.read_next = None;
                self.phase = Phase::Command;
                self.stuck = self.hold_after_stop;
                self.out.extend([0x00, 0x00, 0x00]);
            }
            (_, commands::CMD13) => {
                self.out.extend([r1, self.r2]);
            }
            (_, commands::CMD16) => self.out.push_back(r1),
            (_, commands::CMD17 | commands::CMD18 | commands::CMD24 | commands::CMD25) => {
                let block = match self.block_index(arg) {
                    Some(block) => block,
                    None => {
                        self.out.push_back(0x20);
                        return;
                    }
                };

                self.out.push_back(r1);
                match index {
                    commands::CMD17 => self.push_block(block),
                    commands::CMD18 => self.read_next = Some(block),
                    commands::CMD24 => {
                        self.write_index = 0;
                        self.phase = Phase::WriteSingle { block };
                    }
                    _ => {
                        self.write_index = 0;
                        self.written = 0;
                        self.phase = Phase::WriteMultiple { block };
                    }
                }
            }
            _ => self.out.push_back(0x04 | r1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SimFault;

pub(crate) struct SimSpi(Rc<RefCell<CardModel>>);

impl Transfer<u8> for SimSpi {
    type Error = SimFault;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], SimFault> {
        let mut card = self.0.borrow_mut();
        if card.fail_transfers {
            return Err(SimFault);
        }

        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }

        Ok(words)
    }
}

impl SpiClock for SimSpi {
    fn set_prescaler(&mut self, prescaler: Prescaler) -> Result<(), SimFault> {
        self.0.borrow_mut().prescalers.push(prescaler);
        Ok(())
    }
}

pub(crate) struct SimCs(Rc<RefCell<CardModel>>);

impl SimCs {
    fn set(&mut self, selected: bool) {
        let mut card = self.0.borrow_mut();
        card.selected = selected;
        card.cs_changes.push(selected);
    }
}

impl OutputSwitch for SimCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Infallible> {
        self.set(true);
        Ok(())
    }

    fn off(&mut self) -> Result<(), Infallible> {
        self.set(false);
        Ok(())
    }
}

/// Advances one millisecond each time it is read.
#[derive(Default)]
pub(crate) struct SimClock(Cell<u32>);

impl Clock for SimClock {
    fn now(&self) -> u32 {
        let now = self.0.get().wrapping_add(1);
        self.0.set(now);
        now
    }

    fn ticks_per_ms(&self) -> u32 {
        1
    }
}

pub(crate) type SimCard = SdCard<SimSpi, SimCs, SimClock>;

/// Session over a simulated card, and the card itself.
pub(crate) fn card(model: CardModel) -> (SimCard, Rc<RefCell<CardModel>>) {
    let model = Rc::new(RefCell::new(model));
    let card = SdCard::new(
        SimSpi(model.clone()),
        SimCs(model.clone()),
        SimClock::default(),
        SIM_BUS_CLOCK_HZ,
    );

    (card, model)
}

/// Session over a simulated card, already initialized.
pub(crate) fn initialized(model: CardModel) -> (SimCard, Rc<RefCell<CardModel>>) {
    let (mut card, model) = card(model);
    card.init().expect("simulated card initializes");
    (card, model)
}
