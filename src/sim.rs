//! Scripted device used by unit tests. Decodes the host's frames through the
//! real codec and answers the way the firmware does.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use crate::config::LinkConfig;
use crate::frame::{self, Frame, FrameHeader, HEADER_LEN, RSP_FLAG};
use crate::proto::command::Command;
use crate::proto::message::{DME_STATUS_DONE, RESET_END_MODE};
use crate::proto::status;
use crate::result::{self, NodeDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Command(Command, u32, u32),
    Bulk(Command, usize),
    Dropped(Command),
}

struct Pending {
    frame: Frame,
    command: Command,
}

struct Session {
    polls_left: u32,
    tag: u8,
}

pub struct SimDevice {
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    pending: Option<Pending>,
    pub log: Vec<Event>,
    pub bulk_writes: Vec<usize>,
    pub saw_crc: bool,

    drop: HashMap<Command, u32>,
    fail: HashMap<Command, VecDeque<u32>>,
    pub corrupt_next_reply: bool,
    pub wrong_code_next_reply: bool,

    // streaming
    pub capacity: u32,
    pub remaining_skew: i32,
    queue: VecDeque<u32>,

    // sessions
    pub polls_before_ready: u32,
    pub model_size_skew: u32,
    next_session: u16,
    sessions: BTreeMap<u16, Session>,
    last_ready: Option<u16>,
    pub status_reads: u32,
}

impl SimDevice {
    pub const FIRMWARE_ID: u32 = 0x0001_0203;
    pub const MODEL_ID: u32 = 1000;

    pub fn new() -> Self {
        Self {
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            pending: None,
            log: Vec::new(),
            bulk_writes: Vec::new(),
            saw_crc: false,
            drop: HashMap::new(),
            fail: HashMap::new(),
            corrupt_next_reply: false,
            wrong_code_next_reply: false,
            capacity: 3,
            remaining_skew: 0,
            queue: VecDeque::new(),
            polls_before_ready: 0,
            model_size_skew: 0,
            next_session: 1,
            sessions: BTreeMap::new(),
            last_ready: None,
            status_reads: 0,
        }
    }

    pub fn test_config() -> LinkConfig {
        LinkConfig {
            response_timeout: Some(Duration::from_millis(20)),
            ..LinkConfig::default()
        }
    }

    /// Ignore the next `n` frames of `command` without replying.
    pub fn drop_next(&mut self, command: Command, n: u32) {
        self.drop.insert(command, n);
    }

    /// Answer the next frame of `command` with `code`.
    pub fn fail_next(&mut self, command: Command, code: u32) {
        self.fail.entry(command).or_default().push_back(code);
    }

    pub fn dropped(&self, command: Command) -> usize {
        self.log
            .iter()
            .filter(|e| **e == Event::Dropped(command))
            .count()
    }

    pub fn pending_output(&self) -> usize {
        self.outbox.len()
    }

    pub fn commands(&self, command: Command) -> Vec<(u32, u32)> {
        self.log
            .iter()
            .filter_map(|e| match e {
                Event::Command(c, p1, p2) if *c == command => Some((*p1, *p2)),
                _ => None,
            })
            .collect()
    }

    /// Raw result the device produces for an input tagged `tag`: two nodes,
    /// the first filled with the tag.
    pub fn result_for(tag: u8) -> Vec<u8> {
        let a = NodeDescriptor::shaped(0, 2, 3, 5, 0, 1.0);
        let b = NodeDescriptor::shaped(1, 1, 1, 20, 2, 0.5);
        let data_a = vec![tag; a.byte_len().unwrap_or(0)];
        let data_b = vec![4u8; b.byte_len().unwrap_or(0)];
        result::encode(&[(a, &data_a[..]), (b, &data_b[..])])
    }

    fn process(&mut self) {
        loop {
            if let Some(p) = &self.pending {
                let need = p.frame.param1 as usize;
                if self.inbox.len() < need {
                    return;
                }
                let bulk: Vec<u8> = self.inbox.drain(..need).collect();
                let Some(p) = self.pending.take() else { return };
                self.log.push(Event::Bulk(p.command, bulk.len()));
                self.finish_bulk(p.command, &p.frame, &bulk);
                continue;
            }
            if self.inbox.len() < HEADER_LEN {
                return;
            }
            let header = FrameHeader::parse(&self.inbox).expect("host header");
            if self.inbox.len() < header.frame_len() {
                return;
            }
            let bytes: Vec<u8> = self.inbox.drain(..header.frame_len()).collect();
            let frame = frame::decode(&bytes).expect("host frame");
            self.handle(frame);
        }
    }

    fn handle(&mut self, frame: Frame) {
        let command = frame.command_kind().expect("known command");
        self.saw_crc |= frame.crc;
        self.log
            .push(Event::Command(command, frame.param1, frame.param2));

        if let Some(n) = self.drop.get_mut(&command)
            && *n > 0
        {
            *n -= 1;
            self.log.push(Event::Dropped(command));
            return;
        }
        if let Some(code) = self.fail.get_mut(&command).and_then(VecDeque::pop_front) {
            if takes_bulk(command) {
                self.send(&frame, Command::AckNack.code(), code, 0, vec![]);
            } else {
                self.reply(&frame, command, code, 0, vec![]);
            }
            return;
        }

        if takes_bulk(command) {
            self.send(&frame, Command::AckNack.code(), 0, 0, vec![]);
            self.pending = Some(Pending { frame, command });
            return;
        }

        match command {
            Command::IsiStart => {
                self.queue.clear();
                self.reply(&frame, command, 0, self.capacity, vec![]);
            }
            Command::IsiConfig => self.reply(&frame, command, 0, 0, vec![]),
            Command::IsiGetResults => {
                let id = frame.param1;
                match self.queue.iter().position(|&q| q == id) {
                    Some(pos) => {
                        self.queue.remove(pos);
                        let raw = Self::result_for(id as u8);
                        self.reply(&frame, command, 0, raw.len() as u32, vec![]);
                        self.outbox.extend(raw);
                    }
                    None => self.reply(&frame, command, status::KAPP_ERR, 0, vec![]),
                }
            }
            Command::DmeConfig => self.reply(&frame, command, 0, Self::MODEL_ID, vec![]),
            Command::DmeGetStatus => {
                self.status_reads += 1;
                let sid = frame.param1 as u16;
                let Some(session) = self.sessions.get_mut(&sid) else {
                    self.reply(&frame, command, status::BAD_SESSION, 0, vec![]);
                    return;
                };
                if session.polls_left > 0 {
                    session.polls_left -= 1;
                    // Pending replies carry no size word.
                    self.reply(&frame, command, 0, sid as u32, vec![]);
                } else {
                    self.last_ready = Some(sid);
                    let len = Self::result_for(session.tag).len() as u32;
                    let p2 = sid as u32 | (DME_STATUS_DONE as u32) << 16;
                    self.reply(&frame, command, 0, p2, len.to_le_bytes().to_vec());
                }
            }
            Command::AckNack => {
                let len = u32::from_le_bytes(frame.data[..4].try_into().expect("pull len")) as usize;
                let tag = self
                    .last_ready
                    .take()
                    .and_then(|sid| self.sessions.remove(&sid))
                    .map_or(0, |s| s.tag);
                let mut raw = Self::result_for(tag);
                raw.resize(len, 0);
                self.outbox.extend(raw);
            }
            Command::Reset => {
                if frame.param1 == RESET_END_MODE {
                    self.queue.clear();
                    self.sessions.clear();
                }
                self.reply(&frame, command, 0, 0, vec![]);
            }
            Command::SystemStatus => {
                self.reply(&frame, command, Self::FIRMWARE_ID, 42, vec![1, 0, 2, 0])
            }
            Command::GetKnNum => self.reply(&frame, command, 0x520, 0, vec![]),
            _ => self.reply(&frame, command, status::OTHER, 0, vec![]),
        }
    }

    fn finish_bulk(&mut self, command: Command, frame: &Frame, bulk: &[u8]) {
        match command {
            Command::IsiSendImage => {
                self.queue.push_back(frame.param2);
                let remaining =
                    self.capacity as i32 - self.queue.len() as i32 + self.remaining_skew;
                self.reply(frame, command, 0, remaining as u32, vec![]);
            }
            Command::DmeStart => {
                let echoed = bulk.len() as u32 + self.model_size_skew;
                self.reply(frame, command, 0, echoed, vec![]);
            }
            Command::DmeSendImage => {
                let sid = self.next_session;
                self.next_session = self.next_session.wrapping_add(1);
                self.sessions.insert(
                    sid,
                    Session {
                        polls_left: self.polls_before_ready,
                        tag: bulk.first().copied().unwrap_or(0),
                    },
                );
                self.reply(frame, command, 0, sid as u32, vec![]);
            }
            _ => unreachable!("no bulk handler for {command}"),
        }
    }

    fn reply(&mut self, req: &Frame, command: Command, p1: u32, p2: u32, data: Vec<u8>) {
        let mut code = command.code() | RSP_FLAG;
        if self.wrong_code_next_reply {
            self.wrong_code_next_reply = false;
            code += 1;
        }
        self.send(req, code, p1, p2, data);
    }

    fn send(&mut self, req: &Frame, code: u16, p1: u32, p2: u32, data: Vec<u8>) {
        let mut bytes = Frame::response(code, p1, p2, data)
            .with_crc(req.crc)
            .encode()
            .expect("reply fits");
        if self.corrupt_next_reply {
            self.corrupt_next_reply = false;
            bytes[0] ^= 0xFF;
        }
        self.outbox.extend(bytes);
    }
}

fn takes_bulk(command: Command) -> bool {
    matches!(
        command,
        Command::IsiSendImage | Command::DmeStart | Command::DmeSendImage
    )
}

impl Read for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbox.is_empty() {
            return Err(ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(self.outbox.len());
        for (dst, src) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for SimDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pending.is_some() {
            self.bulk_writes.push(buf.len());
        }
        self.inbox.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
