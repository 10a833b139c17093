//! Scripted in-memory SDO server used by the integration tests.
//!
//! The server answers synchronously: every frame the client sends is handled
//! immediately and the answers are queued for `recv_frame`. An empty queue
//! reads as a bus timeout.
#![allow(dead_code)]

use canopen_master::{CanOpenError, RawFrame, Transport};
use crc::{Crc, CRC_16_XMODEM};
use std::collections::{HashMap, VecDeque};
use std::mem;

pub const NODE_ID: u8 = 0x22;

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Misbehaviour to inject, all off by default.
#[derive(Default)]
pub struct Faults {
    /// Abort every initiate request with this code.
    pub abort_initiate: Option<u32>,
    /// Abort when the n-th segment (1-based) arrives, or instead of the first
    /// block of a block upload.
    pub abort_segment: Option<(usize, u32)>,
    /// Echo the wrong toggle bit in the n-th segment response.
    pub wrong_toggle_at: Option<usize>,
    /// Lose the block segment with this sequence number, once.
    pub drop_block_segment: Option<u8>,
    /// Lose `drop_block_segment` in every block, not just the first.
    pub drop_repeatedly: bool,
    /// Confirm one segment more than arrived in block download acks.
    pub ack_overshoot: bool,
    /// Send 127-segment upload blocks whatever the client asked for.
    pub ignore_client_block_size: bool,
    /// Announce one byte more than the object holds in uploads.
    pub overstate_size: bool,
    /// Block size handed to the client in block downloads (default 127).
    pub block_size: Option<u8>,
    pub no_crc: bool,
    pub corrupt_crc: bool,
    /// Put unrelated traffic on the bus ahead of every answer.
    pub noise: bool,
    pub silent: bool,
}

struct SegmentedDownload {
    key: (u16, u8),
    size: Option<usize>,
    buffer: Vec<u8>,
}

struct SegmentedUpload {
    data: Vec<u8>,
    offset: usize,
}

struct BlockDownload {
    key: (u16, u8),
    size: usize,
    buffer: Vec<u8>,
    crc: bool,
    block_size: u8,
    last_good: u8,
    done: bool,
}

struct BlockUpload {
    data: Vec<u8>,
    crc: bool,
    block_size: u8,
    block_start: usize,
    in_flight: u8,
    in_flight_last: bool,
}

enum State {
    Idle,
    Aborted,
    SegmentedDownload(SegmentedDownload),
    SegmentedUpload(SegmentedUpload),
    BlockDownload(BlockDownload),
    BlockUpload(BlockUpload),
}

pub struct MockServer {
    pub node_id: u8,
    pub objects: HashMap<(u16, u8), Vec<u8>>,
    /// Every frame the client sent, in order.
    pub received: Vec<RawFrame>,
    pub faults: Faults,
    replies: VecDeque<RawFrame>,
    state: State,
    segments: usize,
    dropped: bool,
}

fn sdo(command: u8, key: (u16, u8), data: [u8; 4]) -> [u8; 8] {
    let index = key.0.to_le_bytes();
    [command, index[0], index[1], key.1, data[0], data[1], data[2], data[3]]
}

fn last_segment_len(len: usize) -> usize {
    match len {
        0 => 0,
        len => (len - 1) % 7 + 1,
    }
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            node_id: NODE_ID,
            objects: HashMap::new(),
            received: Vec::new(),
            faults: Faults::default(),
            replies: VecDeque::new(),
            state: State::Idle,
            segments: 0,
            dropped: false,
        }
    }

    pub fn with_object(mut self, index: u16, subindex: u8, data: &[u8]) -> Self {
        self.objects.insert((index, subindex), data.to_vec());
        self
    }

    pub fn object(&self, index: u16, subindex: u8) -> Option<&[u8]> {
        self.objects.get(&(index, subindex)).map(Vec::as_slice)
    }

    pub fn last_received(&self) -> [u8; 8] {
        self.received.last().map(|frame| frame.data).unwrap_or_default()
    }

    fn dropping(&mut self, seqno: u8) -> bool {
        if self.faults.drop_block_segment != Some(seqno) || (self.dropped && !self.faults.drop_repeatedly) {
            return false;
        }
        self.dropped = true;
        true
    }

    fn announced_size(&self, data: &[u8]) -> [u8; 4] {
        let size = data.len() + usize::from(self.faults.overstate_size);
        (size as u32).to_le_bytes()
    }

    fn push(&mut self, id: u32, data: &[u8]) {
        self.replies.push_back(RawFrame::new(id, data).unwrap());
    }

    fn reply(&mut self, bytes: [u8; 8]) {
        if self.faults.noise {
            let node = u32::from(self.node_id);
            self.push(0x700 | node, &[0x05]);
            self.push(0x180 | node, &[1, 2, 3]);
            self.push(0x580 | (node + 1), &[0x80, 0, 0x10, 0, 0, 0, 0x02, 0x06]);
            self.push(0x8000_0000 | 0x0123_4567, &[0xFF; 8]);
        }
        self.push(0x580 | u32::from(self.node_id), &bytes);
    }

    fn send_abort(&mut self, key: (u16, u8), code: u32) -> State {
        self.reply(sdo(0x80, key, code.to_le_bytes()));
        State::Aborted
    }

    fn handle(&mut self, frame: &RawFrame) {
        self.received.push(*frame);
        if frame.id != 0x600 | u32::from(self.node_id) || self.faults.silent {
            return;
        }
        let d = frame.data;
        let cs = d[0] >> 5;
        self.state = match mem::replace(&mut self.state, State::Idle) {
            State::Aborted => State::Aborted,
            State::BlockDownload(transfer) => self.block_download(transfer, d),
            _ if cs == 4 => State::Idle,
            State::SegmentedDownload(transfer) if cs == 0 => self.download_segment(transfer, d),
            State::SegmentedUpload(transfer) if cs == 3 => self.upload_segment(transfer, d),
            State::BlockUpload(transfer) if cs == 5 => self.block_upload(transfer, d),
            _ => self.initiate(d),
        };
    }

    fn initiate(&mut self, d: [u8; 8]) -> State {
        let key = (u16::from_le_bytes([d[1], d[2]]), d[3]);
        let cs = d[0] >> 5;
        if !matches!(cs, 1 | 2 | 5 | 6) {
            return State::Idle;
        }
        if let Some(code) = self.faults.abort_initiate {
            return self.send_abort(key, code);
        }
        let indicated = u32::from_le_bytes([d[4], d[5], d[6], d[7]]) as usize;
        match cs {
            1 if d[0] & 0x02 != 0 => {
                let len = if d[0] & 0x01 != 0 {
                    4 - usize::from((d[0] >> 2) & 0x03)
                } else {
                    4
                };
                self.objects.insert(key, d[4..4 + len].to_vec());
                self.reply(sdo(0x60, key, [0; 4]));
                State::Idle
            }
            1 => {
                self.reply(sdo(0x60, key, [0; 4]));
                State::SegmentedDownload(SegmentedDownload {
                    key,
                    size: (d[0] & 0x01 != 0).then_some(indicated),
                    buffer: Vec::new(),
                })
            }
            2 => {
                let Some(data) = self.objects.get(&key).cloned() else {
                    return self.send_abort(key, 0x0602_0000);
                };
                if (1..=4).contains(&data.len()) {
                    let mut value = [0u8; 4];
                    value[..data.len()].copy_from_slice(&data);
                    let n = 4 - data.len() as u8;
                    self.reply(sdo(0x43 | (n << 2), key, value));
                    State::Idle
                } else {
                    self.reply(sdo(0x41, key, self.announced_size(&data)));
                    State::SegmentedUpload(SegmentedUpload { data, offset: 0 })
                }
            }
            5 => {
                let Some(data) = self.objects.get(&key).cloned() else {
                    return self.send_abort(key, 0x0602_0000);
                };
                let crc = d[0] & 0x04 != 0 && !self.faults.no_crc;
                let command = 0xC2 | (u8::from(crc) << 2);
                self.reply(sdo(command, key, self.announced_size(&data)));
                let block_size = if self.faults.ignore_client_block_size { 127 } else { d[4] };
                State::BlockUpload(BlockUpload {
                    data,
                    crc,
                    block_size,
                    block_start: 0,
                    in_flight: 0,
                    in_flight_last: false,
                })
            }
            _ => {
                let crc = d[0] & 0x04 != 0 && !self.faults.no_crc;
                let block_size = self.faults.block_size.unwrap_or(127);
                let command = 0xA0 | (u8::from(crc) << 2);
                self.reply(sdo(command, key, [block_size, 0, 0, 0]));
                State::BlockDownload(BlockDownload {
                    key,
                    size: indicated,
                    buffer: Vec::new(),
                    crc,
                    block_size,
                    last_good: 0,
                    done: false,
                })
            }
        }
    }

    fn segment_fault(&mut self, key: (u16, u8)) -> Option<State> {
        self.segments += 1;
        match self.faults.abort_segment {
            Some((at, code)) if at == self.segments => Some(self.send_abort(key, code)),
            _ => None,
        }
    }

    fn echoed_toggle(&self, toggle: bool) -> u8 {
        let wrong = self.faults.wrong_toggle_at == Some(self.segments);
        u8::from(toggle != wrong) << 4
    }

    fn download_segment(&mut self, mut transfer: SegmentedDownload, d: [u8; 8]) -> State {
        if let Some(aborted) = self.segment_fault(transfer.key) {
            return aborted;
        }
        let len = 7 - usize::from((d[0] >> 1) & 0x07);
        transfer.buffer.extend_from_slice(&d[1..1 + len]);
        let toggle = self.echoed_toggle(d[0] & 0x10 != 0);
        self.reply([0x20 | toggle, 0, 0, 0, 0, 0, 0, 0]);
        if d[0] & 0x01 == 0 {
            return State::SegmentedDownload(transfer);
        }
        if let Some(size) = transfer.size {
            assert_eq!(size, transfer.buffer.len(), "indicated size");
        }
        self.objects.insert(transfer.key, transfer.buffer);
        State::Idle
    }

    fn upload_segment(&mut self, mut transfer: SegmentedUpload, d: [u8; 8]) -> State {
        if let Some(aborted) = self.segment_fault((0, 0)) {
            return aborted;
        }
        let end = (transfer.offset + 7).min(transfer.data.len());
        let chunk = &transfer.data[transfer.offset..end];
        let last = end == transfer.data.len();
        let mut bytes = [0u8; 8];
        bytes[0] = self.echoed_toggle(d[0] & 0x10 != 0) | (((7 - chunk.len()) as u8) << 1) | u8::from(last);
        bytes[1..1 + chunk.len()].copy_from_slice(chunk);
        self.reply(bytes);
        transfer.offset = end;
        if last {
            State::Idle
        } else {
            State::SegmentedUpload(transfer)
        }
    }

    fn block_download(&mut self, mut transfer: BlockDownload, d: [u8; 8]) -> State {
        if transfer.done {
            if d[0] & 0xE3 != 0xC1 {
                return State::Idle;
            }
            let n = usize::from((d[0] >> 2) & 0x07);
            let total = transfer.buffer.len() - n;
            transfer.buffer.truncate(total);
            if total != transfer.size {
                return self.send_abort(transfer.key, 0x0800_0000);
            }
            let crc = u16::from_le_bytes([d[1], d[2]]);
            if transfer.crc && crc != XMODEM.checksum(&transfer.buffer) {
                return self.send_abort(transfer.key, 0x0504_0004);
            }
            self.objects.insert(transfer.key, transfer.buffer);
            self.reply([0xA1, 0, 0, 0, 0, 0, 0, 0]);
            return State::Idle;
        }

        let seqno = d[0] & 0x7F;
        let last = d[0] & 0x80 != 0;
        if seqno == 0 {
            // the client gave up
            return State::Idle;
        }
        if let Some(aborted) = self.segment_fault(transfer.key) {
            return aborted;
        }
        if !self.dropping(seqno) && seqno == transfer.last_good + 1 {
            transfer.buffer.extend_from_slice(&d[1..]);
            transfer.last_good = seqno;
            transfer.done = last;
        }
        if last || seqno == transfer.block_size {
            let ackseq = transfer.last_good + u8::from(self.faults.ack_overshoot);
            self.reply([0xA2, ackseq, transfer.block_size, 0, 0, 0, 0, 0]);
            transfer.last_good = 0;
        }
        State::BlockDownload(transfer)
    }

    fn block_upload(&mut self, mut transfer: BlockUpload, d: [u8; 8]) -> State {
        match d[0] & 0x03 {
            3 => {
                if let Some((_, code)) = self.faults.abort_segment {
                    return self.send_abort((0, 0), code);
                }
                self.send_block(&mut transfer);
                State::BlockUpload(transfer)
            }
            2 => {
                let ackseq = d[1];
                if !self.faults.ignore_client_block_size {
                    transfer.block_size = d[2];
                }
                if ackseq == transfer.in_flight && transfer.in_flight_last {
                    let n = 7 - last_segment_len(transfer.data.len()) as u8;
                    let mut crc = if transfer.crc {
                        XMODEM.checksum(&transfer.data)
                    } else {
                        0
                    };
                    if self.faults.corrupt_crc {
                        crc ^= 0xFFFF;
                    }
                    let crc = crc.to_le_bytes();
                    self.reply([0xC1 | (n << 2), crc[0], crc[1], 0, 0, 0, 0, 0]);
                } else {
                    transfer.block_start += usize::from(ackseq) * 7;
                    self.send_block(&mut transfer);
                }
                State::BlockUpload(transfer)
            }
            _ => State::Idle,
        }
    }

    fn send_block(&mut self, transfer: &mut BlockUpload) {
        let len = transfer.data.len();
        let mut offset = transfer.block_start;
        let mut seqno = 0;
        let mut last = false;
        while seqno < transfer.block_size && !last {
            seqno += 1;
            let end = (offset + 7).min(len);
            last = end == len;
            let mut bytes = [0u8; 8];
            bytes[0] = (u8::from(last) << 7) | seqno;
            bytes[1..1 + end - offset].copy_from_slice(&transfer.data[offset..end]);
            if !self.dropping(seqno) {
                self.reply(bytes);
            }
            offset = end;
        }
        transfer.in_flight = seqno;
        transfer.in_flight_last = last;
    }
}

impl Transport for MockServer {
    fn send_frame(&mut self, frame: &RawFrame) -> Result<(), CanOpenError> {
        self.handle(frame);
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<RawFrame, CanOpenError> {
        self.replies.pop_front().ok_or(CanOpenError::Timeout)
    }
}
