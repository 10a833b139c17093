//! Block transfers: up to 127 segments per confirmed block.
//!
//! The receiver acknowledges the last contiguous sequence number of each
//! block. Segments after a gap are sent again as the start of the next
//! block, which is numbered from 1.

use super::{Direction, SdoClient, SdoTransfer, TransferMode};
use crate::enums::AbortCode;
use crate::payload::{block_subcommand, ccs, scs, SdoCommand, SdoPayload, SdoPhase};
use crate::transport::Transport;
use crate::CanOpenError;
use crc::{Crc, CRC_16_XMODEM};
use log::{debug, trace, warn};

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

const SEGMENT_LEN: usize = 7;

pub fn block_crc(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

impl<T: Transport> SdoClient<T> {
    pub fn download_block(&mut self, index: u16, subindex: u8, data: &[u8]) -> Result<(), CanOpenError> {
        let size = u32::try_from(data.len()).map_err(|_| CanOpenError::InvalidSize(data.len()))?;
        let mut transfer = SdoTransfer::new(
            self.node_id,
            index,
            subindex,
            Direction::Download,
            TransferMode::Block,
        );
        debug!("{transfer}: initiating, {size} bytes");

        let command = SdoCommand::Block {
            cs: ccs::BLOCK_DOWNLOAD,
            crc: self.config.crc,
            size_indicated: true,
            subcommand: block_subcommand::INITIATE,
        };
        self.send_request(&SdoPayload::new(command.to_byte(), index, subindex, size.to_le_bytes()))?;
        let response = self.expect_response(&mut transfer)?;
        let server_crc = match response.command(SdoPhase::Block) {
            SdoCommand::Block {
                cs: scs::BLOCK_DOWNLOAD,
                crc,
                subcommand: block_subcommand::INITIATE,
                ..
            } => crc,
            _ => return Err(self.unexpected(&mut transfer, SdoPhase::Block, &response)),
        };
        self.check_object(&mut transfer, &response)?;
        let mut block_size = self.check_block_size(&mut transfer, response.data[0])?;
        let use_crc = self.config.crc && server_crc;

        let mut offset = 0;
        let mut retries = 0;
        loop {
            let block_start = offset;
            let mut finished = false;
            transfer.seqno = 0;
            for seqno in 1..=block_size {
                let end = (offset + SEGMENT_LEN).min(data.len());
                finished = end == data.len();
                let command = SdoCommand::BlockSegment {
                    last: finished,
                    seqno,
                };
                self.send_request(&SdoPayload::segment(command.to_byte(), &data[offset..end]))?;
                offset = end;
                transfer.seqno = seqno;
                if finished {
                    break;
                }
            }
            let sent = transfer.seqno;
            trace!("{transfer}: sent block of {sent} segments");

            let response = self.expect_response(&mut transfer)?;
            match response.command(SdoPhase::Block) {
                SdoCommand::Block {
                    cs: scs::BLOCK_DOWNLOAD,
                    subcommand: block_subcommand::ACK,
                    ..
                } => {}
                _ => return Err(self.unexpected(&mut transfer, SdoPhase::Block, &response)),
            }
            let ack = response.to_bytes();
            let (ackseq, next_block_size) = (ack[1], ack[2]);
            if ackseq > sent {
                let error = CanOpenError::SequenceGap {
                    expected: sent,
                    received: ackseq,
                };
                return Err(self.fail(&mut transfer, AbortCode::InvalidSequenceNumber, error));
            }
            if ackseq < sent {
                retries += 1;
                if retries > self.config.max_block_retries {
                    let error = CanOpenError::SequenceGap {
                        expected: sent,
                        received: ackseq,
                    };
                    return Err(self.fail(&mut transfer, AbortCode::InvalidSequenceNumber, error));
                }
                warn!("{transfer}: server confirmed {ackseq} of {sent} segments, resending the rest");
                offset = block_start + usize::from(ackseq) * SEGMENT_LEN;
                finished = false;
            } else {
                retries = 0;
            }
            transfer.buffer.extend_from_slice(&data[block_start..offset]);
            if finished {
                break;
            }
            block_size = self.check_block_size(&mut transfer, next_block_size)?;
        }

        let last_len = match data.len() {
            0 => 0,
            len => (len - 1) % SEGMENT_LEN + 1,
        };
        let crc = if use_crc { block_crc(data) } else { 0 };
        let command = SdoCommand::BlockEnd {
            cs: ccs::BLOCK_DOWNLOAD,
            n: (SEGMENT_LEN - last_len) as u8,
            subcommand: block_subcommand::END,
        };
        let crc = crc.to_le_bytes();
        self.send_request(&SdoPayload::segment(command.to_byte(), &crc))?;

        let response = self.expect_response(&mut transfer)?;
        match response.command(SdoPhase::Block) {
            SdoCommand::Block {
                cs: scs::BLOCK_DOWNLOAD,
                subcommand: block_subcommand::END,
                ..
            } => {}
            _ => return Err(self.unexpected(&mut transfer, SdoPhase::Block, &response)),
        }
        transfer.finish();
        Ok(())
    }

    pub fn upload_block(&mut self, index: u16, subindex: u8, max_size: usize) -> Result<Vec<u8>, CanOpenError> {
        let mut transfer = SdoTransfer::new(
            self.node_id,
            index,
            subindex,
            Direction::Upload,
            TransferMode::Block,
        );
        let block_size = self.config.block_size;
        debug!("{transfer}: initiating, block size {block_size}");

        let command = SdoCommand::Block {
            cs: ccs::BLOCK_UPLOAD,
            crc: self.config.crc,
            size_indicated: false,
            subcommand: block_subcommand::INITIATE,
        };
        // protocol switch threshold 0: never fall back to segmented
        self.send_request(&SdoPayload::new(command.to_byte(), index, subindex, [block_size, 0, 0, 0]))?;
        let response = self.expect_response(&mut transfer)?;
        let (server_crc, size_indicated) = match response.command(SdoPhase::Block) {
            SdoCommand::Block {
                cs: scs::BLOCK_UPLOAD,
                crc,
                size_indicated,
                subcommand,
            } if subcommand & 0x01 == block_subcommand::INITIATE => (crc, size_indicated),
            _ => return Err(self.unexpected(&mut transfer, SdoPhase::Block, &response)),
        };
        self.check_object(&mut transfer, &response)?;
        let size = size_indicated.then(|| u32::from_le_bytes(response.data) as usize);
        if let Some(size) = size {
            if size > max_size {
                let error = CanOpenError::BufferTooSmall {
                    size,
                    capacity: max_size,
                };
                return Err(self.fail(&mut transfer, AbortCode::OutOfMemory, error));
            }
        }
        let use_crc = self.config.crc && server_crc;

        let start = SdoCommand::Block {
            cs: ccs::BLOCK_UPLOAD,
            crc: false,
            size_indicated: false,
            subcommand: block_subcommand::START_UPLOAD,
        };
        self.send_request(&SdoPayload::segment(start.to_byte(), &[]))?;

        let mut retries = 0;
        loop {
            let mut received = 0;
            let mut seen = 0;
            let mut finished = false;
            let mut timed_out = false;
            loop {
                // a silent server is waiting for an ack: the rest of the block was lost
                let response = match self.recv_response() {
                    Ok(response) => response,
                    Err(CanOpenError::SdoTimeout) => {
                        timed_out = true;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                let SdoCommand::BlockSegment { last, seqno } = response.command(SdoPhase::BlockSegment) else {
                    return Err(self.unexpected(&mut transfer, SdoPhase::BlockSegment, &response));
                };
                if seqno == 0 {
                    // not a segment: an abort or a protocol error
                    super::check_abort(&mut transfer, &response)?;
                    return Err(self.unexpected(&mut transfer, SdoPhase::BlockSegment, &response));
                }
                if seqno > block_size {
                    let error = CanOpenError::SequenceGap {
                        expected: received + 1,
                        received: seqno,
                    };
                    return Err(self.fail(&mut transfer, AbortCode::InvalidSequenceNumber, error));
                }
                seen = seqno;
                if seqno == received + 1 {
                    transfer.buffer.extend_from_slice(&response.segment_data());
                    received = seqno;
                    finished = last;
                    if transfer.buffer.len() > max_size.saturating_add(SEGMENT_LEN - 1) {
                        let error = CanOpenError::BufferTooSmall {
                            size: transfer.buffer.len(),
                            capacity: max_size,
                        };
                        return Err(self.fail(&mut transfer, AbortCode::OutOfMemory, error));
                    }
                } else {
                    trace!("{transfer}: dropping segment {seqno}, expected {}", received + 1);
                }
                if last || seqno == block_size {
                    break;
                }
            }
            transfer.seqno = received;

            let ack = SdoCommand::Block {
                cs: ccs::BLOCK_UPLOAD,
                crc: false,
                size_indicated: false,
                subcommand: block_subcommand::ACK,
            };
            self.send_request(&SdoPayload::segment(ack.to_byte(), &[received, block_size]))?;
            trace!("{transfer}: acknowledged {received} segments");
            if finished {
                break;
            }
            if timed_out || received < seen {
                retries += 1;
                if retries > self.config.max_block_retries {
                    if timed_out {
                        let error = CanOpenError::SdoTimeout;
                        return Err(self.fail(&mut transfer, AbortCode::SdoProtocolTimedOut, error));
                    }
                    let error = CanOpenError::SequenceGap {
                        expected: received + 1,
                        received: seen,
                    };
                    return Err(self.fail(&mut transfer, AbortCode::InvalidSequenceNumber, error));
                }
                warn!("{transfer}: segment {} missing, asking for a resend", received + 1);
            } else {
                retries = 0;
            }
        }

        let response = self.expect_response(&mut transfer)?;
        let n = match response.command(SdoPhase::BlockEnd) {
            SdoCommand::BlockEnd {
                cs: scs::BLOCK_UPLOAD,
                n,
                subcommand,
            } if subcommand & 0x01 == block_subcommand::END => usize::from(n),
            _ => return Err(self.unexpected(&mut transfer, SdoPhase::BlockEnd, &response)),
        };
        let end = response.to_bytes();
        let server_crc = u16::from_le_bytes([end[1], end[2]]);

        let total = transfer.buffer.len().saturating_sub(n);
        if let Some(size) = size {
            if total != size {
                let error = CanOpenError::SizeMismatch {
                    expected: size,
                    actual: total,
                };
                return Err(self.fail(&mut transfer, AbortCode::GeneralError, error));
            }
        }
        transfer.buffer.truncate(total);
        if total > max_size {
            let error = CanOpenError::BufferTooSmall {
                size: total,
                capacity: max_size,
            };
            return Err(self.fail(&mut transfer, AbortCode::OutOfMemory, error));
        }
        if use_crc {
            let computed = block_crc(&transfer.buffer);
            if computed != server_crc {
                let error = CanOpenError::CrcMismatch {
                    received: server_crc,
                    computed,
                };
                return Err(self.fail(&mut transfer, AbortCode::CrcError, error));
            }
        }

        let end = SdoCommand::Block {
            cs: ccs::BLOCK_UPLOAD,
            crc: false,
            size_indicated: false,
            subcommand: block_subcommand::END,
        };
        self.send_request(&SdoPayload::segment(end.to_byte(), &[]))?;
        Ok(transfer.finish())
    }

    fn check_block_size(&mut self, transfer: &mut SdoTransfer, size: u8) -> Result<u8, CanOpenError> {
        if size == 0 || size > super::MAX_BLOCK_SIZE {
            return Err(self.fail(transfer, AbortCode::InvalidBlockSize, CanOpenError::InvalidBlockSize(size)));
        }
        Ok(size)
    }
}
