//! SDO client.
//!
//! An [`SdoClient`] talks to the SDO server of one node: requests go out on
//! 0x600 + node, responses are expected on 0x580 + node. Every transfer is a
//! blocking call that either completes or returns an error, after which the
//! server has been told to abort when the client detected the problem.

mod block;
mod expedited;
mod segmented;

pub use block::block_crc;

use crate::enums::AbortCode;
use crate::frame::{
    classify, function_code, CanopenFrame, CAN_EFF_FLAG, CAN_ERR_FLAG, CAN_RTR_FLAG, CAN_SFF_MASK,
};
use crate::payload::{ccs, scs, Payload, SdoCommand, SdoPayload, SdoPhase};
use crate::transport::Transport;
use crate::CanOpenError;
use log::{debug, trace, warn};
use std::fmt;
use std::mem;

pub const MAX_BLOCK_SIZE: u8 = 127;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdoConfig {
    /// Segments per block the client asks for in block uploads (1..=127).
    pub block_size: u8,
    /// Offer CRC support in block transfers.
    pub crc: bool,
    /// Unrelated frames skipped while waiting for one response before giving up.
    pub max_foreign_frames: usize,
    /// Consecutive incomplete blocks tolerated in a block transfer.
    pub max_block_retries: u8,
}

impl Default for SdoConfig {
    fn default() -> Self {
        Self {
            block_size: MAX_BLOCK_SIZE,
            crc: true,
            max_foreign_frames: 1000,
            max_block_retries: 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    Expedited,
    Segmented,
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Complete,
    Aborted,
}

/// State of the transfer in flight, owned by one engine call.
#[derive(Debug)]
pub(crate) struct SdoTransfer {
    node_id: u8,
    index: u16,
    subindex: u8,
    direction: Direction,
    mode: TransferMode,
    buffer: Vec<u8>,
    toggle: bool,
    seqno: u8,
    status: TransferStatus,
}

impl SdoTransfer {
    fn new(node_id: u8, index: u16, subindex: u8, direction: Direction, mode: TransferMode) -> Self {
        Self {
            node_id,
            index,
            subindex,
            direction,
            mode,
            buffer: Vec::new(),
            toggle: false,
            seqno: 0,
            status: TransferStatus::Pending,
        }
    }

    fn finish(&mut self) -> Vec<u8> {
        self.status = TransferStatus::Complete;
        debug!("{self}: complete, {} bytes", self.buffer.len());
        mem::take(&mut self.buffer)
    }

    fn discard(&mut self) {
        self.status = TransferStatus::Aborted;
        self.buffer.clear();
    }
}

impl fmt::Display for SdoTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {:#04x} {:?} {:?} {:#06x}:{:#04x}",
            self.node_id, self.mode, self.direction, self.index, self.subindex
        )
    }
}

/// Outcome of an initiate upload exchange.
enum UploadInitiate {
    Expedited(Vec<u8>),
    Segmented(Option<u32>),
}

pub struct SdoClient<T> {
    transport: T,
    node_id: u8,
    config: SdoConfig,
}

impl<T: Transport> SdoClient<T> {
    pub fn new(transport: T, node_id: u8) -> Result<Self, CanOpenError> {
        Self::with_config(transport, node_id, SdoConfig::default())
    }

    pub fn with_config(transport: T, node_id: u8, config: SdoConfig) -> Result<Self, CanOpenError> {
        if node_id == 0 || node_id > 0x7F {
            return Err(CanOpenError::InvalidNodeId(node_id));
        }
        if config.block_size == 0 || config.block_size > MAX_BLOCK_SIZE {
            return Err(CanOpenError::InvalidBlockSize(config.block_size));
        }
        Ok(Self {
            transport,
            node_id,
            config,
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn config(&self) -> &SdoConfig {
        &self.config
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Writes `data`, expedited when it fits in four bytes and segmented
    /// otherwise.
    pub fn download(&mut self, index: u16, subindex: u8, data: &[u8]) -> Result<(), CanOpenError> {
        match data.len() {
            len @ 1..=4 => {
                let mut value = [0u8; 4];
                value[..len].copy_from_slice(data);
                self.download_expedited(index, subindex, u32::from_le_bytes(value), len as u8)
            }
            _ => self.download_segmented(index, subindex, data),
        }
    }

    /// Tells the server to abort whatever it is doing with the object.
    pub fn abort(&mut self, index: u16, subindex: u8, code: AbortCode) -> Result<(), CanOpenError> {
        warn!(
            "node {:#04x}: aborting {index:#06x}:{subindex:#04x} with {:#010x}",
            self.node_id,
            code.encode()
        );
        self.send_request(&SdoPayload::abort(index, subindex, code.encode()))
    }

    fn send_request(&mut self, sdo: &SdoPayload) -> Result<(), CanOpenError> {
        self.transport.send(&CanopenFrame::sdo_request(self.node_id, sdo))
    }

    /// Waits for the next frame from this node's SDO server.
    ///
    /// Anything else on the bus is skipped, up to `max_foreign_frames`.
    /// A malformed frame is only an error when it carries the response
    /// identifier.
    fn recv_response(&mut self) -> Result<SdoPayload, CanOpenError> {
        let response_id = (u32::from(function_code::SDO_TX) << 7) | u32::from(self.node_id);
        let mut skipped = 0;
        loop {
            let raw = match self.transport.recv_frame() {
                Ok(raw) => raw,
                Err(CanOpenError::Timeout) => return Err(CanOpenError::SdoTimeout),
                Err(e) => return Err(e),
            };
            let flags = CAN_EFF_FLAG | CAN_RTR_FLAG | CAN_ERR_FLAG;
            if raw.id & (flags | CAN_SFF_MASK) == response_id {
                if let Payload::Sdo(sdo) = classify(&raw)?.payload()? {
                    trace!("node {:#04x}: response {:02X?}", self.node_id, sdo.to_bytes());
                    return Ok(sdo);
                }
            } else if let Err(e) = classify(&raw) {
                warn!("discarding frame {:#010x}: {e}", raw.id);
            }
            skipped += 1;
            if skipped > self.config.max_foreign_frames {
                warn!(
                    "node {:#04x}: no response among {skipped} frames",
                    self.node_id
                );
                return Err(CanOpenError::SdoTimeout);
            }
        }
    }

    /// Next response, with server aborts turned into [`CanOpenError::SdoAborted`].
    fn expect_response(&mut self, transfer: &mut SdoTransfer) -> Result<SdoPayload, CanOpenError> {
        let response = self.recv_response()?;
        check_abort(transfer, &response)?;
        Ok(response)
    }

    /// Aborts `transfer` on the server and hands `error` back to the caller.
    fn fail(&mut self, transfer: &mut SdoTransfer, code: AbortCode, error: CanOpenError) -> CanOpenError {
        transfer.discard();
        warn!("{transfer}: {error}, sending abort {:#010x}", code.encode());
        let abort = SdoPayload::abort(transfer.index, transfer.subindex, code.encode());
        if let Err(e) = self.send_request(&abort) {
            warn!("{transfer}: abort not sent: {e}");
        }
        error
    }

    fn unexpected(&mut self, transfer: &mut SdoTransfer, phase: SdoPhase, response: &SdoPayload) -> CanOpenError {
        let error = CanOpenError::UnexpectedCommand {
            phase,
            command: response.command,
        };
        self.fail(transfer, AbortCode::InvalidClientServerCommandSpecifier, error)
    }

    fn check_object(&mut self, transfer: &mut SdoTransfer, response: &SdoPayload) -> Result<(), CanOpenError> {
        if response.index != transfer.index || response.subindex != transfer.subindex {
            let error = CanOpenError::ObjectMismatch {
                index: response.index,
                subindex: response.subindex,
            };
            return Err(self.fail(transfer, AbortCode::GeneralError, error));
        }
        Ok(())
    }

    /// Initiate upload request shared by the expedited and segmented paths.
    fn initiate_upload(&mut self, transfer: &mut SdoTransfer) -> Result<UploadInitiate, CanOpenError> {
        debug!("{transfer}: initiating");
        let request = SdoCommand::Generic {
            cs: ccs::INITIATE_UPLOAD,
        };
        self.send_request(&SdoPayload::new(
            request.to_byte(),
            transfer.index,
            transfer.subindex,
            [0; 4],
        ))?;

        let response = self.expect_response(transfer)?;
        match response.command(SdoPhase::Initiate) {
            SdoCommand::Initiate {
                cs: scs::INITIATE_UPLOAD,
                n,
                expedited,
                size_indicated,
            } => {
                self.check_object(transfer, &response)?;
                if expedited {
                    let len = if size_indicated { 4 - usize::from(n) } else { 4 };
                    Ok(UploadInitiate::Expedited(response.data[..len].to_vec()))
                } else {
                    let size = size_indicated.then(|| u32::from_le_bytes(response.data));
                    Ok(UploadInitiate::Segmented(size))
                }
            }
            _ => Err(self.unexpected(transfer, SdoPhase::Initiate, &response)),
        }
    }
}

fn check_abort(transfer: &mut SdoTransfer, response: &SdoPayload) -> Result<(), CanOpenError> {
    if let SdoCommand::Generic { cs: scs::ABORT } = response.command(SdoPhase::Generic) {
        let code = response.abort_code();
        transfer.discard();
        warn!(
            "{transfer}: aborted by server with {code:#010x} ({})",
            AbortCode::describe(code)
        );
        return Err(CanOpenError::SdoAborted(code));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use std::collections::VecDeque;

    /// Replays canned frames and records what the client sends.
    #[derive(Default)]
    struct Replay {
        incoming: VecDeque<RawFrame>,
        sent: Vec<RawFrame>,
    }

    impl Transport for Replay {
        fn send_frame(&mut self, frame: &RawFrame) -> Result<(), CanOpenError> {
            self.sent.push(*frame);
            Ok(())
        }

        fn recv_frame(&mut self) -> Result<RawFrame, CanOpenError> {
            self.incoming.pop_front().ok_or(CanOpenError::Timeout)
        }
    }

    fn replay(frames: &[(u32, &[u8])]) -> Replay {
        Replay {
            incoming: frames
                .iter()
                .map(|(id, data)| RawFrame::new(*id, data).unwrap())
                .collect(),
            sent: Vec::new(),
        }
    }

    #[test]
    fn rejects_invalid_node_and_block_size() {
        assert!(matches!(
            SdoClient::new(Replay::default(), 0),
            Err(CanOpenError::InvalidNodeId(0))
        ));
        assert!(matches!(
            SdoClient::new(Replay::default(), 128),
            Err(CanOpenError::InvalidNodeId(128))
        ));
        let config = SdoConfig {
            block_size: 0,
            ..SdoConfig::default()
        };
        assert!(matches!(
            SdoClient::with_config(Replay::default(), 5, config),
            Err(CanOpenError::InvalidBlockSize(0))
        ));
    }

    #[test]
    fn skips_foreign_frames_but_not_malformed_responses() {
        let transport = replay(&[
            (0x705, &[0x05]),
            (0x0D05, &[]),
            (0x585, &[0x43, 0x00, 0x10, 0x00, 0x91, 0x01, 0x0F, 0x00]),
        ]);
        let mut client = SdoClient::new(transport, 5).unwrap();
        assert_eq!(client.upload_expedited(0x1000, 0).unwrap(), 0x000F_0191);

        let transport = replay(&[(0x585, &[])]);
        let mut client = SdoClient::new(transport, 5).unwrap();
        assert!(matches!(
            client.upload_expedited(0x1000, 0),
            Err(CanOpenError::MalformedFrame(_))
        ));
    }

    #[test]
    fn error_frames_with_response_bits_are_skipped() {
        let transport = replay(&[
            (CAN_ERR_FLAG | 0x585, &[0; 8]),
            (0x585, &[0x4F, 0x01, 0x10, 0x00, 0x00, 0, 0, 0]),
        ]);
        let mut client = SdoClient::new(transport, 5).unwrap();
        assert_eq!(client.upload_expedited(0x1001, 0).unwrap(), 0);
    }

    #[test]
    fn foreign_frame_limit_ends_the_wait() {
        let mut transport = replay(&[]);
        for _ in 0..4 {
            transport.incoming.push_back(RawFrame::new(0x186, &[1, 2]).unwrap());
        }
        let config = SdoConfig {
            max_foreign_frames: 3,
            ..SdoConfig::default()
        };
        let mut client = SdoClient::with_config(transport, 5, config).unwrap();
        assert!(matches!(
            client.upload_expedited(0x1000, 0),
            Err(CanOpenError::SdoTimeout)
        ));
        assert_eq!(client.transport_mut().incoming.len(), 0);
    }

    #[test]
    fn mismatched_object_is_aborted() {
        let transport = replay(&[(0x585, &[0x60, 0x01, 0x20, 0x00, 0, 0, 0, 0])]);
        let mut client = SdoClient::new(transport, 5).unwrap();
        assert!(matches!(
            client.download_expedited(0x2000, 0, 1, 1),
            Err(CanOpenError::ObjectMismatch {
                index: 0x2001,
                subindex: 0
            })
        ));
        let sent = &client.transport_mut().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].id, 0x605);
        assert_eq!(sent[1].data, [0x80, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn unexpected_command_is_aborted() {
        let transport = replay(&[(0x585, &[0x20, 0x00, 0x20, 0x00, 0, 0, 0, 0])]);
        let mut client = SdoClient::new(transport, 5).unwrap();
        assert!(matches!(
            client.download_expedited(0x2000, 0, 1, 1),
            Err(CanOpenError::UnexpectedCommand {
                phase: SdoPhase::Generic,
                command: 0x20
            })
        ));
        let abort = client.transport_mut().sent[1];
        assert_eq!(&abort.data[4..], &0x0504_0001u32.to_le_bytes());
    }

    #[test]
    fn client_abort_sends_one_frame() {
        let mut client = SdoClient::new(Replay::default(), 0x7F).unwrap();
        client
            .abort(0x1018, 1, AbortCode::SdoProtocolTimedOut)
            .unwrap();
        let sent = &client.transport_mut().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x67F);
        assert_eq!(sent[0].data, [0x80, 0x18, 0x10, 0x01, 0x00, 0x00, 0x04, 0x05]);
    }
}
