//! CANopen master library.
//!
//! Raw CAN frames are classified into CANopen frames ([`frame`]), their
//! payloads are interpreted ([`payload`]) and the SDO client in [`sdo`]
//! drives expedited, segmented and block transfers against one remote node
//! over any [`Transport`].

pub mod enums;
pub mod frame;
pub mod payload;
pub mod sdo;
pub mod transport;

pub use frame::{classify, CanopenFrame, MessageKind, RawFrame, Rxtx};
pub use payload::{
    Emergency, NmtCommand, NmtFunction, NodeGuard, NodeState, Payload, SdoCommand, SdoPayload,
    SdoPhase,
};
pub use sdo::{SdoClient, SdoConfig};
pub use transport::{Conn, Transport};

use enums::AbortCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanOpenError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown function code: {0:#x}")]
    UnknownFunctionCode(u8),

    #[error("Toggle bit mismatch, expected toggle {expected}")]
    ToggleMismatch { expected: bool },

    #[error("Block sequence gap: expected segment {expected}, got {received}")]
    SequenceGap { expected: u8, received: u8 },

    #[error("{}", describe_abort(.0))]
    SdoAborted(u32),

    #[error("No SDO response within the timeout")]
    SdoTimeout,

    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Transport error: {0}")]
    TransportError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] binrw::Error),

    #[error("Unexpected command byte {command:#04x} in {phase:?} phase")]
    UnexpectedCommand { phase: SdoPhase, command: u8 },

    #[error("Response names object {index:#06x}:{subindex:#04x}, not the requested one")]
    ObjectMismatch { index: u16, subindex: u8 },

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u8),

    #[error("Block CRC mismatch: server sent {received:#06x}, computed {computed:#06x}")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("Transfer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Object of {size} bytes exceeds the {capacity} byte limit")]
    BufferTooSmall { size: usize, capacity: usize },

    #[error("Server answered with a segmented transfer (size {size:?})")]
    NotExpedited { size: Option<u32> },

    #[error("Invalid data size: {0}")]
    InvalidSize(usize),

    #[error("Invalid node id: {0}")]
    InvalidNodeId(u8),
}

fn describe_abort(code: &u32) -> String {
    format!(
        "SDO transfer aborted with code {code:#010x}: {}",
        AbortCode::describe(*code)
    )
}
