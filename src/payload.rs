use crate::enums::{AbortCode, EmergencyErrorCode, EmergencyErrorRegister};
use crate::frame::function_code;
use crate::CanOpenError;
use binrw::{binrw, BinRead, BinWrite};
use std::fmt;
use std::io::Cursor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmtFunction {
    EnterOperational,
    EnterStop,
    EnterPreOperational,
    ResetNode,
    ResetCommunication,
}

impl NmtFunction {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::EnterOperational),
            0x02 => Some(Self::EnterStop),
            0x80 => Some(Self::EnterPreOperational),
            0x81 => Some(Self::ResetNode),
            0x82 => Some(Self::ResetCommunication),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::EnterOperational => 0x01,
            Self::EnterStop => 0x02,
            Self::EnterPreOperational => 0x80,
            Self::ResetNode => 0x81,
            Self::ResetCommunication => 0x82,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NmtCommand {
    pub function: NmtFunction,
    /// 0 addresses all nodes.
    pub target_node: u8,
}

impl NmtCommand {
    pub(crate) fn to_bytes(self) -> ([u8; 8], u8) {
        let mut data = [0u8; 8];
        data[0] = self.function.to_byte();
        data[1] = self.target_node;
        (data, 2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    BootUp,
    Disconnected,
    Connecting,
    Preparing,
    Stopped,
    Operational,
    PreOperational,
}

impl NodeState {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::BootUp),
            0x01 => Some(Self::Disconnected),
            0x02 => Some(Self::Connecting),
            0x03 => Some(Self::Preparing),
            0x04 => Some(Self::Stopped),
            0x05 => Some(Self::Operational),
            0x7F => Some(Self::PreOperational),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::BootUp => 0x00,
            Self::Disconnected => 0x01,
            Self::Connecting => 0x02,
            Self::Preparing => 0x03,
            Self::Stopped => 0x04,
            Self::Operational => 0x05,
            Self::PreOperational => 0x7F,
        }
    }
}

/// Node guarding response or heartbeat: toggle in bit 7, state in bits 0-6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeGuard {
    pub toggle: bool,
    pub state: NodeState,
}

#[binrw]
#[brw(little)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Emergency {
    pub error_code: u16,
    pub error_register: u8,
    pub vendor_data: [u8; 5],
}

impl Emergency {
    pub fn class(&self) -> EmergencyErrorCode {
        EmergencyErrorCode::decode(self.error_code)
    }

    pub fn errors(&self) -> Vec<EmergencyErrorRegister> {
        EmergencyErrorRegister::decode(self.error_register)
    }
}

/// Client command specifiers (bits 5-7 of a client to server command byte).
pub mod ccs {
    pub const DOWNLOAD_SEGMENT: u8 = 0;
    pub const INITIATE_DOWNLOAD: u8 = 1;
    pub const INITIATE_UPLOAD: u8 = 2;
    pub const UPLOAD_SEGMENT: u8 = 3;
    pub const ABORT: u8 = 4;
    pub const BLOCK_UPLOAD: u8 = 5;
    pub const BLOCK_DOWNLOAD: u8 = 6;
}

/// Server command specifiers (bits 5-7 of a server to client command byte).
pub mod scs {
    pub const UPLOAD_SEGMENT: u8 = 0;
    pub const DOWNLOAD_SEGMENT: u8 = 1;
    pub const INITIATE_UPLOAD: u8 = 2;
    pub const INITIATE_DOWNLOAD: u8 = 3;
    pub const ABORT: u8 = 4;
    pub const BLOCK_DOWNLOAD: u8 = 5;
    pub const BLOCK_UPLOAD: u8 = 6;
}

/// Sub-commands in bits 0-1 of block transfer command bytes.
pub mod block_subcommand {
    pub const INITIATE: u8 = 0;
    pub const END: u8 = 1;
    pub const ACK: u8 = 2;
    pub const START_UPLOAD: u8 = 3;
}

/// Which bit layout applies to an SDO command byte. The byte alone does not
/// say; the transfer state does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoPhase {
    Initiate,
    Segment,
    Generic,
    Block,
    BlockSegment,
    BlockEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoCommand {
    /// `s` bit 0, `e` bit 1, `n` bits 2-3.
    Initiate {
        cs: u8,
        n: u8,
        expedited: bool,
        size_indicated: bool,
    },
    /// `c` bit 0, `n` bits 1-3, `t` bit 4.
    Segment {
        cs: u8,
        toggle: bool,
        n: u8,
        last: bool,
    },
    Generic {
        cs: u8,
    },
    /// Sub-command bits 0-1, `s` bit 1, CRC support bit 2. Bit 1 is `s` only
    /// in initiate exchanges.
    Block {
        cs: u8,
        crc: bool,
        size_indicated: bool,
        subcommand: u8,
    },
    /// Sequence number bits 0-6, `c` bit 7. Carries no command specifier.
    BlockSegment {
        last: bool,
        seqno: u8,
    },
    /// Sub-command bits 0-1, `n` bits 2-4.
    BlockEnd {
        cs: u8,
        n: u8,
        subcommand: u8,
    },
}

impl SdoCommand {
    pub fn decode(byte: u8, phase: SdoPhase) -> Self {
        let cs = byte >> 5;
        match phase {
            SdoPhase::Initiate => Self::Initiate {
                cs,
                n: (byte >> 2) & 0x03,
                expedited: byte & 0x02 != 0,
                size_indicated: byte & 0x01 != 0,
            },
            SdoPhase::Segment => Self::Segment {
                cs,
                toggle: byte & 0x10 != 0,
                n: (byte >> 1) & 0x07,
                last: byte & 0x01 != 0,
            },
            SdoPhase::Generic => Self::Generic { cs },
            SdoPhase::Block => Self::Block {
                cs,
                crc: byte & 0x04 != 0,
                size_indicated: byte & 0x02 != 0,
                subcommand: byte & 0x03,
            },
            SdoPhase::BlockSegment => Self::BlockSegment {
                last: byte & 0x80 != 0,
                seqno: byte & 0x7F,
            },
            SdoPhase::BlockEnd => Self::BlockEnd {
                cs,
                n: (byte >> 2) & 0x07,
                subcommand: byte & 0x03,
            },
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Initiate {
                cs,
                n,
                expedited,
                size_indicated,
            } => (cs << 5) | ((n & 0x03) << 2) | (u8::from(expedited) << 1) | u8::from(size_indicated),
            Self::Segment {
                cs,
                toggle,
                n,
                last,
            } => (cs << 5) | (u8::from(toggle) << 4) | ((n & 0x07) << 1) | u8::from(last),
            Self::Generic { cs } => cs << 5,
            Self::Block {
                cs,
                crc,
                size_indicated,
                subcommand,
            } => (cs << 5) | (u8::from(crc) << 2) | (u8::from(size_indicated) << 1) | (subcommand & 0x03),
            Self::BlockSegment { last, seqno } => (u8::from(last) << 7) | (seqno & 0x7F),
            Self::BlockEnd { cs, n, subcommand } => {
                (cs << 5) | ((n & 0x07) << 2) | (subcommand & 0x03)
            }
        }
    }
}

/// SDO frame body: command byte, index (LE), subindex, four data bytes.
///
/// Segment and block frames reuse bytes 1-7 as plain data; see
/// [`SdoPayload::segment`] and [`SdoPayload::segment_data`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SdoPayload {
    pub command: u8,
    pub index: u16,
    pub subindex: u8,
    pub data: [u8; 4],
}

impl SdoPayload {
    pub fn new(command: u8, index: u16, subindex: u8, data: [u8; 4]) -> Self {
        Self {
            command,
            index,
            subindex,
            data,
        }
    }

    /// A command byte followed by up to seven bytes of raw segment data.
    pub fn segment(command: u8, chunk: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[0] = command;
        let len = chunk.len().min(7);
        bytes[1..1 + len].copy_from_slice(&chunk[..len]);
        Self::from_bytes(&bytes)
    }

    pub fn abort(index: u16, subindex: u8, code: u32) -> Self {
        Self::new(ccs::ABORT << 5, index, subindex, code.to_le_bytes())
    }

    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            command: bytes[0],
            index: u16::from_le_bytes([bytes[1], bytes[2]]),
            subindex: bytes[3],
            data: [bytes[4], bytes[5], bytes[6], bytes[7]],
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let index = self.index.to_le_bytes();
        [
            self.command,
            index[0],
            index[1],
            self.subindex,
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]
    }

    pub fn segment_data(&self) -> [u8; 7] {
        let bytes = self.to_bytes();
        let mut data = [0u8; 7];
        data.copy_from_slice(&bytes[1..]);
        data
    }

    pub fn command(&self, phase: SdoPhase) -> SdoCommand {
        SdoCommand::decode(self.command, phase)
    }

    pub fn abort_code(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Payload {
    Nmt(NmtCommand),
    Sync { counter: Option<u8> },
    Emergency(Emergency),
    NodeGuard(NodeGuard),
    GuardRequest,
    Sdo(SdoPayload),
    /// PDO, TIME and anything else passed through untouched.
    Raw { data: [u8; 8], len: u8 },
}

fn malformed(what: &str, len: u8) -> CanOpenError {
    CanOpenError::MalformedFrame(format!("{what} with {len} data bytes"))
}

pub fn decode(function_code: u8, raw: &[u8; 8], data_len: u8) -> Result<Payload, CanOpenError> {
    if data_len > 8 {
        return Err(malformed("frame", data_len));
    }
    let len = usize::from(data_len);
    let mut data = [0u8; 8];
    data[..len].copy_from_slice(&raw[..len]);

    match function_code {
        function_code::NMT => {
            if len != 2 {
                return Err(malformed("NMT command", data_len));
            }
            let function = NmtFunction::from_byte(data[0]).ok_or_else(|| {
                CanOpenError::MalformedFrame(format!("unknown NMT command {:#04x}", data[0]))
            })?;
            Ok(Payload::Nmt(NmtCommand {
                function,
                target_node: data[1],
            }))
        }
        function_code::SYNC_EMERGENCY => match len {
            0 => Ok(Payload::Sync { counter: None }),
            1 => Ok(Payload::Sync {
                counter: Some(data[0]),
            }),
            8 => Ok(Payload::Emergency(Emergency::read(&mut Cursor::new(&data[..]))?)),
            _ => Err(malformed("SYNC/EMCY", data_len)),
        },
        function_code::TIME_STAMP..=function_code::PDO4_RX => Ok(Payload::Raw { data, len: data_len }),
        function_code::SDO_TX | function_code::SDO_RX => {
            if len == 0 {
                return Err(malformed("SDO", data_len));
            }
            Ok(Payload::Sdo(SdoPayload::from_bytes(&data)))
        }
        function_code::NMT_ERROR_CONTROL => {
            match len {
                0 => return Ok(Payload::GuardRequest),
                1 => {}
                _ => return Err(malformed("node state", data_len)),
            }
            let state = NodeState::from_byte(data[0] & 0x7F).ok_or_else(|| {
                CanOpenError::MalformedFrame(format!("unknown node state {:#04x}", data[0] & 0x7F))
            })?;
            Ok(Payload::NodeGuard(NodeGuard {
                toggle: data[0] & 0x80 != 0,
                state,
            }))
        }
        other => Err(CanOpenError::UnknownFunctionCode(other)),
    }
}

pub fn encode(payload: &Payload) -> Result<([u8; 8], u8), CanOpenError> {
    let mut data = [0u8; 8];
    let len = match payload {
        Payload::Nmt(command) => return Ok(command.to_bytes()),
        Payload::Sync { counter: None } | Payload::GuardRequest => 0,
        Payload::Sync {
            counter: Some(counter),
        } => {
            data[0] = *counter;
            1
        }
        Payload::Emergency(emergency) => {
            emergency.write(&mut Cursor::new(&mut data[..]))?;
            8
        }
        Payload::NodeGuard(guard) => {
            data[0] = (u8::from(guard.toggle) << 7) | guard.state.to_byte();
            1
        }
        Payload::Sdo(sdo) => {
            data = sdo.to_bytes();
            8
        }
        Payload::Raw { data: raw, len } => {
            if *len > 8 {
                return Err(malformed("raw payload", *len));
            }
            let len = usize::from(*len);
            // bytes past the length must stay zero so decode gives the same value back
            if raw[len..].iter().any(|b| *b != 0) {
                return Err(malformed("raw payload with bytes set past its length", len as u8));
            }
            data[..len].copy_from_slice(&raw[..len]);
            len as u8
        }
    };
    Ok((data, len))
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Nmt(command) => match command.target_node {
                0 => write!(f, "NMT {:?} all nodes", command.function),
                node => write!(f, "NMT {:?} node {node:#04x}", command.function),
            },
            Payload::Sync { counter: None } => write!(f, "SYNC"),
            Payload::Sync {
                counter: Some(counter),
            } => write!(f, "SYNC counter {counter}"),
            Payload::Emergency(emergency) => write!(
                f,
                "EMCY {:#06x} ({:?}) register {:?}",
                emergency.error_code,
                emergency.class(),
                emergency.errors()
            ),
            Payload::NodeGuard(guard) => write!(
                f,
                "node state {:?} toggle {}",
                guard.state,
                u8::from(guard.toggle)
            ),
            Payload::GuardRequest => write!(f, "node guard request"),
            Payload::Sdo(sdo) => {
                write!(
                    f,
                    "SDO cmd {:#04x} object {:#06x}:{:#04x} data {:02X?}",
                    sdo.command, sdo.index, sdo.subindex, sdo.data
                )?;
                if let SdoCommand::Generic { cs: ccs::ABORT } = sdo.command(SdoPhase::Generic) {
                    write!(f, " abort: {}", AbortCode::describe(sdo.abort_code()))?;
                }
                Ok(())
            }
            Payload::Raw { data, len } => {
                write!(f, "data {:02X?}", &data[..usize::from((*len).min(8))])
            }
        }
    }
}
