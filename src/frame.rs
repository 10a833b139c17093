use crate::payload::{self, NmtCommand, NmtFunction, Payload, SdoPayload};
use crate::CanOpenError;
use binrw::{binrw, BinRead, BinWrite};
use std::fmt;
use std::io::Cursor;

pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
// identifier bits 11..=28, only used by 29-bit frames
const CAN_RESERVED_MASK: u32 = 0x1FFF_F800;

pub const RAW_FRAME_LEN: usize = 16;
pub const MAX_NODE_ID: u8 = 0x7F;

/// Function codes, the upper four bits of an 11-bit COB-ID.
pub mod function_code {
    pub const NMT: u8 = 0x0;
    pub const SYNC_EMERGENCY: u8 = 0x1;
    pub const TIME_STAMP: u8 = 0x2;
    pub const PDO1_TX: u8 = 0x3;
    pub const PDO4_RX: u8 = 0xA;
    pub const SDO_TX: u8 = 0xB;
    pub const SDO_RX: u8 = 0xC;
    pub const NMT_ERROR_CONTROL: u8 = 0xE;
}

/// A classic CAN frame in the SocketCAN `struct can_frame` layout:
/// little-endian id word, dlc, three padding bytes, eight data bytes.
#[binrw]
#[brw(little)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub id: u32,
    #[brw(pad_after = 3)]
    pub dlc: u8,
    pub data: [u8; 8],
}

impl RawFrame {
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, CanOpenError> {
        if payload.len() > 8 {
            return Err(CanOpenError::MalformedFrame(format!(
                "{} data bytes do not fit a CAN frame",
                payload.len()
            )));
        }
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            dlc: payload.len() as u8,
            data,
        })
    }

    pub fn is_rtr(&self) -> bool {
        self.id & CAN_RTR_FLAG != 0
    }

    pub fn is_extended(&self) -> bool {
        self.id & CAN_EFF_FLAG != 0
    }

    /// Data bytes up to `dlc`, clamped to the buffer.
    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.dlc.min(8))]
    }

    pub fn from_bytes(bytes: &[u8; RAW_FRAME_LEN]) -> Result<Self, CanOpenError> {
        Ok(Self::read(&mut Cursor::new(&bytes[..]))?)
    }

    pub fn to_bytes(&self) -> Result<[u8; RAW_FRAME_LEN], CanOpenError> {
        let mut bytes = [0u8; RAW_FRAME_LEN];
        self.write(&mut Cursor::new(&mut bytes[..]))?;
        Ok(bytes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rxtx {
    RX,
    TX,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Nmt,
    Sync,
    Emergency,
    TimeStamp,
    Pdo { number: u8, rxtx: Rxtx },
    SdoResponse,
    SdoRequest,
    NodeGuard,
    Unknown,
}

impl MessageKind {
    pub fn from_parts(function_code: u8, node_id: u8) -> Self {
        match function_code {
            function_code::NMT => Self::Nmt,
            function_code::SYNC_EMERGENCY if node_id == 0 => Self::Sync,
            function_code::SYNC_EMERGENCY => Self::Emergency,
            function_code::TIME_STAMP => Self::TimeStamp,
            fc @ function_code::PDO1_TX..=function_code::PDO4_RX => {
                let offset = fc - function_code::PDO1_TX;
                Self::Pdo {
                    number: offset / 2 + 1,
                    rxtx: if offset % 2 == 0 { Rxtx::TX } else { Rxtx::RX },
                }
            }
            function_code::SDO_TX => Self::SdoResponse,
            function_code::SDO_RX => Self::SdoRequest,
            function_code::NMT_ERROR_CONTROL => Self::NodeGuard,
            _ => Self::Unknown,
        }
    }
}

/// A standard-identifier CAN frame split into CANopen function code and node id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanopenFrame {
    pub rtr: bool,
    pub function_code: u8,
    pub node_id: u8,
    pub kind: MessageKind,
    pub data: [u8; 8],
    pub data_len: u8,
}

/// Splits a raw frame into its CANopen parts.
///
/// Extended and error frames, stray identifier bits and a dlc above 8 are
/// rejected with [`CanOpenError::MalformedFrame`].
pub fn classify(raw: &RawFrame) -> Result<CanopenFrame, CanOpenError> {
    if raw.dlc > 8 {
        return Err(CanOpenError::MalformedFrame(format!(
            "dlc {} out of range",
            raw.dlc
        )));
    }
    if raw.is_extended() {
        return Err(CanOpenError::MalformedFrame(format!(
            "extended identifier {:#010x}",
            raw.id
        )));
    }
    if raw.id & CAN_ERR_FLAG != 0 {
        return Err(CanOpenError::MalformedFrame(format!(
            "error frame {:#010x}",
            raw.id
        )));
    }
    if raw.id & CAN_RESERVED_MASK != 0 {
        return Err(CanOpenError::MalformedFrame(format!(
            "reserved identifier bits set in {:#010x}",
            raw.id
        )));
    }

    let cob_id = raw.id & CAN_SFF_MASK;
    let function_code = (cob_id >> 7) as u8;
    let node_id = (cob_id & u32::from(MAX_NODE_ID)) as u8;
    let mut data = [0u8; 8];
    if !raw.is_rtr() {
        data[..usize::from(raw.dlc)].copy_from_slice(raw.payload());
    }

    Ok(CanopenFrame {
        rtr: raw.is_rtr(),
        function_code,
        node_id,
        kind: MessageKind::from_parts(function_code, node_id),
        data,
        data_len: raw.dlc,
    })
}

impl CanopenFrame {
    /// Builds a data frame, encoding `payload` for the given COB-ID parts.
    pub fn new(function_code: u8, node_id: u8, payload: &Payload) -> Result<Self, CanOpenError> {
        let (data, data_len) = payload::encode(payload)?;
        let function_code = function_code & 0x0F;
        let node_id = node_id & MAX_NODE_ID;
        Ok(Self {
            rtr: false,
            function_code,
            node_id,
            kind: MessageKind::from_parts(function_code, node_id),
            data,
            data_len,
        })
    }

    fn remote(function_code: u8, node_id: u8) -> Self {
        let function_code = function_code & 0x0F;
        let node_id = node_id & MAX_NODE_ID;
        Self {
            rtr: true,
            function_code,
            node_id,
            kind: MessageKind::from_parts(function_code, node_id),
            data: [0; 8],
            data_len: 0,
        }
    }

    pub fn identifier(&self) -> u16 {
        (u16::from(self.function_code) << 7) | u16::from(self.node_id)
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.data_len.min(8))]
    }

    /// Interprets the data bytes according to the function code.
    pub fn payload(&self) -> Result<Payload, CanOpenError> {
        if self.rtr {
            return Ok(match self.kind {
                MessageKind::NodeGuard => Payload::GuardRequest,
                _ => Payload::Raw {
                    data: [0; 8],
                    len: 0,
                },
            });
        }
        payload::decode(self.function_code, &self.data, self.data_len)
    }

    pub fn to_raw(&self) -> RawFrame {
        let mut id = u32::from(self.identifier());
        if self.rtr {
            id |= CAN_RTR_FLAG;
        }
        RawFrame {
            id,
            dlc: self.data_len,
            data: self.data,
        }
    }

    /// NMT module control frame. `target_node` 0 addresses every node.
    pub fn nmt(function: NmtFunction, target_node: u8) -> Self {
        let (data, _) = NmtCommand {
            function,
            target_node: target_node & MAX_NODE_ID,
        }
        .to_bytes();
        Self {
            rtr: false,
            function_code: function_code::NMT,
            node_id: 0,
            kind: MessageKind::Nmt,
            data,
            data_len: 2,
        }
    }

    pub fn sync() -> Self {
        Self {
            rtr: false,
            function_code: function_code::SYNC_EMERGENCY,
            node_id: 0,
            kind: MessageKind::Sync,
            data: [0; 8],
            data_len: 0,
        }
    }

    /// Remote request for the node's guard response (0x700 + node).
    pub fn guard_request(node_id: u8) -> Self {
        Self::remote(function_code::NMT_ERROR_CONTROL, node_id)
    }

    /// Remote request for the node's first transmit PDO (0x180 + node).
    pub fn pdo_request(node_id: u8) -> Self {
        Self::remote(function_code::PDO1_TX, node_id)
    }

    /// Client to server SDO frame (0x600 + node).
    pub fn sdo_request(node_id: u8, sdo: &SdoPayload) -> Self {
        let node_id = node_id & MAX_NODE_ID;
        Self {
            rtr: false,
            function_code: function_code::SDO_RX,
            node_id,
            kind: MessageKind::SdoRequest,
            data: sdo.to_bytes(),
            data_len: 8,
        }
    }
}

impl fmt::Display for CanopenFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#05x}] FC={:#x} ID={:#04x} ",
            self.identifier(),
            self.function_code,
            self.node_id
        )?;
        if self.rtr {
            write!(f, "RTR [{}]", self.data_len)?;
        } else {
            write!(f, "[{}]", self.data_len)?;
            for byte in self.data() {
                write!(f, " {byte:02X}")?;
            }
        }
        match self.payload() {
            Ok(payload) => write!(f, " => {payload}"),
            Err(e) => write!(f, " => {e}"),
        }
    }
}
