use crate::frame::{classify, CanopenFrame, RawFrame, CAN_EFF_FLAG, CAN_SFF_MASK};
use crate::CanOpenError;
use log::{debug, trace};
use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, Frame as _, Socket, SocketOptions, StandardId,
};
use std::io;
use std::time::Duration;

/// A bus handle able to move raw CAN frames.
///
/// `recv_frame` returns [`CanOpenError::Timeout`] when nothing arrives in
/// time and [`CanOpenError::TransportError`] for anything else.
pub trait Transport {
    fn send_frame(&mut self, frame: &RawFrame) -> Result<(), CanOpenError>;

    fn recv_frame(&mut self) -> Result<RawFrame, CanOpenError>;

    fn send(&mut self, frame: &CanopenFrame) -> Result<(), CanOpenError> {
        self.send_frame(&frame.to_raw())
    }

    fn recv(&mut self) -> Result<CanopenFrame, CanOpenError> {
        classify(&self.recv_frame()?)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_frame(&mut self, frame: &RawFrame) -> Result<(), CanOpenError> {
        (**self).send_frame(frame)
    }

    fn recv_frame(&mut self) -> Result<RawFrame, CanOpenError> {
        (**self).recv_frame()
    }
}

/// SocketCAN connection.
#[derive(Debug)]
pub struct Conn {
    socket: CanSocket,
    interface: String,
}

impl Conn {
    /// Opens `interface_name` with blocking reads.
    pub fn new(interface_name: &str) -> Result<Self, CanOpenError> {
        let socket = CanSocket::open(interface_name).map_err(|e| {
            CanOpenError::TransportUnavailable(format!("{interface_name}: {e}"))
        })?;
        debug!("opened CAN interface {interface_name}");
        Ok(Self {
            socket,
            interface: interface_name.to_string(),
        })
    }

    /// Opens `interface_name` with `timeout` applied to reads and writes.
    pub fn open(interface_name: &str, timeout: Duration) -> Result<Self, CanOpenError> {
        let conn = Self::new(interface_name)?;
        conn.set_read_timeout(timeout)?;
        conn.set_write_timeout(timeout)?;
        Ok(conn)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> Result<(), CanOpenError> {
        Ok(self.socket.set_read_timeout(timeout)?)
    }

    pub fn set_write_timeout(&self, timeout: Duration) -> Result<(), CanOpenError> {
        Ok(self.socket.set_write_timeout(timeout)?)
    }

    /// Only accept frames whose node id bits equal `node_id`, whatever the
    /// function code.
    pub fn set_node_filter(&self, node_id: u8) -> Result<(), CanOpenError> {
        let filter = CanFilter::new(u32::from(node_id & 0x7F), 0x7F);
        self.socket.set_filters(&[filter])?;
        debug!("{}: filtering on node {node_id:#04x}", self.interface);
        Ok(())
    }

    pub fn clear_filters(&self) -> Result<(), CanOpenError> {
        Ok(self.socket.set_filter_accept_all()?)
    }

    pub fn close(self) {
        debug!("closing CAN interface {}", self.interface);
    }
}

impl Transport for Conn {
    fn send_frame(&mut self, frame: &RawFrame) -> Result<(), CanOpenError> {
        let can_frame = to_can_frame(frame)?;
        trace!("{} tx {:#05x} {:02X?}", self.interface, frame.id, frame.payload());
        self.socket.write_frame(&can_frame).map_err(map_io_error)
    }

    fn recv_frame(&mut self) -> Result<RawFrame, CanOpenError> {
        let can_frame = self.socket.read_frame().map_err(map_io_error)?;
        let frame = from_can_frame(&can_frame);
        trace!("{} rx {:#05x} {:02X?}", self.interface, frame.id, frame.payload());
        Ok(frame)
    }
}

fn map_io_error(e: io::Error) -> CanOpenError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CanOpenError::Timeout,
        _ => CanOpenError::TransportError(e),
    }
}

fn to_can_frame(frame: &RawFrame) -> Result<CanFrame, CanOpenError> {
    if frame.is_extended() {
        return Err(CanOpenError::MalformedFrame(format!(
            "extended identifier {:#010x} cannot be sent",
            frame.id
        )));
    }
    let id = StandardId::new((frame.id & CAN_SFF_MASK) as u16).ok_or_else(|| {
        CanOpenError::MalformedFrame(format!("invalid identifier {:#x}", frame.id))
    })?;
    let can_frame = if frame.is_rtr() {
        CanFrame::new_remote(id, usize::from(frame.dlc))
    } else {
        CanFrame::new(id, frame.payload())
    };
    can_frame.ok_or_else(|| CanOpenError::MalformedFrame(format!("cannot encode {frame:?}")))
}

fn from_can_frame(can_frame: &CanFrame) -> RawFrame {
    let payload = can_frame.data();
    let len = payload.len().min(8);
    let mut data = [0u8; 8];
    data[..len].copy_from_slice(&payload[..len]);
    let mut id = can_frame.id_word();
    if can_frame.is_extended() {
        id |= CAN_EFF_FLAG;
    }
    RawFrame {
        id,
        dlc: can_frame.dlc() as u8,
        data,
    }
}
