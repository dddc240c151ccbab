pub mod socketcan;

use std::os::unix::io::RawFd;

use canser_proto::{Error, Result, CAN_DATA_SIZE};

/// One frame off the bus, in the fixed shape the wire allows.
#[derive(Debug, Clone, Copy)]
pub struct BusFrame {
    pub id: u16,
    pub data: [u8; CAN_DATA_SIZE],
    pub len: usize,
}

impl BusFrame {
    pub fn new(id: u16, payload: &[u8]) -> Result<BusFrame> {
        if payload.len() > CAN_DATA_SIZE {
            return Err(Error::PayloadTooLarge);
        }
        let mut data = [0u8; CAN_DATA_SIZE];
        data[..payload.len()].copy_from_slice(payload);
        Ok(BusFrame {
            id,
            data,
            len: payload.len(),
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// The bus seam. Production talks raw SocketCAN; tests substitute a
/// loopback implementation.
pub trait CanBus: Send {
    /// Transmit one frame. Frames are indivisible; a short write is an
    /// error, not a resumption point.
    fn send(&self, id: u16, payload: &[u8]) -> Result<()>;

    /// Receive one frame, `None` when the read timed out.
    fn recv(&self) -> Result<Option<BusFrame>>;

    /// Descriptor for the unified poll set.
    fn raw_fd(&self) -> RawFd;
}
