use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use canser_proto::{
    Error, Result, CAN_DATA_SIZE, CTL_FILTER_BASE, CTL_MASK, UUID_FILTER, UUID_MASK,
};
use nix::sys::socket::{setsockopt, sockopt};
use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions, StandardId,
};

use super::{BusFrame, CanBus};

pub struct SocketBus {
    socket: CanSocket,
}

impl SocketBus {
    pub fn open(interface: &str) -> anyhow::Result<SocketBus> {
        let socket = CanSocket::open(interface)?;

        socket.set_filters(&[
            CanFilter::new(UUID_FILTER as u32, UUID_MASK as u32),
            CanFilter::new(CTL_FILTER_BASE as u32, CTL_MASK as u32),
        ])?;

        let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
        // A zero-length send buffer makes writes block while the kernel
        // queue is full instead of dropping frames.
        setsockopt(&fd, sockopt::SndBuf, &0)?;
        setsockopt(&fd, sockopt::RcvBuf, &512)?;
        socket.set_read_timeout(Duration::from_secs(1))?;

        log::debug!("bound {} with discovery and control filters", interface);
        Ok(SocketBus { socket })
    }
}

impl CanBus for SocketBus {
    fn send(&self, id: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > CAN_DATA_SIZE {
            return Err(Error::PayloadTooLarge);
        }
        let id = StandardId::new(id).ok_or(Error::InvalidId)?;
        let frame = CanFrame::new(id, payload).ok_or(Error::PayloadTooLarge)?;
        self.socket.write_frame(&frame)?;
        Ok(())
    }

    fn recv(&self) -> Result<Option<BusFrame>> {
        let frame = match self.socket.read_frame() {
            Ok(frame) => frame,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };

        match frame {
            CanFrame::Data(frame) if !frame.is_extended() => {
                Ok(Some(BusFrame::new(frame.raw_id() as u16, frame.data())?))
            }
            // Remote, error and extended frames carry nothing for us.
            _ => Ok(None),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
