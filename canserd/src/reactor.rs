use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use canser_proto::{
    in_discovery_window, Assignment, NodeUuid, PacketKind, CAN_DATA_SIZE, END_OF_PACKET,
};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::AddWatchFlags;
use nix::unistd;

use crate::backend::BusFrame;
use crate::gateway::{MuxState, Shared};
use crate::vport;

const POLL_TIMEOUT_MS: u16 = 1000;

/// The multiplexer worker. Waits on the unified poll set (slot 0 is the
/// bus, the rest are PTY masters), then services bus frames before host
/// bytes before watch events, so a discovery can create the slot a
/// following write needs.
pub fn run(shared: Arc<Shared>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        // Snapshot the descriptors so the wait runs unlocked. The ping
        // driver may reap a port meanwhile, so readiness is mapped back
        // by descriptor value, never by slot position.
        let fds: Vec<RawFd> = {
            let state = shared.state.lock().unwrap();
            let mut fds = Vec::with_capacity(state.ports.len() + 1);
            fds.push(state.bus.raw_fd());
            fds.extend(state.ports.iter().map(|entry| entry.master.as_raw_fd()));
            fds
        };

        let mut pollfds: Vec<PollFd> = fds
            .iter()
            .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
            .collect();

        let ready = match poll(&mut pollfds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => {
                log::error!("poll: {}", e);
                log::debug!("Details: {:?}", e);
                0
            }
        };

        let ready_of = |index: usize| {
            pollfds[index]
                .revents()
                .map_or(false, |revents| !revents.is_empty())
        };
        let bus_ready = ready_of(0);
        let ready_masters: Vec<RawFd> = (1..fds.len()).filter(|&i| ready_of(i)).map(|i| fds[i]).collect();

        let mut state = shared.state.lock().unwrap();

        if ready > 0 {
            if bus_ready {
                service_bus(&mut state);
            }
            for &fd in &ready_masters {
                service_pty(&mut state, fd);
            }
        }

        drain_watch_events(&mut state);
    }

    let mut state = shared.state.lock().unwrap();
    for (slot, entry) in state.ports.drain_all().into_iter().enumerate() {
        log::info!("close port {}", slot + 1);
        vport::close_vport(&state.notify, entry);
    }
}

fn service_bus(state: &mut MuxState) {
    let frame = match state.bus.recv() {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            log::error!("bus read: {}", e);
            log::debug!("Details: {:?}", e);
            return;
        }
    };

    match PacketKind::from_id(frame.id) {
        Some(PacketKind::UuidResponse) => configure_port(state, &frame),
        Some(kind) => log::debug!("ignoring {:?} frame from another master", kind),
        None if in_discovery_window(frame.id) => {
            log::debug!("dropping discovery frame 0x{:x}", frame.id)
        }
        None => control_frame(state, &frame),
    }
}

/// A node announced itself: give it a stable port, publish the virtual
/// line and acknowledge the id assignment on the bus.
fn configure_port(state: &mut MuxState, frame: &BusFrame) {
    let uuid = match NodeUuid::from_payload(frame.payload()) {
        Ok(uuid) => uuid,
        Err(e) => {
            log::warn!("malformed UUID response: {}", e);
            return;
        }
    };

    let number = state.numbers.number_for(uuid);
    log::info!("UUID {} on port {}", uuid, number);

    match vport::open_vport(
        &mut state.ports,
        &state.notify,
        &state.link_dir,
        &state.link_prefix,
        number,
        uuid,
    ) {
        Ok(_) => {
            let assign = Assignment::for_port(number, uuid);
            if let Err(e) = state
                .bus
                .send(PacketKind::AddressAssign.id(), &assign.encode())
            {
                log::error!("id assignment for {} failed: {}", uuid, e);
                log::debug!("Details: {:?}", e);
            }
        }
        Err(e) => {
            // no slot was added; the node will announce again
            log::error!("virtual port for {} failed: {}", uuid, e);
            log::debug!("Details: {:?}", e);
        }
    }
}

fn control_frame(state: &mut MuxState, frame: &BusFrame) {
    if let Some(entry) = state.ports.by_ctl_frame(frame.id) {
        if frame.len > 0 && entry.attached {
            match unistd::write(&entry.master, frame.payload()) {
                Ok(_) => {}
                // the host reader is behind, drop
                Err(Errno::EAGAIN) => {}
                Err(e) => log::warn!("pty write: {}", e),
            }
        }
        entry.refresh();
    } else {
        log::info!(
            "An unknown node is using CAN ID 0x{:x}. Ask for UUID",
            frame.id
        );
        // lost handshake; address the node so it re-announces
        let target = frame.id.wrapping_sub(1).to_le_bytes();
        if let Err(e) = state.bus.send(PacketKind::UuidRequest.id(), &target) {
            log::error!("{}", e);
            log::debug!("Details: {:?}", e);
        }
    }
}

/// Forward up to one frame's worth of host bytes to the node.
fn service_pty(state: &mut MuxState, fd: RawFd) {
    // the slot may have been reaped while the poll was parked
    let Some(entry) = state.ports.by_master_fd(fd) else {
        return;
    };

    let mut buf = [0u8; CAN_DATA_SIZE];
    let len = match unistd::read(&entry.master, &mut buf) {
        Ok(0) => return,
        Ok(len) => len,
        Err(Errno::EAGAIN) => return,
        // EIO while no process holds the slave open
        Err(Errno::EIO) => return,
        Err(e) => {
            log::warn!("pty read: {}", e);
            return;
        }
    };

    if buf[..len].contains(&END_OF_PACKET) {
        // the packet terminator doubles as an attachment signal in case
        // an open event was missed
        entry.attached = true;
    }

    let id = entry.can_id;
    if let Err(e) = state.bus.send(id, &buf[..len]) {
        log::error!("bus send: {}", e);
        log::debug!("Details: {:?}", e);
    }
}

/// Non-blocking drain of the open/close watch stream; toggles the
/// attached flag and nudges the node on a fresh open.
fn drain_watch_events(state: &mut MuxState) {
    loop {
        let events = match state.notify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return,
            Err(e) => {
                log::warn!("inotify: {}", e);
                return;
            }
        };

        for event in events {
            let Some(entry) = state.ports.by_watch(event.wd) else {
                continue;
            };
            if event.mask.contains(AddWatchFlags::IN_OPEN) {
                entry.attached = true;
                // reset the node so the new session starts clean
                let target = entry.can_id.to_le_bytes();
                if let Err(e) = state.bus.send(PacketKind::UuidRequest.id(), &target) {
                    log::error!("{}", e);
                    log::debug!("Details: {:?}", e);
                }
            } else if event
                .mask
                .intersects(AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_CLOSE_NOWRITE)
            {
                entry.attached = false;
            }
        }
    }
}
