use std::fs;
use std::mem;
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::Context;
use canser_proto::{ctl_id, NodeUuid, PINGS_BEFORE_DISCONNECT};
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::inotify::{AddWatchFlags, Inotify};
use nix::sys::stat::{fchmod, Mode};
use nix::sys::termios::Termios;
use nix::unistd::ttyname;

use crate::ports::{PortEntry, PortTable};

fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_OPEN | AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_CLOSE_NOWRITE
}

/// Allocate a PTY pair for a discovered node, publish its symlink and
/// register the open/close watch. Re-announcing an already known port
/// number reuses the existing slot.
pub fn open_vport(
    table: &mut PortTable,
    notify: &Inotify,
    link_dir: &Path,
    link_prefix: &str,
    number: u16,
    uuid: NodeUuid,
) -> anyhow::Result<usize> {
    if let Some(index) = table.index_by_number(number) {
        log::info!("Device reset on port {}", number);
        return Ok(index);
    }

    // Raw line discipline: no echo, no canonical buffering between the
    // bus and the host client.
    let termios: Termios = unsafe { mem::zeroed::<nix::libc::termios>() }.into();
    let pty = openpty(None::<&Winsize>, Some(&termios)).context("openpty")?;

    // Everything below may fail; the PTY pair is released by drop, the
    // symlink is cleaned up explicitly.
    let flags = OFlag::from_bits_truncate(fcntl(&pty.master, FcntlArg::F_GETFL)?);
    fcntl(&pty.master, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    fcntl(&pty.master, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(&pty.slave, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    // 0666 so unprivileged clients can open the line
    fchmod(&pty.slave, Mode::from_bits_truncate(0o666))?;

    let slave_path = ttyname(&pty.slave).context("ttyname")?;
    let link_path = link_dir.join(format!("{}{}", link_prefix, uuid.link_suffix()));

    // a stale link may survive an unclean shutdown
    let _ = fs::remove_file(&link_path);
    symlink(&slave_path, &link_path)
        .with_context(|| format!("symlink {}", link_path.display()))?;

    let id = ctl_id(number);
    log::info!("{} CANID {:03x}", link_path.display(), id);

    let watch = match notify.add_watch(&link_path, watch_mask()) {
        Ok(watch) => watch,
        Err(e) => {
            let _ = fs::remove_file(&link_path);
            return Err(e).context("inotify watch");
        }
    };

    let entry = PortEntry {
        number,
        can_id: id,
        uuid,
        master: pty.master,
        slave: pty.slave,
        link_path,
        watch,
        attached: false,
        ping_credit: PINGS_BEFORE_DISCONNECT,
    };
    Ok(table.push(entry))
}

/// Tear the port down: watch first, then the published link, then the
/// PTY pair (dropped with the entry).
pub fn close_vport(notify: &Inotify, entry: PortEntry) {
    if let Err(e) = notify.rm_watch(entry.watch) {
        log::debug!("rm_watch {}: {}", entry.link_path.display(), e);
    }
    if let Err(e) = fs::remove_file(&entry.link_path) {
        log::error!("{}: {}", entry.link_path.display(), e);
        log::debug!("Details: {:?}", e);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use nix::sys::inotify::InitFlags;

    use super::*;

    fn setup() -> (PortTable, Inotify, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let notify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).unwrap();
        (PortTable::new(), notify, dir)
    }

    #[test]
    fn publishes_a_link_to_a_pty_slave() {
        let (mut table, notify, dir) = setup();
        let uuid = NodeUuid::from([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);

        let index = open_vport(&mut table, &notify, dir.path(), "ttyCAN0_", 7, uuid).unwrap();
        assert_eq!(index, 0);

        let link = dir.path().join("ttyCAN0_010203040506");
        let target = fs::read_link(&link).unwrap();
        assert!(target.to_string_lossy().starts_with("/dev/pts/"));

        // slave is world read/writable
        let mode = fs::metadata(&link).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        let entry = table.get(0).unwrap();
        assert_eq!(entry.can_id, 0x18E);
        assert_eq!(entry.ping_credit, PINGS_BEFORE_DISCONNECT);
        assert!(!entry.attached);
    }

    #[test]
    fn reannouncement_reuses_the_slot() {
        let (mut table, notify, dir) = setup();
        let uuid = NodeUuid::from([0xAA; 6]);

        let first = open_vport(&mut table, &notify, dir.path(), "ttyCAN0_", 3, uuid).unwrap();
        let second = open_vport(&mut table, &notify, dir.path(), "ttyCAN0_", 3, uuid).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn close_removes_the_link() {
        let (mut table, notify, dir) = setup();
        let uuid = NodeUuid::from([0xBB; 6]);

        open_vport(&mut table, &notify, dir.path(), "ttyCAN0_", 1, uuid).unwrap();
        let link = table.get(0).unwrap().link_path.clone();
        assert!(link.exists());

        let entry = table.remove(0);
        close_vport(&notify, entry);
        assert!(!link.exists());
    }
}
