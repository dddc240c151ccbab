use canser_proto::{PacketKind, Result};

use crate::gateway::MuxState;
use crate::vport;

/// One liveness step. Touches at most one slot per call, so a periodic
/// caller sweeps the table a slot at a time. Cursor 0 is the bus
/// socket's slot and doubles as the broadcast phase; this sweep is the
/// only place ports are ever removed.
pub fn sweep(state: &mut MuxState) -> Result<()> {
    if state.ping_cursor == 0 {
        // solicit announcements from nodes we have not seen yet
        state.bus.send(PacketKind::UuidRequest.id(), &[])?;
        state.ping_cursor = 1;
        return Ok(());
    }

    let index = state.ping_cursor - 1;
    let credit = match state.ports.get(index) {
        Some(entry) => entry.ping_credit,
        None => {
            // swept past the end, start over
            state.ping_cursor = 0;
            return Ok(());
        }
    };

    if credit == 0 {
        let entry = state.ports.remove(index);
        log::info!(
            "port {} timed out, closing {}",
            entry.number,
            entry.link_path.display()
        );
        vport::close_vport(&state.notify, entry);
        // the next entry shifted into this slot; the cursor stays put
        return Ok(());
    }

    if let Some(entry) = state.ports.get_mut(index) {
        if entry.ping_credit <= 2 {
            // ping only near the timeout to keep bus load down; a send
            // failure leaves the credit and cursor untouched for the
            // next attempt
            state.bus.send(entry.can_id, &[])?;
        }
        entry.ping_credit -= 1;
    }
    state.ping_cursor += 1;
    Ok(())
}
