mod error;

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
pub use error::*;
use num_derive::FromPrimitive;

pub const CAN_DATA_SIZE: usize = 8;
pub const CAN_UUID_SIZE: usize = 6;

/// Discovery channel filter: admits ids 0x320..=0x323.
pub const UUID_FILTER: u16 = 0x320;
pub const UUID_MASK: u16 = 0xFFFC;

/// Control channels start here; 127 ports fit under the mask.
pub const CTL_FILTER_BASE: u16 = 0x180;
pub const CTL_MASK: u16 = 0xFF80;

pub const PINGS_BEFORE_DISCONNECT: u8 = 4;

/// End-of-packet marker in the serial byte stream.
pub const END_OF_PACKET: u8 = 0x7E;

/// Fixed packet ids on the discovery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum PacketKind {
    /// Solicit a UUID announcement; empty payload broadcasts, a 2-byte
    /// id targets (and resets) one node.
    UuidRequest = 0x321,
    /// Tell a node which control id it was assigned.
    AddressAssign = 0x322,
    /// A node announcing its 6-byte UUID.
    UuidResponse = 0x323,
}

impl PacketKind {
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<PacketKind> {
        num::FromPrimitive::from_u16(id)
    }
}

pub fn in_discovery_window(id: u16) -> bool {
    id & UUID_MASK == UUID_FILTER
}

/// Control id the gateway transmits on for a given port number.
pub fn ctl_id(port: u16) -> u16 {
    2 * port + CTL_FILTER_BASE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeUuid([u8; CAN_UUID_SIZE]);

impl NodeUuid {
    pub fn from_payload(data: &[u8]) -> Result<NodeUuid> {
        if data.len() < CAN_UUID_SIZE {
            return Err(Error::Truncated);
        }
        let mut uuid = [0u8; CAN_UUID_SIZE];
        uuid.copy_from_slice(&data[..CAN_UUID_SIZE]);
        Ok(NodeUuid(uuid))
    }

    pub fn as_bytes(&self) -> &[u8; CAN_UUID_SIZE] {
        &self.0
    }

    /// Twelve lowercase hex digits, the symlink name suffix.
    pub fn link_suffix(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; CAN_UUID_SIZE]> for NodeUuid {
    fn from(bytes: [u8; CAN_UUID_SIZE]) -> NodeUuid {
        NodeUuid(bytes)
    }
}

impl fmt::Display for NodeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Payload of an [`PacketKind::AddressAssign`] frame: the assigned
/// control id followed by the UUID it belongs to, packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub ctl_id: u16,
    pub uuid: NodeUuid,
}

impl Assignment {
    pub fn for_port(port: u16, uuid: NodeUuid) -> Assignment {
        Assignment {
            ctl_id: ctl_id(port),
            uuid,
        }
    }

    pub fn encode(&self) -> [u8; CAN_DATA_SIZE] {
        let mut wire = [0u8; CAN_DATA_SIZE];
        wire[..2].copy_from_slice(&self.ctl_id.to_le_bytes());
        wire[2..2 + CAN_UUID_SIZE].copy_from_slice(&self.uuid.0);
        wire
    }

    pub fn decode(data: &[u8]) -> Result<Assignment> {
        if data.len() < CAN_DATA_SIZE {
            return Err(Error::Truncated);
        }
        let mut read = Cursor::new(data);
        let ctl_id = read.read_u16::<LittleEndian>()?;
        let uuid = NodeUuid::from_payload(&data[2..])?;
        Ok(Assignment { ctl_id, uuid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_ids_are_even_and_paired() {
        assert_eq!(ctl_id(1), 0x182);
        assert_eq!(ctl_id(7), 0x18E);
        for port in 1..64 {
            let id = ctl_id(port);
            assert_eq!(id % 2, 0);
            assert_eq!(id & CTL_MASK, CTL_FILTER_BASE);
        }
    }

    #[test]
    fn packet_kind_round_trips_through_ids() {
        for kind in [
            PacketKind::UuidRequest,
            PacketKind::AddressAssign,
            PacketKind::UuidResponse,
        ] {
            assert_eq!(PacketKind::from_id(kind.id()), Some(kind));
        }
        assert_eq!(PacketKind::from_id(0x320), None);
        assert_eq!(PacketKind::from_id(0x182), None);
    }

    #[test]
    fn discovery_window_matches_the_filter() {
        assert!(in_discovery_window(0x320));
        assert!(in_discovery_window(0x323));
        assert!(!in_discovery_window(0x324));
        assert!(!in_discovery_window(0x182));
    }

    #[test]
    fn uuid_formats_for_logs_and_links() {
        let uuid = NodeUuid::from([0x01, 0x02, 0x03, 0xAA, 0xBB, 0xCC]);
        assert_eq!(uuid.to_string(), "01:02:03:aa:bb:cc");
        assert_eq!(uuid.link_suffix(), "010203aabbcc");
    }

    #[test]
    fn uuid_rejects_short_payloads() {
        assert!(matches!(
            NodeUuid::from_payload(&[1, 2, 3]),
            Err(Error::Truncated)
        ));
        let uuid = NodeUuid::from_payload(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(uuid.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn assignment_encodes_packed_little_endian() {
        let uuid = NodeUuid::from([1, 2, 3, 4, 5, 6]);
        let assign = Assignment::for_port(7, uuid);
        let wire = assign.encode();
        assert_eq!(wire, [0x8E, 0x01, 1, 2, 3, 4, 5, 6]);
        assert_eq!(Assignment::decode(&wire).unwrap(), assign);
    }

    #[test]
    fn assignment_rejects_short_payloads() {
        assert!(matches!(
            Assignment::decode(&[0x8E, 0x01, 1, 2]),
            Err(Error::Truncated)
        ));
    }
}
