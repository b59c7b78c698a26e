use serde::{Deserialize, Serialize};

pub type StationId = u32;

/// Numeric connection identifier, unique within one cell.
pub type Cid = i32;

/// CID reserved for the cell-wide initial ranging connection.
pub const RANGING_CID: Cid = 0;

/// Marks a connection whose CID has not been assigned yet.
pub const UNASSIGNED_CID: Cid = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    NoType,
    InitialRanging,
    Basic,
    PrimaryManagement,
    SecondaryManagement,
    Data,
}

/// Link direction, encoded as a bit field so that
/// `Bidirectional == Downlink | Uplink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    NoDirection = 0x0,
    Downlink = 0x1,
    Uplink = 0x2,
    Bidirectional = 0x3,
}

impl Direction {
    /// True if this direction covers `other`, e.g. `Bidirectional`
    /// covers both `Downlink` and `Uplink`.
    pub fn covers(self, other: Direction) -> bool {
        other != Direction::NoDirection && (self as u8) & (other as u8) == other as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QosCategory {
    NoQos,
    Signaling,
    Ugs,
    RtPs,
    NrtPs,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationType {
    BaseStation,
    SubscriberStation,
    RelayStation,
}

impl StationType {
    pub fn is_base_station(self) -> bool {
        self == StationType::BaseStation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bidirectional_covers_both_link_directions() {
        assert!(Direction::Bidirectional.covers(Direction::Downlink));
        assert!(Direction::Bidirectional.covers(Direction::Uplink));
        assert!(Direction::Uplink.covers(Direction::Uplink));
        assert!(!Direction::Uplink.covers(Direction::Downlink));
        assert!(!Direction::Downlink.covers(Direction::NoDirection));
    }
}
