use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{
    Cid, ConnectionType, Direction, QosCategory, StationId, UNASSIGNED_CID,
};

/// Record describing one logical connection between two stations.
///
/// The pair `(base_station, cid)` is the primary key: equality and
/// ordering only look at it. All other fields are payload that may be
/// updated in place through the connection manager's change operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionIdentifier {
    pub base_station: StationId,
    pub cid: Cid,
    pub subscriber_station: StationId,
    pub remote_station: StationId,
    pub connection_type: ConnectionType,
    pub direction: Direction,
    pub qos: QosCategory,
    /// Frames during which the peer is known not to listen, e.g. while
    /// it scans other cells. Decremented once per frame, floor 0.
    pub not_listening: u32,
}

impl ConnectionIdentifier {
    /// A connection whose CID will be assigned by the connection
    /// manager on registration.
    pub fn new(
        base_station: StationId,
        subscriber_station: StationId,
        remote_station: StationId,
        connection_type: ConnectionType,
        direction: Direction,
        qos: QosCategory,
    ) -> Self {
        Self {
            base_station,
            cid: UNASSIGNED_CID,
            subscriber_station,
            remote_station,
            connection_type,
            direction,
            qos,
            not_listening: 0,
        }
    }

    /// A connection with a known CID, e.g. one mirrored from a
    /// management message of the peer station.
    pub fn with_cid(
        base_station: StationId,
        cid: Cid,
        subscriber_station: StationId,
        remote_station: StationId,
        connection_type: ConnectionType,
        direction: Direction,
        qos: QosCategory,
    ) -> Self {
        Self {
            cid,
            ..Self::new(
                base_station,
                subscriber_station,
                remote_station,
                connection_type,
                direction,
                qos,
            )
        }
    }

    /// Checks the field combination against the connection taxonomy.
    ///
    /// Signalling connections (ranging, basic, management) are
    /// bidirectional; data connections are unidirectional and carry a
    /// traffic QoS class. Everything else is rejected.
    pub fn integrity_check(&self) -> bool {
        match self.connection_type {
            ConnectionType::InitialRanging
            | ConnectionType::Basic
            | ConnectionType::PrimaryManagement
            | ConnectionType::SecondaryManagement => {
                self.direction == Direction::Bidirectional
                    && self.qos == QosCategory::Signaling
            }
            ConnectionType::Data => {
                matches!(self.direction, Direction::Downlink | Direction::Uplink)
                    && matches!(
                        self.qos,
                        QosCategory::Ugs
                            | QosCategory::RtPs
                            | QosCategory::NrtPs
                            | QosCategory::BestEffort
                    )
            }
            ConnectionType::NoType => false,
        }
    }

    /// True if both connections belong to the same base/subscriber
    /// station pair.
    pub fn same_peer(&self, other: &ConnectionIdentifier) -> bool {
        self.base_station == other.base_station
            && self.subscriber_station == other.subscriber_station
    }
}

impl PartialEq for ConnectionIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.base_station == other.base_station && self.cid == other.cid
    }
}

impl Eq for ConnectionIdentifier {}

impl PartialOrd for ConnectionIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConnectionIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.base_station, self.cid).cmp(&(other.base_station, other.cid))
    }
}

impl fmt::Display for ConnectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CID:{}; Type:{:?},{:?}; QoS:{:?}; SS:{}; BS:{}",
            self.cid,
            self.connection_type,
            self.direction,
            self.qos,
            self.subscriber_station,
            self.base_station
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signalling_connections_must_be_bidirectional() {
        let ci = ConnectionIdentifier::new(
            1,
            2,
            2,
            ConnectionType::Basic,
            Direction::Bidirectional,
            QosCategory::Signaling,
        );
        assert!(ci.integrity_check());

        let mut bad = ci.clone();
        bad.direction = Direction::Uplink;
        assert!(!bad.integrity_check());

        let mut bad = ci;
        bad.qos = QosCategory::BestEffort;
        assert!(!bad.integrity_check());
    }

    #[test]
    fn data_connections_need_traffic_qos_and_one_direction() {
        let ci = ConnectionIdentifier::new(
            1,
            2,
            2,
            ConnectionType::Data,
            Direction::Uplink,
            QosCategory::BestEffort,
        );
        assert!(ci.integrity_check());

        let mut bad = ci.clone();
        bad.direction = Direction::Bidirectional;
        assert!(!bad.integrity_check());

        let mut bad = ci;
        bad.qos = QosCategory::Signaling;
        assert!(!bad.integrity_check());
    }

    #[test]
    fn identity_is_base_station_and_cid() {
        let a = ConnectionIdentifier::with_cid(
            1,
            7,
            2,
            2,
            ConnectionType::Basic,
            Direction::Bidirectional,
            QosCategory::Signaling,
        );
        let mut b = a.clone();
        b.subscriber_station = 9;
        b.connection_type = ConnectionType::PrimaryManagement;
        assert_eq!(a, b);

        let mut c = a.clone();
        c.cid = 8;
        assert_ne!(a, c);
        assert!(a < c);
    }
}
