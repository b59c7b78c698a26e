//! The per-station connection registry.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::info;

use crate::connection::ConnectionIdentifier;
use crate::types::{
    Cid, ConnectionType, Direction, QosCategory, StationId, StationType, RANGING_CID,
    UNASSIGNED_CID,
};
use crate::CoreError;

/// Monotonic CID source rooted at the cell's base station.
///
/// Every connection manager in a cell holds a clone of the base
/// station's allocator, so CIDs are unique cell-wide even though each
/// station keeps its own registry.
#[derive(Debug)]
pub struct CidAllocator {
    next: Cell<Cid>,
}

impl CidAllocator {
    pub fn new() -> Rc<Self> {
        // CID 0 is reserved for ranging
        Rc::new(Self { next: Cell::new(1) })
    }

    pub fn allocate(&self) -> Cid {
        let cid = self.next.get();
        self.next.set(cid + 1);
        cid
    }
}

/// Receives a copy of every connection the manager deletes, before the
/// entry is erased, so per-connection state elsewhere can be flushed.
pub trait ConnectionDeletedObserver {
    fn connection_deleted(&mut self, ci: &ConnectionIdentifier);
}

type ObserverHandle = Rc<RefCell<dyn ConnectionDeletedObserver>>;

/// Registry of all connections terminating at one station.
///
/// The manager is the single writer of its collection; collaborators
/// read through it within the same event-processing step. Anything
/// holding a `ConnectionIdentifier` copy across a frame boundary must
/// re-validate it via [`ConnectionManager::connection_with_id`].
pub struct ConnectionManager {
    name: String,
    station_type: StationType,
    connections: Vec<ConnectionIdentifier>,
    cid_allocator: Rc<CidAllocator>,
    observers: Vec<(u64, ObserverHandle)>,
    next_observer_token: u64,
}

impl ConnectionManager {
    pub fn new(
        name: impl Into<String>,
        station_type: StationType,
        cid_allocator: Rc<CidAllocator>,
    ) -> Self {
        Self {
            name: name.into(),
            station_type,
            connections: Vec::new(),
            cid_allocator,
            observers: Vec::new(),
            next_observer_token: 0,
        }
    }

    /// The cell-wide allocator, for handing to further stations of the
    /// same cell.
    pub fn cid_allocator(&self) -> Rc<CidAllocator> {
        self.cid_allocator.clone()
    }

    pub fn station_type(&self) -> StationType {
        self.station_type
    }

    /// Register a new connection and return it with its assigned CID.
    ///
    /// Ranging connections always get CID 0 and registration is
    /// idempotent: a second ranging append returns the existing entry
    /// unchanged. Appending a connection that fails the integrity
    /// check, or a second connection for an already covered
    /// `(type, direction, base, subscriber)` tuple, halts the
    /// simulation.
    pub fn append_connection(&mut self, connection: ConnectionIdentifier) -> ConnectionIdentifier {
        assert!(
            connection.integrity_check(),
            "{}: new connection does not pass the integrity check: {}",
            self.name,
            connection
        );

        let mut connection = connection;

        if connection.connection_type == ConnectionType::InitialRanging {
            if let Some(existing) = self.connection_with_id(RANGING_CID) {
                info!(
                    "{}: ranging connection (CID 0) already exists",
                    self.name
                );
                return existing;
            }
            connection.cid = RANGING_CID;
        } else if connection.cid == UNASSIGNED_CID {
            connection.cid = self.cid_allocator.allocate();
        }

        assert!(
            !self.connections.iter().any(|ci| {
                ci.connection_type == connection.connection_type
                    && ci.direction == connection.direction
                    && ci.base_station == connection.base_station
                    && ci.subscriber_station == connection.subscriber_station
            }),
            "{}: a connection for this station pair already exists: {}",
            self.name,
            connection
        );
        assert!(
            connection.cid >= 0,
            "{}: CID of connection to register is not valid",
            self.name
        );

        info!("{}: register {}", self.name, connection);
        self.connections.push(connection.clone());
        connection
    }

    /// Delete the single connection with the given CID. Zero or more
    /// than one match violates the uniqueness invariant and halts the
    /// simulation.
    pub fn delete_ci(&mut self, cid: Cid) {
        let mut deleted = 0;
        let mut i = 0;
        while i < self.connections.len() {
            if self.connections[i].cid == cid {
                let ci = self.connections[i].clone();
                info!("{}: delete {}", self.name, ci);
                self.notify_deleted(&ci);
                self.connections.remove(i);
                deleted += 1;
            } else {
                i += 1;
            }
        }

        assert!(deleted > 0, "{}: no connection found for CID {}", self.name, cid);
        assert!(
            deleted <= 1,
            "{}: more than one connection deleted for CID {}",
            self.name,
            cid
        );
    }

    pub fn delete_connections_for_bs(&mut self, base_station: StationId) {
        self.delete_where(|ci| ci.base_station == base_station);
    }

    pub fn delete_connections_for_ss(&mut self, subscriber_station: StationId) {
        self.delete_where(|ci| ci.subscriber_station == subscriber_station);
    }

    pub fn delete_all_connections(&mut self) {
        self.delete_where(|_| true);
    }

    fn delete_where(&mut self, predicate: impl Fn(&ConnectionIdentifier) -> bool) {
        let mut i = 0;
        while i < self.connections.len() {
            if predicate(&self.connections[i]) {
                let ci = self.connections[i].clone();
                info!("{}: delete {}", self.name, ci);
                self.notify_deleted(&ci);
                self.connections.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Replace the stored fields of the connection matching
    /// `connection`'s primary key `(base_station, cid)`.
    pub fn change_connection(&mut self, connection: ConnectionIdentifier) -> Result<(), CoreError> {
        let cid = connection.cid;
        match self.connections.iter_mut().find(|ci| **ci == connection) {
            Some(slot) => {
                info!("{}: change {}", self.name, connection);
                *slot = connection;
                Ok(())
            }
            None => Err(CoreError::CidNotFound(cid)),
        }
    }

    pub fn change_connections(
        &mut self,
        connections: Vec<ConnectionIdentifier>,
    ) -> Result<(), CoreError> {
        for connection in connections {
            self.change_connection(connection)?;
        }
        Ok(())
    }

    /// Find the connection with the given CID. Returns `None` if no
    /// such connection is registered; callers must check.
    pub fn connection_with_id(&self, cid: Cid) -> Option<ConnectionIdentifier> {
        self.connections.iter().find(|ci| ci.cid == cid).cloned()
    }

    pub fn all_connections(&self) -> Vec<ConnectionIdentifier> {
        self.connections.clone()
    }

    pub fn all_for_ss(&self, subscriber_station: StationId) -> Vec<ConnectionIdentifier> {
        self.collect(|ci| ci.subscriber_station == subscriber_station)
    }

    pub fn all_for_bs(&self, base_station: StationId) -> Vec<ConnectionIdentifier> {
        self.collect(|ci| ci.base_station == base_station)
    }

    pub fn all_basic_connections(&self) -> Vec<ConnectionIdentifier> {
        self.collect(|ci| ci.connection_type == ConnectionType::Basic)
    }

    pub fn all_data_connections(&self, direction: Direction) -> Vec<ConnectionIdentifier> {
        self.collect(|ci| {
            ci.direction == direction && ci.connection_type == ConnectionType::Data
        })
    }

    pub fn all_data_connections_with_qos(
        &self,
        direction: Direction,
        qos: QosCategory,
    ) -> Vec<ConnectionIdentifier> {
        self.collect(|ci| {
            ci.direction == direction
                && ci.connection_type == ConnectionType::Data
                && ci.qos == qos
        })
    }

    /// Outgoing data connections towards `to`, as seen from this
    /// station's role in the cell.
    pub fn outgoing_data_connections(
        &self,
        to: StationId,
        qos: QosCategory,
    ) -> Vec<ConnectionIdentifier> {
        let is_data = |ci: &ConnectionIdentifier| {
            ci.connection_type == ConnectionType::Data && ci.qos == qos
        };
        match self.station_type {
            StationType::BaseStation => self.collect(|ci| {
                is_data(ci) && ci.remote_station == to && ci.direction == Direction::Downlink
            }),
            StationType::SubscriberStation => self.collect(|ci| {
                is_data(ci) && ci.base_station == to && ci.direction == Direction::Uplink
            }),
            StationType::RelayStation => self.collect(|ci| {
                is_data(ci)
                    && ((ci.base_station == to && ci.direction == Direction::Uplink)
                        || (ci.subscriber_station == to && ci.direction == Direction::Downlink))
            }),
        }
    }

    /// Incoming data connections from `from`, as seen from this
    /// station's role in the cell.
    pub fn incoming_data_connections(
        &self,
        from: StationId,
        qos: QosCategory,
    ) -> Vec<ConnectionIdentifier> {
        let is_data = |ci: &ConnectionIdentifier| {
            ci.connection_type == ConnectionType::Data && ci.qos == qos
        };
        match self.station_type {
            StationType::BaseStation => self.collect(|ci| {
                is_data(ci) && ci.remote_station == from && ci.direction == Direction::Uplink
            }),
            StationType::SubscriberStation => self.collect(|ci| {
                is_data(ci) && ci.base_station == from && ci.direction == Direction::Downlink
            }),
            StationType::RelayStation => self.collect(|ci| {
                is_data(ci)
                    && ((ci.base_station == from && ci.direction == Direction::Downlink)
                        || (ci.subscriber_station == from && ci.direction == Direction::Uplink))
            }),
        }
    }

    /// All connections of any type leaving this station towards `to`.
    pub fn outgoing_connections(&self, to: StationId) -> Vec<ConnectionIdentifier> {
        match self.station_type {
            StationType::BaseStation => self.collect(|ci| {
                (ci.remote_station == to || ci.subscriber_station == to)
                    && ci.direction != Direction::Uplink
            }),
            StationType::SubscriberStation => self
                .collect(|ci| ci.base_station == to && ci.direction != Direction::Downlink),
            StationType::RelayStation => self.collect(|ci| {
                (ci.base_station == to && ci.direction.covers(Direction::Uplink))
                    || (ci.subscriber_station == to && ci.direction.covers(Direction::Downlink))
            }),
        }
    }

    /// All connections of any type arriving at this station from `from`.
    pub fn incoming_connections(&self, from: StationId) -> Vec<ConnectionIdentifier> {
        match self.station_type {
            StationType::BaseStation => self.collect(|ci| {
                (ci.remote_station == from || ci.subscriber_station == from)
                    && ci.direction != Direction::Downlink
            }),
            StationType::SubscriberStation => self
                .collect(|ci| ci.base_station == from && ci.direction != Direction::Uplink),
            StationType::RelayStation => self.collect(|ci| {
                (ci.base_station == from && ci.direction.covers(Direction::Downlink))
                    || (ci.subscriber_station == from && ci.direction.covers(Direction::Uplink))
            }),
        }
    }

    /// The connection of `connection_type` between the given base and
    /// subscriber station, if any.
    pub fn special_connection(
        &self,
        connection_type: ConnectionType,
        base_station: StationId,
        subscriber_station: StationId,
    ) -> Option<ConnectionIdentifier> {
        self.connections
            .iter()
            .find(|ci| {
                ci.connection_type == connection_type
                    && ci.base_station == base_station
                    && ci.subscriber_station == subscriber_station
            })
            .cloned()
    }

    /// The basic connection belonging to the same station pair as the
    /// connection with `cid`. Used to redirect management replies onto
    /// the basic connection.
    pub fn basic_connection_for_cid(&self, cid: Cid) -> Result<ConnectionIdentifier, CoreError> {
        let ci = self
            .connection_with_id(cid)
            .ok_or(CoreError::CidNotFound(cid))?;
        if ci.connection_type == ConnectionType::Basic {
            return Ok(ci);
        }
        self.connections
            .iter()
            .find(|other| other.same_peer(&ci) && other.connection_type == ConnectionType::Basic)
            .cloned()
            .ok_or(CoreError::CidNotFound(cid))
    }

    /// The basic connection owned by the given subscriber station.
    pub fn basic_connection_for_station(
        &self,
        subscriber_station: StationId,
    ) -> Result<ConnectionIdentifier, CoreError> {
        self.connections
            .iter()
            .find(|ci| {
                ci.subscriber_station == subscriber_station
                    && ci.connection_type == ConnectionType::Basic
            })
            .cloned()
            .ok_or(CoreError::NoBasicConnection(subscriber_station))
    }

    /// The single primary management connection touching `station`.
    /// More than one match is a structural invariant violation.
    pub fn primary_connection_for(&self, station: StationId) -> Option<ConnectionIdentifier> {
        let matches: Vec<_> = self
            .connections
            .iter()
            .filter(|ci| {
                ci.connection_type == ConnectionType::PrimaryManagement
                    && (ci.subscriber_station == station || ci.base_station == station)
            })
            .collect();

        assert!(
            matches.len() <= 1,
            "{}: only one primary management connection may exist per station",
            self.name
        );
        matches.first().map(|ci| (*ci).clone())
    }

    /// Count down the not-listening window on every connection, once
    /// per frame.
    pub fn decrease_not_listening(&mut self) {
        for ci in &mut self.connections {
            if ci.not_listening > 0 {
                info!("{}: decrease not-listening {}", self.name, ci);
                ci.not_listening -= 1;
            }
        }
    }

    /// Subscribe to deletion notifications. Returns a token for
    /// [`ConnectionManager::unsubscribe_deleted`].
    pub fn subscribe_deleted(&mut self, observer: ObserverHandle) -> u64 {
        let token = self.next_observer_token;
        self.next_observer_token += 1;
        self.observers.push((token, observer));
        token
    }

    pub fn unsubscribe_deleted(&mut self, token: u64) {
        self.observers.retain(|(t, _)| *t != token);
    }

    fn notify_deleted(&self, ci: &ConnectionIdentifier) {
        for (_, observer) in &self.observers {
            observer.borrow_mut().connection_deleted(ci);
        }
    }

    fn collect(
        &self,
        predicate: impl Fn(&ConnectionIdentifier) -> bool,
    ) -> Vec<ConnectionIdentifier> {
        self.connections
            .iter()
            .filter(|ci| predicate(ci))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_ci(bs: StationId, ss: StationId) -> ConnectionIdentifier {
        ConnectionIdentifier::new(
            bs,
            ss,
            ss,
            ConnectionType::Basic,
            Direction::Bidirectional,
            QosCategory::Signaling,
        )
    }

    fn data_ci(bs: StationId, ss: StationId, direction: Direction) -> ConnectionIdentifier {
        ConnectionIdentifier::new(
            bs,
            ss,
            ss,
            ConnectionType::Data,
            direction,
            QosCategory::BestEffort,
        )
    }

    fn bs_manager() -> ConnectionManager {
        ConnectionManager::new("BS1", StationType::BaseStation, CidAllocator::new())
    }

    #[test]
    fn assigned_cids_are_unique_within_a_cell() {
        let mut manager = bs_manager();
        let mut seen = std::collections::HashSet::new();
        for ss in 2..12 {
            let ci = manager.append_connection(basic_ci(1, ss));
            assert!(seen.insert(ci.cid), "duplicate CID {}", ci.cid);
        }
    }

    #[test]
    #[should_panic(expected = "integrity check")]
    fn append_rejects_invalid_connections() {
        let mut manager = bs_manager();
        let mut bad = basic_ci(1, 2);
        bad.direction = Direction::Uplink;
        manager.append_connection(bad);
    }

    #[test]
    fn ranging_append_is_idempotent() {
        let mut manager = bs_manager();
        let ranging = ConnectionIdentifier::new(
            1,
            0,
            0,
            ConnectionType::InitialRanging,
            Direction::Bidirectional,
            QosCategory::Signaling,
        );
        let first = manager.append_connection(ranging.clone());
        let second = manager.append_connection(ranging);

        assert_eq!(first.cid, 0);
        assert_eq!(second.cid, 0);
        assert_eq!(
            manager
                .all_connections()
                .iter()
                .filter(|ci| ci.connection_type == ConnectionType::InitialRanging)
                .count(),
            1
        );
    }

    #[test]
    fn cids_delegate_to_the_cell_allocator() {
        let mut bs = bs_manager();
        let mut ss = ConnectionManager::new(
            "SS2",
            StationType::SubscriberStation,
            bs.cid_allocator(),
        );

        let a = bs.append_connection(basic_ci(1, 2));
        let b = ss.append_connection(data_ci(1, 2, Direction::Uplink));
        let c = bs.append_connection(data_ci(1, 3, Direction::Downlink));

        assert_eq!((a.cid, b.cid, c.cid), (1, 2, 3));
    }

    struct Recorder {
        deleted: Vec<ConnectionIdentifier>,
    }

    impl ConnectionDeletedObserver for Recorder {
        fn connection_deleted(&mut self, ci: &ConnectionIdentifier) {
            self.deleted.push(ci.clone());
        }
    }

    #[test]
    fn deletion_notifies_each_observer_exactly_once() {
        let mut manager = bs_manager();
        let recorder = Rc::new(RefCell::new(Recorder { deleted: Vec::new() }));
        manager.subscribe_deleted(recorder.clone());

        let ci = manager.append_connection(basic_ci(1, 2));
        manager.delete_ci(ci.cid);

        assert!(manager.connection_with_id(ci.cid).is_none());
        let deleted = &recorder.borrow().deleted;
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].cid, ci.cid);
        assert_eq!(deleted[0].subscriber_station, 2);
    }

    #[test]
    #[should_panic(expected = "no connection found")]
    fn deleting_an_unknown_cid_is_fatal() {
        let mut manager = bs_manager();
        manager.delete_ci(42);
    }

    #[test]
    fn delete_for_ss_removes_all_connections_of_that_station() {
        let mut manager = bs_manager();
        manager.append_connection(basic_ci(1, 2));
        manager.append_connection(data_ci(1, 2, Direction::Downlink));
        let kept = manager.append_connection(basic_ci(1, 3));

        manager.delete_connections_for_ss(2);

        assert!(manager.all_for_ss(2).is_empty());
        assert_eq!(manager.all_connections(), vec![kept]);
    }

    #[test]
    fn change_connection_preserves_the_primary_key() {
        let mut manager = bs_manager();
        let mut ci = manager.append_connection(data_ci(1, 2, Direction::Downlink));
        ci.not_listening = 4;
        manager.change_connection(ci.clone()).unwrap();

        let stored = manager.connection_with_id(ci.cid).unwrap();
        assert_eq!(stored.not_listening, 4);
    }

    #[test]
    fn change_of_an_unknown_connection_fails() {
        let mut manager = bs_manager();
        let ci = ConnectionIdentifier::with_cid(
            1,
            9,
            2,
            2,
            ConnectionType::Basic,
            Direction::Bidirectional,
            QosCategory::Signaling,
        );
        assert!(matches!(
            manager.change_connection(ci),
            Err(CoreError::CidNotFound(9))
        ));
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn duplicate_station_pair_connections_are_rejected() {
        let mut manager = bs_manager();
        manager.append_connection(basic_ci(1, 2));
        manager.append_connection(basic_ci(1, 2));
    }

    #[test]
    fn primary_connection_lookup() {
        let mut manager = bs_manager();
        assert!(manager.primary_connection_for(2).is_none());

        let primary = manager.append_connection(ConnectionIdentifier::new(
            1,
            2,
            2,
            ConnectionType::PrimaryManagement,
            Direction::Bidirectional,
            QosCategory::Signaling,
        ));
        let found = manager.primary_connection_for(2).unwrap();
        assert_eq!(found.cid, primary.cid);
    }

    #[test]
    fn basic_connection_resolves_through_the_station_pair() {
        let mut manager = bs_manager();
        let basic = manager.append_connection(basic_ci(1, 2));
        let data = manager.append_connection(data_ci(1, 2, Direction::Downlink));

        let resolved = manager.basic_connection_for_cid(data.cid).unwrap();
        assert_eq!(resolved.cid, basic.cid);

        let resolved = manager.basic_connection_for_station(2).unwrap();
        assert_eq!(resolved.cid, basic.cid);
        assert!(manager.basic_connection_for_station(7).is_err());
    }

    #[test]
    fn not_listening_counts_down_to_zero() {
        let mut manager = bs_manager();
        let mut ci = manager.append_connection(basic_ci(1, 2));
        ci.not_listening = 2;
        manager.change_connection(ci.clone()).unwrap();

        manager.decrease_not_listening();
        manager.decrease_not_listening();
        manager.decrease_not_listening();

        assert_eq!(manager.connection_with_id(ci.cid).unwrap().not_listening, 0);
    }

    #[test]
    fn outgoing_data_lookup_depends_on_station_role() {
        let mut bs = bs_manager();
        bs.append_connection(data_ci(1, 2, Direction::Downlink));
        bs.append_connection(data_ci(1, 2, Direction::Uplink));

        let outgoing = bs.outgoing_data_connections(2, QosCategory::BestEffort);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].direction, Direction::Downlink);

        let mut ss = ConnectionManager::new(
            "SS2",
            StationType::SubscriberStation,
            bs.cid_allocator(),
        );
        ss.append_connection(data_ci(1, 2, Direction::Uplink));
        let outgoing = ss.outgoing_data_connections(1, QosCategory::BestEffort);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].direction, Direction::Uplink);
    }
}
