//! Maps PDUs onto connections.
//!
//! Outgoing PDUs are stamped with the CID of the single connection
//! matching their destination; incoming PDUs are resolved through the
//! stamped CID. A CID that no longer resolves marks a stale PDU that
//! is dropped silently, since connections are torn down while traffic
//! is still in flight.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use airlink_core::{Cid, ConnectionIdentifier, ConnectionManager, Direction, StationType};

use crate::pdu::Pdu;

pub type ManagerHandle = Rc<RefCell<ConnectionManager>>;

pub struct Classifier {
    name: String,
    station_type: StationType,
    manager: ManagerHandle,
}

impl Classifier {
    pub fn new(name: impl Into<String>, station_type: StationType, manager: ManagerHandle) -> Self {
        Self {
            name: name.into(),
            station_type,
            manager,
        }
    }

    /// Resolve the outgoing connection for a PDU without stamping it.
    ///
    /// Subscriber and relay stations that have no connection towards
    /// the destination yet fall back to any uplink data connection;
    /// this bootstraps the connection-setup handshake. More than one
    /// remaining candidate is a configuration error.
    pub fn resolve_outgoing(&self, pdu: &Pdu) -> Option<Cid> {
        let upper = pdu
            .upper
            .as_ref()
            .expect("outgoing PDU without upper-layer command");
        let manager = self.manager.borrow();

        let mut candidates = manager.outgoing_data_connections(upper.dest, upper.qos);
        if candidates.is_empty()
            && matches!(
                self.station_type,
                StationType::SubscriberStation | StationType::RelayStation
            )
        {
            candidates = manager.all_data_connections_with_qos(Direction::Uplink, upper.qos);
        }

        if candidates.is_empty() {
            return None;
        }
        assert!(
            candidates.len() == 1,
            "{}: only one connection per target station is allowed",
            self.name
        );
        Some(candidates[0].cid)
    }

    /// Outgoing path: stamp the PDU with its connection's CID.
    /// Failing to resolve any connection here is fatal; callers gate
    /// on [`Classifier::is_accepting`] first.
    pub fn classify_outgoing(&self, pdu: &mut Pdu) -> Cid {
        let cid = self
            .resolve_outgoing(pdu)
            .unwrap_or_else(|| panic!("{}: no connection found for destination", self.name));

        let dest = pdu.upper.as_ref().map(|upper| upper.dest);
        info!(
            "{}: classify outgoing compound, dest {:?} to CID {}",
            self.name, dest, cid
        );
        pdu.set_cid(cid);
        cid
    }

    /// Incoming path: resolve the stamped CID. `None` means the
    /// connection is gone and the PDU must be discarded without
    /// delivery.
    pub fn classify_incoming(&self, pdu: &Pdu) -> Option<ConnectionIdentifier> {
        let cid = pdu
            .cid()
            .expect("incoming PDU without classifier command");

        match self.manager.borrow().connection_with_id(cid) {
            Some(ci) => {
                debug!("{}: classify incoming compound, CID {}", self.name, cid);
                Some(ci)
            }
            None => {
                debug!(
                    "{}: dropping stale compound, no connection for CID {}",
                    self.name, cid
                );
                None
            }
        }
    }

    /// Back-pressure predicate: a PDU can be sent only if an outgoing
    /// connection resolves and the next lower stage accepts.
    pub fn is_accepting(&self, pdu: &Pdu, lower_accepting: bool) -> bool {
        self.resolve_outgoing(pdu).is_some() && lower_accepting
    }
}
