//! Synthetic bandwidth-request generation for the uplink master.
//!
//! Real BW-REQ signalling is shortcut: at every uplink scheduling
//! pass the generator inspects the peer stations' backlog directly
//! and injects one fake PDU per queued compound, so the master can
//! allocate uplink resources without the request/grant message
//! exchange.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{info, trace};

use airlink_core::StationId;

use crate::classifier::ManagerHandle;
use crate::frame::collector::Receptor;
use crate::pdu::Pdu;
use crate::scheduler::Scheduler;
use crate::station::StationRegistry;

pub struct PseudoBwRequestGenerator {
    name: String,
    manager: ManagerHandle,
    stations: Rc<StationRegistry>,
    my_id: StationId,
    /// Estimated size of one queued compound, including IP and MAC
    /// overhead.
    packet_size_bits: usize,
    scheduler: Weak<RefCell<Scheduler>>,
}

impl PseudoBwRequestGenerator {
    pub fn new(
        name: impl Into<String>,
        manager: ManagerHandle,
        stations: Rc<StationRegistry>,
        my_id: StationId,
        packet_size_bits: usize,
        scheduler: Weak<RefCell<Scheduler>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            manager,
            stations,
            my_id,
            packet_size_bits,
            scheduler,
        })
    }

    /// The receptor handed to the uplink master scheduler.
    pub fn receptor(self: &Rc<Self>) -> Receptor {
        let this = self.clone();
        Rc::new(move || this.wakeup())
    }

    pub fn wakeup(&self) {
        let scheduler = match self.scheduler.upgrade() {
            Some(scheduler) => scheduler,
            None => return,
        };

        // the synthetic backlog is regenerated every frame
        scheduler.borrow_mut().reset_all_queues();

        let basics = self.manager.borrow().all_basic_connections();
        for ci in basics {
            if ci.subscriber_station == self.my_id {
                continue;
            }
            // no bandwidth for stations that are not listening
            if ci.not_listening > 0 {
                continue;
            }

            let peer = match self.stations.get(ci.subscriber_station) {
                Some(peer) => peer,
                None => continue,
            };

            let incoming = self
                .manager
                .borrow()
                .incoming_connections(ci.subscriber_station);
            let queued = peer.number_of_queued_pdus(&incoming);
            if queued == 0 {
                continue;
            }

            info!(
                "{}: generating {} fake PDUs for CID {}",
                self.name, queued, ci.cid
            );
            for _ in 0..queued {
                let mut pdu = Pdu::fake(self.packet_size_bits);
                pdu.set_cid(ci.cid);

                let mut scheduler = scheduler.borrow_mut();
                if scheduler.is_accepting(&pdu) {
                    scheduler.schedule(pdu);
                    trace!("{}: generated a fake PDU for CID {}", self.name, ci.cid);
                } else {
                    break;
                }
            }
        }
    }
}
