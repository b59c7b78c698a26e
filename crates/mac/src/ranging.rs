//! Initial ranging control plane.
//!
//! The subscriber side sends an RNG_REQ over the contention phase and
//! waits a configurable number of frames for the RNG_RSP, retrying
//! with a growing back-off window. The base station side answers an
//! RNG_REQ by registering the ranging, basic and primary management
//! connections and returning their CIDs in the RNG_RSP.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::info;
use rand::Rng;

use airlink_core::{
    ConnectionIdentifier, ConnectionType, Direction, QosCategory, StationId,
};

use crate::classifier::ManagerHandle;
use crate::config::RangingConfig;
use crate::frame::collector::CompoundCollector;
use crate::frame::contention::ContentionCollector;
use crate::frame::timing::NewFrameObserver;
use crate::pdu::{ManagementMessage, Pdu};
use crate::scheduler::Scheduler;

pub struct RangingBs {
    name: String,
    station_id: StationId,
    manager: ManagerHandle,
    dl_scheduler: Weak<RefCell<Scheduler>>,
    queue: VecDeque<Pdu>,
    responses_sent: u32,
}

impl RangingBs {
    pub fn new(
        name: impl Into<String>,
        station_id: StationId,
        manager: ManagerHandle,
        dl_scheduler: Weak<RefCell<Scheduler>>,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            name: name.into(),
            station_id,
            manager,
            dl_scheduler,
            queue: VecDeque::new(),
            responses_sent: 0,
        }))
    }

    pub fn responses_sent(&self) -> u32 {
        self.responses_sent
    }

    /// Entry point for management traffic routed to this handler.
    pub fn handle(&mut self, message: &ManagementMessage) {
        info!("{}: receiving management message {}", self.name, message.kind());
        match message {
            ManagementMessage::RngReq {
                transaction_id,
                base_station,
                subscriber_station,
            } => self.on_rng_req(*transaction_id, *base_station, *subscriber_station),
            _ => panic!("{}: management message type is unknown here", self.name),
        }
    }

    fn on_rng_req(
        &mut self,
        transaction_id: u16,
        base_station: StationId,
        subscriber_station: StationId,
    ) {
        assert_eq!(
            base_station, self.station_id,
            "{}: ranging request for the wrong base station",
            self.name
        );

        // idempotent under concurrent ranging attempts
        self.manager
            .borrow_mut()
            .append_connection(ConnectionIdentifier::with_cid(
                base_station,
                0,
                0,
                0,
                ConnectionType::InitialRanging,
                Direction::Bidirectional,
                QosCategory::Signaling,
            ));

        // a retried request after a lost response reuses the
        // connections of the first attempt
        let existing_basic = self.manager.borrow().special_connection(
            ConnectionType::Basic,
            base_station,
            subscriber_station,
        );
        let basic = match existing_basic {
            Some(ci) => ci,
            None => self
                .manager
                .borrow_mut()
                .append_connection(ConnectionIdentifier::new(
                    base_station,
                    subscriber_station,
                    subscriber_station,
                    ConnectionType::Basic,
                    Direction::Bidirectional,
                    QosCategory::Signaling,
                )),
        };
        let existing_primary = self.manager.borrow().special_connection(
            ConnectionType::PrimaryManagement,
            base_station,
            subscriber_station,
        );
        let primary = match existing_primary {
            Some(ci) => ci,
            None => self
                .manager
                .borrow_mut()
                .append_connection(ConnectionIdentifier::new(
                    base_station,
                    subscriber_station,
                    subscriber_station,
                    ConnectionType::PrimaryManagement,
                    Direction::Bidirectional,
                    QosCategory::Signaling,
                )),
        };

        let mut response = Pdu::management(ManagementMessage::RngRsp {
            transaction_id,
            base_station,
            subscriber_station,
            basic_cid: basic.cid,
            primary_cid: primary.cid,
        });
        response.set_cid(0);

        self.queue.push_back(response);
        self.wakeup();
    }

    /// Flush queued responses into the downlink scheduler. Responses
    /// whose ranging connection disappeared are out of date and
    /// dropped.
    pub fn wakeup(&mut self) {
        let scheduler = match self.dl_scheduler.upgrade() {
            Some(scheduler) => scheduler,
            None => return,
        };

        let mut keep = VecDeque::new();
        while let Some(pdu) = self.queue.pop_front() {
            let cid = pdu.cid().expect("ranging response without CID");
            if self.manager.borrow().connection_with_id(cid).is_none() {
                continue;
            }
            if scheduler.borrow().is_accepting(&pdu) {
                info!("{}: sending management message RNG_RSP", self.name);
                scheduler.borrow_mut().schedule(pdu);
                self.responses_sent += 1;
            } else {
                keep.push_back(pdu);
            }
        }
        self.queue = keep;
    }
}

pub struct RangingSs {
    name: String,
    station_id: StationId,
    manager: ManagerHandle,
    contention: Weak<RefCell<ContentionCollector>>,
    config: RangingConfig,
    queue: VecDeque<Pdu>,
    /// Copy of the pending request, kept for retransmissions.
    rng_pdu: Option<Pdu>,
    active_transaction: u16,
    highest_transaction: u16,
    /// Frames left to wait for the RNG_RSP; negative while idle.
    remain_timer: i64,
    remain_retries: i64,
    in_progress: bool,
    result: Option<bool>,
}

impl RangingSs {
    pub fn new(
        name: impl Into<String>,
        station_id: StationId,
        manager: ManagerHandle,
        contention: Weak<RefCell<ContentionCollector>>,
        config: RangingConfig,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            name: name.into(),
            station_id,
            manager,
            contention,
            config,
            queue: VecDeque::new(),
            rng_pdu: None,
            active_transaction: 0,
            highest_transaction: 0,
            remain_timer: -1,
            remain_retries: -1,
            in_progress: false,
            result: None,
        }))
    }

    /// Outcome of the last ranging attempt, once it completed.
    pub fn result(&self) -> Option<bool> {
        self.result
    }

    /// Begin ranging towards `base_station`.
    pub fn start(&mut self, base_station: StationId) {
        if self.in_progress {
            info!("{}: ranging is already in use", self.name);
            return;
        }
        info!("{}: start ranging towards station {}", self.name, base_station);
        self.in_progress = true;
        self.result = None;

        // register the ranging connection so the contention path can
        // classify towards the right base station
        self.manager
            .borrow_mut()
            .append_connection(ConnectionIdentifier::with_cid(
                base_station,
                0,
                self.station_id,
                self.station_id,
                ConnectionType::InitialRanging,
                Direction::Bidirectional,
                QosCategory::Signaling,
            ));

        if self.highest_transaction == u16::MAX {
            self.highest_transaction = 1;
        } else {
            self.highest_transaction += 1;
        }
        self.active_transaction = self.highest_transaction;

        let mut request = Pdu::management(ManagementMessage::RngReq {
            transaction_id: self.active_transaction,
            base_station,
            subscriber_station: self.station_id,
        });
        request.set_cid(0);

        self.send_contention_access(request);
    }

    /// Entry point for management traffic routed to this handler.
    pub fn handle(&mut self, message: &ManagementMessage) {
        info!("{}: receiving management message {}", self.name, message.kind());
        match message {
            ManagementMessage::RngRsp {
                transaction_id,
                base_station,
                subscriber_station,
                basic_cid,
                primary_cid,
            } => self.on_rng_rsp(
                *transaction_id,
                *base_station,
                *subscriber_station,
                *basic_cid,
                *primary_cid,
            ),
            _ => panic!("{}: management message type is unknown here", self.name),
        }
    }

    fn send_contention_access(&mut self, pdu: Pdu) {
        if self.remain_retries < 0 {
            // first try
            self.remain_retries = self.config.number_of_retries as i64 + 1;
        }
        self.remain_retries -= 1;

        self.rng_pdu = Some(pdu.clone());

        let consumed = self.config.number_of_retries as i64 - self.remain_retries + 1;
        let window = (self.config.bo_window_size_min as i64 * consumed)
            .min(self.config.bo_window_size_max as i64) as u32;
        let back_off = rand::rng().random_range(0..window.max(1));
        info!(
            "{}: set back-off to {} (window size {})",
            self.name, back_off, window
        );
        if let Some(contention) = self.contention.upgrade() {
            contention.borrow_mut().set_back_off(back_off);
        }

        self.queue.push_back(pdu);
        self.wakeup();
    }

    /// Flush the pending request into the contention collector once
    /// it accepts. Arms the response timer when the request actually
    /// leaves.
    pub fn wakeup(&mut self) {
        let contention = match self.contention.upgrade() {
            Some(contention) => contention,
            None => return,
        };

        let mut keep = VecDeque::new();
        while let Some(pdu) = self.queue.pop_front() {
            let cid = pdu.cid().expect("ranging request without CID");
            if self.manager.borrow().connection_with_id(cid).is_none() {
                continue;
            }
            if contention.borrow().is_accepting(&pdu) {
                info!("{}: sending management message RNG_REQ", self.name);
                self.remain_timer = self.config.timer_waiting_for_rsp as i64;
                contention.borrow_mut().send_data(pdu);
            } else {
                keep.push_back(pdu);
            }
        }
        self.queue = keep;
    }

    fn on_rng_rsp(
        &mut self,
        transaction_id: u16,
        base_station: StationId,
        subscriber_station: StationId,
        basic_cid: airlink_core::Cid,
        primary_cid: airlink_core::Cid,
    ) {
        let ranging_ci = match self.manager.borrow().connection_with_id(0) {
            Some(ci) => ci,
            None => return,
        };

        // is this message for us?
        if subscriber_station != self.station_id {
            return;
        }
        if self.remain_timer <= 0 {
            info!("{}: timer waiting for RNG_RSP has run out", self.name);
            return;
        }
        if transaction_id != self.active_transaction {
            return;
        }
        assert_eq!(
            base_station, ranging_ci.base_station,
            "{}: RNG_RSP from the wrong base station",
            self.name
        );

        self.remain_timer = -1;
        self.remain_retries = -1;

        // mirror the connections the base station registered
        self.manager
            .borrow_mut()
            .append_connection(ConnectionIdentifier::with_cid(
                base_station,
                basic_cid,
                subscriber_station,
                subscriber_station,
                ConnectionType::Basic,
                Direction::Bidirectional,
                QosCategory::Signaling,
            ));
        self.manager
            .borrow_mut()
            .append_connection(ConnectionIdentifier::with_cid(
                base_station,
                primary_cid,
                subscriber_station,
                subscriber_station,
                ConnectionType::PrimaryManagement,
                Direction::Bidirectional,
                QosCategory::Signaling,
            ));

        self.finish(true);
    }

    fn finish(&mut self, result: bool) {
        info!("{}: stop ranging with result {}", self.name, result);
        self.in_progress = false;
        self.result = Some(result);
    }
}

impl NewFrameObserver for RangingSs {
    /// Per-frame countdown of the response timer; a run-out either
    /// retries over contention access or reports failure.
    fn new_frame(&mut self) {
        if self.remain_timer == 0 {
            info!("{}: timer waiting for RNG_RSP ran out", self.name);
            self.remain_timer = -1;

            if self.remain_retries > 0 {
                let pdu = self
                    .rng_pdu
                    .clone()
                    .expect("retry without a pending request");
                self.send_contention_access(pdu);
            } else {
                self.remain_retries = -1;
                self.finish(false);
            }
        } else if self.remain_timer > 0 {
            self.remain_timer -= 1;
        }
    }
}
