//! Per-station composition of the MAC components.
//!
//! A `Station` owns one connection manager, the classifier, the frame
//! timing control with its collectors, and the schedulers matching
//! its role in the cell. The station registry is the thin slice of
//! topology the MAC needs: resolving a station ID to its receive
//! entry point.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use log::info;

use airlink_core::{
    Cid, CidAllocator, ConnectionIdentifier, ConnectionManager, EventScheduler, QosCategory,
    StationId, StationType,
};

use crate::classifier::{Classifier, ManagerHandle};
use crate::config::MacConfig;
use crate::frame::collector::{Activation, CollectorHandle, CollectorMode, Receptor};
use crate::frame::contention::ContentionCollector;
use crate::frame::data::DataCollector;
use crate::frame::head::FrameHeadCollector;
use crate::frame::map::{DlMapCollector, UlMapCollector};
use crate::frame::timing::{ActivationEntry, NewFrameObserver, TimingControl};
use crate::pdu::{ManagementMessage, Pdu};
use crate::phy::PhyDataTransmission;
use crate::ranging::{RangingBs, RangingSs};
use crate::scheduler::{
    FcfsStrategy, MacRegistryProxy, PseudoBwRequestGenerator, Scheduler, SchedulerRole,
};
use crate::MacError;

/// Resolves station IDs to stations; the MAC-facing slice of the
/// topology management that lives outside this core.
#[derive(Default)]
pub struct StationRegistry {
    stations: RefCell<HashMap<StationId, Rc<Station>>>,
}

impl StationRegistry {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn register(&self, station: Rc<Station>) {
        self.stations.borrow_mut().insert(station.id(), station);
    }

    pub fn get(&self, id: StationId) -> Option<Rc<Station>> {
        self.stations.borrow().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Rc<Station>> {
        self.stations.borrow().values().cloned().collect()
    }
}

/// Decrements every connection's not-listening window once per frame.
struct NotListeningTick {
    manager: ManagerHandle,
}

impl NewFrameObserver for NotListeningTick {
    fn new_frame(&mut self) {
        self.manager.borrow_mut().decrease_not_listening();
    }
}

pub struct Station {
    id: StationId,
    name: String,
    station_type: StationType,
    config: MacConfig,
    manager: ManagerHandle,
    classifier: Classifier,
    timing: Rc<RefCell<TimingControl>>,
    frame_head: Rc<RefCell<FrameHeadCollector>>,
    dl_map: Rc<RefCell<DlMapCollector>>,
    ul_map: Rc<RefCell<UlMapCollector>>,
    contention: Rc<RefCell<ContentionCollector>>,
    dl_data: Rc<RefCell<DataCollector>>,
    ul_data: Rc<RefCell<DataCollector>>,
    /// Base station: the downlink master.
    dl_scheduler: Option<Rc<RefCell<Scheduler>>>,
    /// Base station: the uplink master; subscriber: the uplink slave.
    ul_scheduler: Option<Rc<RefCell<Scheduler>>>,
    ranging_bs: Option<Rc<RefCell<RangingBs>>>,
    ranging_ss: Option<Rc<RefCell<RangingSs>>>,
    /// Classified upper-layer PDUs waiting to enter a scheduler.
    outbound: RefCell<VecDeque<Pdu>>,
    /// Data PDUs delivered to the upper layer.
    received: RefCell<Vec<Pdu>>,
}

impl Station {
    pub fn new_base_station(
        id: StationId,
        name: impl Into<String>,
        kernel: Rc<EventScheduler>,
        phy: Rc<dyn PhyDataTransmission>,
        stations: Rc<StationRegistry>,
        config: MacConfig,
    ) -> Rc<Station> {
        Self::build(
            id,
            name.into(),
            StationType::BaseStation,
            kernel,
            phy,
            stations,
            CidAllocator::new(),
            config,
        )
    }

    pub fn new_subscriber_station(
        id: StationId,
        name: impl Into<String>,
        kernel: Rc<EventScheduler>,
        phy: Rc<dyn PhyDataTransmission>,
        stations: Rc<StationRegistry>,
        cell_allocator: Rc<CidAllocator>,
        config: MacConfig,
    ) -> Rc<Station> {
        Self::build(
            id,
            name.into(),
            StationType::SubscriberStation,
            kernel,
            phy,
            stations,
            cell_allocator,
            config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: StationId,
        name: String,
        station_type: StationType,
        kernel: Rc<EventScheduler>,
        phy: Rc<dyn PhyDataTransmission>,
        stations: Rc<StationRegistry>,
        cell_allocator: Rc<CidAllocator>,
        config: MacConfig,
    ) -> Rc<Station> {
        let manager: ManagerHandle = Rc::new(RefCell::new(ConnectionManager::new(
            name.clone(),
            station_type,
            cell_allocator,
        )));
        let classifier = Classifier::new(name.clone(), station_type, manager.clone());
        let timing = TimingControl::new(format!("{}.timing", name), kernel.clone(), &config.phy);
        let timing_weak = Rc::downgrade(&timing);

        let registry_proxy = MacRegistryProxy::new(
            manager.clone(),
            stations.clone(),
            id,
            config.phy.default_phy_mode,
        );

        let frame_head = FrameHeadCollector::new(
            format!("{}.frameHead", name),
            id,
            phy.clone(),
            kernel.clone(),
            timing_weak.clone(),
            config.phy.default_phy_mode,
            config.phy.symbol_duration,
        );
        let dl_map = DlMapCollector::new(
            format!("{}.dlMap", name),
            id,
            manager.clone(),
            phy.clone(),
            kernel.clone(),
            timing_weak.clone(),
            config.phy.default_phy_mode,
            config.phy.symbol_duration,
        );
        let ul_map = UlMapCollector::new(
            format!("{}.ulMap", name),
            id,
            manager.clone(),
            phy.clone(),
            kernel.clone(),
            timing_weak.clone(),
            config.phy.default_phy_mode,
            config.phy.symbol_duration,
        );
        let contention = ContentionCollector::new(
            format!("{}.contention", name),
            id,
            station_type,
            manager.clone(),
            phy.clone(),
            kernel.clone(),
            timing_weak.clone(),
            config.contention.clone(),
            &config.phy,
        );

        let station = Rc::new_cyclic(|weak: &Weak<Station>| {
            let drain: Receptor = {
                let weak = weak.clone();
                Rc::new(move || {
                    if let Some(station) = weak.upgrade() {
                        station.drain_outbound();
                    }
                })
            };

            let mut dl_scheduler = None;
            let mut ul_scheduler = None;
            let mut ranging_bs = None;
            let mut ranging_ss = None;

            let (dl_data, ul_data) = match station_type {
                StationType::BaseStation | StationType::RelayStation => {
                    let dl_master = Scheduler::new(
                        format!("{}.dlScheduler", name),
                        SchedulerRole::DownlinkMaster,
                        config.scheduler.clone(),
                        &config.phy,
                        Box::new(FcfsStrategy::new()),
                        registry_proxy.clone(),
                        kernel.clone(),
                    );
                    let ul_master = Scheduler::new(
                        format!("{}.ulScheduler", name),
                        SchedulerRole::UplinkMaster,
                        config.scheduler.clone(),
                        &config.phy,
                        Box::new(FcfsStrategy::new()),
                        registry_proxy.clone(),
                        kernel.clone(),
                    );

                    dl_master.borrow_mut().add_receptor(drain.clone());
                    let generator = PseudoBwRequestGenerator::new(
                        format!("{}.bwReqGenerator", name),
                        manager.clone(),
                        stations.clone(),
                        id,
                        config.scheduler.bwreq_packet_size_bits,
                        Rc::downgrade(&ul_master),
                    );
                    ul_master.borrow_mut().add_receptor(generator.receptor());

                    let bs_ranging = RangingBs::new(
                        format!("{}.ranging", name),
                        id,
                        manager.clone(),
                        Rc::downgrade(&dl_master),
                    );
                    {
                        let ranging = Rc::downgrade(&bs_ranging);
                        dl_master.borrow_mut().add_receptor(Rc::new(move || {
                            if let Some(ranging) = ranging.upgrade() {
                                ranging.borrow_mut().wakeup();
                            }
                        }));
                    }
                    ranging_bs = Some(bs_ranging);

                    dl_map.borrow_mut().set_scheduler(dl_master.clone());
                    ul_map.borrow_mut().set_scheduler(ul_master.clone());

                    manager.borrow_mut().subscribe_deleted(dl_master.clone());
                    manager.borrow_mut().subscribe_deleted(ul_master.clone());

                    let dl_data = DataCollector::new(
                        format!("{}.dlData", name),
                        Some(dl_master.clone()),
                        None,
                        phy.clone(),
                        kernel.clone(),
                        timing_weak.clone(),
                    );
                    let ul_data = DataCollector::new(
                        format!("{}.ulData", name),
                        None,
                        Some(ul_master.clone()),
                        phy.clone(),
                        kernel.clone(),
                        timing_weak.clone(),
                    );

                    dl_scheduler = Some(dl_master);
                    ul_scheduler = Some(ul_master);
                    (dl_data, ul_data)
                }
                StationType::SubscriberStation => {
                    let ul_slave = Scheduler::new(
                        format!("{}.ulScheduler", name),
                        SchedulerRole::UplinkSlave,
                        config.scheduler.clone(),
                        &config.phy,
                        Box::new(FcfsStrategy::new()),
                        registry_proxy.clone(),
                        kernel.clone(),
                    );
                    ul_slave.borrow_mut().set_ul_map(ul_map.clone());
                    ul_slave.borrow_mut().add_receptor(drain.clone());
                    manager.borrow_mut().subscribe_deleted(ul_slave.clone());

                    let ss_ranging = RangingSs::new(
                        format!("{}.ranging", name),
                        id,
                        manager.clone(),
                        Rc::downgrade(&contention),
                        config.ranging.clone(),
                    );
                    {
                        let ranging = Rc::downgrade(&ss_ranging);
                        contention.borrow_mut().add_receptor(Rc::new(move || {
                            if let Some(ranging) = ranging.upgrade() {
                                ranging.borrow_mut().wakeup();
                            }
                        }));
                    }
                    timing.borrow_mut().subscribe_new_frame(ss_ranging.clone());
                    ranging_ss = Some(ss_ranging);

                    let dl_data = DataCollector::new(
                        format!("{}.dlData", name),
                        None,
                        None,
                        phy.clone(),
                        kernel.clone(),
                        timing_weak.clone(),
                    );
                    let ul_data = DataCollector::new(
                        format!("{}.ulData", name),
                        Some(ul_slave.clone()),
                        None,
                        phy.clone(),
                        kernel.clone(),
                        timing_weak.clone(),
                    );

                    ul_scheduler = Some(ul_slave);
                    (dl_data, ul_data)
                }
            };

            timing
                .borrow_mut()
                .subscribe_new_frame(Rc::new(RefCell::new(NotListeningTick {
                    manager: manager.clone(),
                })));

            let entries = Self::frame_plan(
                station_type,
                &config,
                frame_head.clone(),
                dl_map.clone(),
                ul_map.clone(),
                contention.clone(),
                dl_data.clone(),
                ul_data.clone(),
            );
            timing.borrow_mut().configure(entries);

            Station {
                id,
                name: name.clone(),
                station_type,
                config: config.clone(),
                manager: manager.clone(),
                classifier,
                timing: timing.clone(),
                frame_head: frame_head.clone(),
                dl_map: dl_map.clone(),
                ul_map: ul_map.clone(),
                contention: contention.clone(),
                dl_data,
                ul_data,
                dl_scheduler,
                ul_scheduler,
                ranging_bs,
                ranging_ss,
                outbound: RefCell::new(VecDeque::new()),
                received: RefCell::new(Vec::new()),
            }
        });

        stations.register(station.clone());
        station
    }

    /// The chronological activation list of one frame. Both station
    /// roles use the same phase geometry so their frames stay
    /// aligned.
    #[allow(clippy::too_many_arguments)]
    fn frame_plan(
        station_type: StationType,
        config: &MacConfig,
        frame_head: Rc<RefCell<FrameHeadCollector>>,
        dl_map: Rc<RefCell<DlMapCollector>>,
        ul_map: Rc<RefCell<UlMapCollector>>,
        contention: Rc<RefCell<ContentionCollector>>,
        dl_data: Rc<RefCell<DataCollector>>,
        ul_data: Rc<RefCell<DataCollector>>,
    ) -> Vec<ActivationEntry> {
        let phases = &config.phases;
        let sending = station_type != StationType::SubscriberStation;
        let mode = |on_sending_side: bool| {
            if on_sending_side {
                CollectorMode::Sending
            } else {
                CollectorMode::Receiving
            }
        };

        let mut entries = vec![
            ActivationEntry {
                action: Activation::StartCollection,
                mode: mode(sending),
                collector: Some(dl_data.clone() as CollectorHandle),
                duration: phases.dl_data,
            },
            ActivationEntry {
                action: Activation::StartCollection,
                mode: mode(!sending),
                collector: Some(ul_data.clone() as CollectorHandle),
                duration: phases.ul_data,
            },
            ActivationEntry {
                action: Activation::Start,
                mode: mode(sending),
                collector: Some(frame_head as CollectorHandle),
                duration: phases.frame_head,
            },
            ActivationEntry {
                action: Activation::Start,
                mode: mode(sending),
                collector: Some(dl_map as CollectorHandle),
                duration: phases.dl_map,
            },
            ActivationEntry {
                action: Activation::Start,
                mode: mode(sending),
                collector: Some(ul_map as CollectorHandle),
                duration: phases.ul_map,
            },
        ];

        if station_type == StationType::SubscriberStation {
            entries.push(ActivationEntry {
                action: Activation::StartCollection,
                mode: CollectorMode::Sending,
                collector: Some(contention.clone() as CollectorHandle),
                duration: phases.contention,
            });
            entries.push(ActivationEntry {
                action: Activation::Start,
                mode: CollectorMode::Sending,
                collector: Some(contention as CollectorHandle),
                duration: phases.contention,
            });
        } else {
            // the base station listens during the contention window
            entries.push(ActivationEntry {
                action: Activation::Pause,
                mode: CollectorMode::Receiving,
                collector: None,
                duration: phases.contention,
            });
        }

        entries.push(ActivationEntry {
            action: Activation::Start,
            mode: mode(sending),
            collector: Some(dl_data.clone() as CollectorHandle),
            duration: phases.dl_data,
        });
        entries.push(ActivationEntry {
            action: Activation::Start,
            mode: mode(!sending),
            collector: Some(ul_data.clone() as CollectorHandle),
            duration: phases.ul_data,
        });
        entries.push(ActivationEntry {
            action: Activation::FinishCollection,
            mode: mode(sending),
            collector: Some(dl_data as CollectorHandle),
            duration: 0.0,
        });
        entries.push(ActivationEntry {
            action: Activation::FinishCollection,
            mode: mode(!sending),
            collector: Some(ul_data as CollectorHandle),
            duration: 0.0,
        });

        entries
    }

    pub fn id(&self) -> StationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn station_type(&self) -> StationType {
        self.station_type
    }

    pub fn manager(&self) -> ManagerHandle {
        self.manager.clone()
    }

    pub fn timing(&self) -> Rc<RefCell<TimingControl>> {
        self.timing.clone()
    }

    pub fn contention(&self) -> Rc<RefCell<ContentionCollector>> {
        self.contention.clone()
    }

    pub fn ul_map(&self) -> Rc<RefCell<UlMapCollector>> {
        self.ul_map.clone()
    }

    pub fn dl_map(&self) -> Rc<RefCell<DlMapCollector>> {
        self.dl_map.clone()
    }

    pub fn dl_scheduler(&self) -> Option<Rc<RefCell<Scheduler>>> {
        self.dl_scheduler.clone()
    }

    pub fn ul_scheduler(&self) -> Option<Rc<RefCell<Scheduler>>> {
        self.ul_scheduler.clone()
    }

    pub fn ranging_bs(&self) -> Option<Rc<RefCell<RangingBs>>> {
        self.ranging_bs.clone()
    }

    pub fn ranging_ss(&self) -> Option<Rc<RefCell<RangingSs>>> {
        self.ranging_ss.clone()
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    /// Data PDUs delivered to the upper layer so far.
    pub fn received(&self) -> Vec<Pdu> {
        self.received.borrow().clone()
    }

    /// Begin frame processing.
    pub fn start(&self) {
        self.timing.borrow_mut().start();
    }

    /// Register the cell-wide ranging connection so contention
    /// traffic on CID 0 classifies before the first subscriber has
    /// completed ranging (base stations only).
    pub fn register_ranging_anchor(&self) {
        assert!(
            self.station_type.is_base_station(),
            "{}: only base stations anchor the ranging connection",
            self.name
        );
        self.manager
            .borrow_mut()
            .append_connection(ConnectionIdentifier::with_cid(
                self.id,
                0,
                0,
                0,
                airlink_core::ConnectionType::InitialRanging,
                airlink_core::Direction::Bidirectional,
                QosCategory::Signaling,
            ));
    }

    /// Begin ranging towards the given base station (subscriber
    /// stations only).
    pub fn start_ranging(&self, base_station: StationId) {
        self.ranging_ss
            .as_ref()
            .expect("only subscriber stations range")
            .borrow_mut()
            .start(base_station);
    }

    /// Upper-convergence entry point: classify and enqueue a payload
    /// towards `destination`.
    pub fn send_data(
        &self,
        destination: StationId,
        qos: QosCategory,
        payload: Bytes,
    ) -> Result<(), MacError> {
        let mut pdu = Pdu::data(self.id, destination, qos, payload);
        if self.classifier.resolve_outgoing(&pdu).is_none() {
            return Err(MacError::NoConnection(destination));
        }
        self.classifier.classify_outgoing(&mut pdu);
        self.outbound.borrow_mut().push_back(pdu);
        Ok(())
    }

    /// Move classified backlog into the role's scheduler; invoked by
    /// the schedulers' receptor when a collection window opens. PDUs
    /// whose connection disappeared in the meantime are dropped.
    pub fn drain_outbound(&self) {
        let scheduler = match self.station_type {
            StationType::BaseStation | StationType::RelayStation => self.dl_scheduler.clone(),
            StationType::SubscriberStation => self.ul_scheduler.clone(),
        };
        let scheduler = match scheduler {
            Some(scheduler) => scheduler,
            None => return,
        };

        let mut outbound = self.outbound.borrow_mut();
        let mut keep = VecDeque::new();
        while let Some(pdu) = outbound.pop_front() {
            let cid = pdu.cid().expect("unclassified PDU in the outbound queue");
            if self.manager.borrow().connection_with_id(cid).is_none() {
                continue;
            }
            if scheduler.borrow().is_accepting(&pdu) {
                scheduler.borrow_mut().schedule(pdu);
            } else {
                keep.push_back(pdu);
            }
        }
        *outbound = keep;
    }

    /// Backlog towards this station over the given connections, as
    /// inspected by the uplink master's bandwidth-request shortcut.
    pub fn number_of_queued_pdus(&self, connections: &[ConnectionIdentifier]) -> usize {
        let cids: HashSet<Cid> = connections.iter().map(|ci| ci.cid).collect();
        let outbound = self
            .outbound
            .borrow()
            .iter()
            .filter(|pdu| pdu.cid().map(|cid| cids.contains(&cid)).unwrap_or(false))
            .count();
        let queued: usize = match &self.ul_scheduler {
            Some(scheduler) => cids
                .iter()
                .map(|cid| scheduler.borrow().queued_pdus(*cid))
                .sum(),
            None => 0,
        };
        outbound + queued
    }

    /// PHY receive entry point.
    pub fn on_data(&self, pdu: Pdu) {
        match &pdu.mgmt {
            // broadcast control traffic is dispatched below the
            // classifier
            Some(ManagementMessage::FrameHead {
                base_station,
                frame_number,
            }) => {
                self.frame_head
                    .borrow()
                    .on_frame_head(*base_station, *frame_number);
            }
            Some(ManagementMessage::DlMap(map)) => self.dl_map.borrow_mut().on_map(map),
            Some(ManagementMessage::UlMap(map)) => self.ul_map.borrow_mut().on_map(map),

            Some(message @ ManagementMessage::RngReq { .. }) => {
                if self.classifier.classify_incoming(&pdu).is_none() {
                    return;
                }
                self.ranging_bs
                    .as_ref()
                    .expect("ranging request at a station without base-station role")
                    .borrow_mut()
                    .handle(message);
            }
            Some(message @ ManagementMessage::RngRsp { .. }) => {
                if self.classifier.classify_incoming(&pdu).is_none() {
                    return;
                }
                // broadcast responses also reach unrelated
                // subscribers, which filter them by station ID
                if let Some(ranging) = &self.ranging_ss {
                    ranging.borrow_mut().handle(message);
                }
            }

            None => {
                if self.classifier.classify_incoming(&pdu).is_none() {
                    // stale compound, dropped without delivery
                    return;
                }
                info!("{}: delivering compound to the upper layer", self.name);
                self.received.borrow_mut().push(pdu);
            }
        }
    }
}
