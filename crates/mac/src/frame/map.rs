//! MAP collectors.
//!
//! The base station broadcasts a DL-MAP and an UL-MAP every frame,
//! describing the resource allocation its schedulers computed for the
//! data phases. Subscriber stations run the phases in receiving mode:
//! the UL-MAP collector retains the burst granted to this station so
//! the uplink slave scheduler can transmit into exactly that window.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, info};

use airlink_core::{EventHandle, EventScheduler, StationId};

use crate::classifier::ManagerHandle;
use crate::frame::collector::{CollectorMode, CompoundCollector};
use crate::frame::timing::TimingControl;
use crate::pdu::{BurstDescriptor, ManagementMessage, MapMessage, Pdu};
use crate::phy::{PhyAccess, PhyDataTransmission, PhyMode};
use crate::scheduler::Scheduler;
use crate::ACCURACY_FACTOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Downlink,
    Uplink,
}

/// Shared implementation of the DL/UL MAP collectors.
struct MapCollector {
    name: String,
    kind: MapKind,
    station_id: StationId,
    manager: ManagerHandle,
    phy: Rc<dyn PhyDataTransmission>,
    kernel: Rc<EventScheduler>,
    timing: Weak<RefCell<TimingControl>>,
    phy_mode: PhyMode,
    symbol_duration: f64,
    /// The scheduler whose allocation this MAP describes (sender
    /// side only).
    scheduler: Option<Rc<RefCell<Scheduler>>>,
    frame_number: u64,
    phase_duration: f64,
    timeout: Option<EventHandle>,
}

impl MapCollector {
    fn map_duration(&self, pdu: &Pdu) -> f64 {
        let raw = pdu.length_bits() as f64 / self.phy_mode.data_rate(self.symbol_duration);
        (raw / self.symbol_duration).ceil() * self.symbol_duration
    }

    fn send_map(&mut self, on_timeout: impl FnOnce() + 'static) {
        let scheduler = self
            .scheduler
            .as_ref()
            .expect("MAP collector in sending mode without a scheduler");
        let (bursts, phase_duration) = {
            let scheduler = scheduler.borrow();
            (scheduler.bursts().to_vec(), scheduler.duration())
        };

        let message = MapMessage {
            base_station: self.station_id,
            frame_number: self.frame_number,
            phase_duration,
            bursts,
        };
        let burst_count = message.bursts.len();
        let message = match self.kind {
            MapKind::Downlink => ManagementMessage::DlMap(message),
            MapKind::Uplink => ManagementMessage::UlMap(message),
        };

        let mut pdu = Pdu::management(message);
        let duration = self.map_duration(&pdu);
        assert!(
            duration <= self.phase_duration,
            "{}: PDU overran the maximum duration of the frame phase",
            self.name
        );

        let now = self.kernel.now();
        pdu.phy = Some(PhyAccess {
            source: self.station_id,
            destination: None,
            transmission_start: now + ACCURACY_FACTOR,
            transmission_stop: now + duration,
            phy_mode: self.phy_mode,
        });

        self.timeout = Some(self.kernel.schedule_in(duration, on_timeout));

        info!("{}: send MAP of size {}", self.name, burst_count);
        self.frame_number += 1;
        self.phy.send_data(pdu);
    }

    fn finished(&self) {
        if let Some(timing) = self.timing.upgrade() {
            timing.borrow().finished_phase(&self.name);
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.timeout.take() {
            self.kernel.cancel(handle);
        }
    }
}

pub struct DlMapCollector {
    inner: MapCollector,
    /// Last received allocation, subscriber side.
    received_bursts: Vec<BurstDescriptor>,
    weak_self: Weak<RefCell<DlMapCollector>>,
}

impl DlMapCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        station_id: StationId,
        manager: ManagerHandle,
        phy: Rc<dyn PhyDataTransmission>,
        kernel: Rc<EventScheduler>,
        timing: Weak<RefCell<TimingControl>>,
        phy_mode: PhyMode,
        symbol_duration: f64,
    ) -> Rc<RefCell<Self>> {
        let collector = Rc::new(RefCell::new(Self {
            inner: MapCollector {
                name: name.into(),
                kind: MapKind::Downlink,
                station_id,
                manager,
                phy,
                kernel,
                timing,
                phy_mode,
                symbol_duration,
                scheduler: None,
                frame_number: 0,
                phase_duration: 0.0,
                timeout: None,
            },
            received_bursts: Vec::new(),
            weak_self: Weak::new(),
        }));
        collector.borrow_mut().weak_self = Rc::downgrade(&collector);
        collector
    }

    pub fn set_scheduler(&mut self, scheduler: Rc<RefCell<Scheduler>>) {
        self.inner.scheduler = Some(scheduler);
    }

    /// A DL-MAP arrived from the base station.
    pub fn on_map(&mut self, map: &MapMessage) {
        info!(
            "{}: received DL MAP from station {} with {} bursts",
            self.inner.name,
            map.base_station,
            map.bursts.len()
        );
        self.received_bursts = map.bursts.clone();
    }

    pub fn received_bursts(&self) -> &[BurstDescriptor] {
        &self.received_bursts
    }
}

impl CompoundCollector for DlMapCollector {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn set_maximum_duration(&mut self, duration: f64) {
        self.inner.phase_duration = duration;
    }

    fn maximum_duration(&self) -> f64 {
        self.inner.phase_duration
    }

    fn start_collection(&mut self, _mode: CollectorMode) {}

    fn start(&mut self, mode: CollectorMode) {
        match mode {
            CollectorMode::Sending => {
                let weak = self.weak_self.clone();
                self.inner.send_map(move || {
                    if let Some(collector) = weak.upgrade() {
                        collector.borrow_mut().inner.timeout = None;
                        collector.borrow().inner.finished();
                    }
                });
            }
            CollectorMode::Receiving => {}
        }
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn is_accepting(&self, _pdu: &Pdu) -> bool {
        false
    }

    fn send_data(&mut self, _pdu: Pdu) {
        panic!("{}: MAP collector does not take compounds", self.inner.name);
    }
}

pub struct UlMapCollector {
    inner: MapCollector,
    /// Subscriber side: the burst granted to this station in the
    /// upcoming uplink phase, if any.
    granted: Option<BurstDescriptor>,
    ul_phase_duration: f64,
    resources_available: bool,
    weak_self: Weak<RefCell<UlMapCollector>>,
}

impl UlMapCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        station_id: StationId,
        manager: ManagerHandle,
        phy: Rc<dyn PhyDataTransmission>,
        kernel: Rc<EventScheduler>,
        timing: Weak<RefCell<TimingControl>>,
        phy_mode: PhyMode,
        symbol_duration: f64,
    ) -> Rc<RefCell<Self>> {
        let collector = Rc::new(RefCell::new(Self {
            inner: MapCollector {
                name: name.into(),
                kind: MapKind::Uplink,
                station_id,
                manager,
                phy,
                kernel,
                timing,
                phy_mode,
                symbol_duration,
                scheduler: None,
                frame_number: 0,
                phase_duration: 0.0,
                timeout: None,
            },
            granted: None,
            ul_phase_duration: 0.0,
            resources_available: false,
            weak_self: Weak::new(),
        }));
        collector.borrow_mut().weak_self = Rc::downgrade(&collector);
        collector
    }

    pub fn set_scheduler(&mut self, scheduler: Rc<RefCell<Scheduler>>) {
        self.inner.scheduler = Some(scheduler);
    }

    /// An UL-MAP arrived. Retains the burst granted to this station,
    /// if any. A MAP from a foreign base station is a protocol
    /// violation.
    pub fn on_map(&mut self, map: &MapMessage) {
        if let Some(ranging) = self.inner.manager.borrow().connection_with_id(0) {
            assert_eq!(
                map.base_station, ranging.base_station,
                "{}: MAP is not from the associated base station",
                self.inner.name
            );
        }

        info!(
            "{}: received UL MAP from station {} with {} bursts",
            self.inner.name,
            map.base_station,
            map.bursts.len()
        );

        self.ul_phase_duration = map.phase_duration;
        self.granted = map
            .bursts
            .iter()
            .find(|burst| burst.user == self.inner.station_id)
            .cloned();
        self.resources_available = self.granted.is_some();
        if self.resources_available {
            info!("{}: station has granted resources", self.inner.name);
        }
    }

    pub fn has_uplink_burst(&self) -> bool {
        self.resources_available
    }

    pub fn granted_burst(&self) -> Option<BurstDescriptor> {
        self.granted.clone()
    }

    pub fn ul_phase_duration(&self) -> f64 {
        self.ul_phase_duration
    }
}

impl CompoundCollector for UlMapCollector {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn set_maximum_duration(&mut self, duration: f64) {
        self.inner.phase_duration = duration;
    }

    fn maximum_duration(&self) -> f64 {
        self.inner.phase_duration
    }

    fn start_collection(&mut self, _mode: CollectorMode) {}

    fn start(&mut self, mode: CollectorMode) {
        match mode {
            CollectorMode::Sending => {
                let weak = self.weak_self.clone();
                self.inner.send_map(move || {
                    if let Some(collector) = weak.upgrade() {
                        collector.borrow_mut().inner.timeout = None;
                        collector.borrow().inner.finished();
                    }
                });
            }
            CollectorMode::Receiving => {
                // wait for the MAP; stale grants must not leak into
                // this frame
                debug!("{}: waiting for UL MAP", self.inner.name);
                self.resources_available = false;
                self.granted = None;
            }
        }
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn is_accepting(&self, _pdu: &Pdu) -> bool {
        false
    }

    fn send_data(&mut self, _pdu: Pdu) {
        panic!("{}: MAP collector does not take compounds", self.inner.name);
    }
}
