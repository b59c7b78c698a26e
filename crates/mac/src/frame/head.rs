//! Frame-head broadcast.
//!
//! The base station opens every frame with a frame head compound so
//! subscribers can synchronize; subscriber stations run the phase in
//! receiving mode and just listen.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::info;

use airlink_core::{EventHandle, EventScheduler, StationId};

use crate::frame::collector::{CollectorMode, CompoundCollector};
use crate::frame::timing::TimingControl;
use crate::pdu::{ManagementMessage, Pdu};
use crate::phy::{PhyAccess, PhyDataTransmission, PhyMode};
use crate::ACCURACY_FACTOR;

pub struct FrameHeadCollector {
    name: String,
    station_id: StationId,
    phy: Rc<dyn PhyDataTransmission>,
    kernel: Rc<EventScheduler>,
    timing: Weak<RefCell<TimingControl>>,
    phy_mode: PhyMode,
    symbol_duration: f64,
    frame_number: u64,
    phase_duration: f64,
    timeout: Option<EventHandle>,
    weak_self: Weak<RefCell<FrameHeadCollector>>,
}

impl FrameHeadCollector {
    pub fn new(
        name: impl Into<String>,
        station_id: StationId,
        phy: Rc<dyn PhyDataTransmission>,
        kernel: Rc<EventScheduler>,
        timing: Weak<RefCell<TimingControl>>,
        phy_mode: PhyMode,
        symbol_duration: f64,
    ) -> Rc<RefCell<Self>> {
        let collector = Rc::new(RefCell::new(Self {
            name: name.into(),
            station_id,
            phy,
            kernel,
            timing,
            phy_mode,
            symbol_duration,
            frame_number: 0,
            phase_duration: 0.0,
            timeout: None,
            weak_self: Weak::new(),
        }));
        collector.borrow_mut().weak_self = Rc::downgrade(&collector);
        collector
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// A frame head arrived from the cell's base station.
    pub fn on_frame_head(&self, base_station: StationId, frame_number: u64) {
        info!(
            "{}: received FCH from station {} (frame {})",
            self.name, base_station, frame_number
        );
    }

    fn on_timeout(this: &Rc<RefCell<Self>>) {
        let (timing, name) = {
            let mut collector = this.borrow_mut();
            collector.timeout = None;
            (collector.timing.clone(), collector.name.clone())
        };
        if let Some(timing) = timing.upgrade() {
            timing.borrow().finished_phase(&name);
        }
    }
}

impl CompoundCollector for FrameHeadCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_maximum_duration(&mut self, duration: f64) {
        self.phase_duration = duration;
    }

    fn maximum_duration(&self) -> f64 {
        self.phase_duration
    }

    fn start_collection(&mut self, _mode: CollectorMode) {}

    fn start(&mut self, mode: CollectorMode) {
        match mode {
            CollectorMode::Sending => {
                let message = ManagementMessage::FrameHead {
                    base_station: self.station_id,
                    frame_number: self.frame_number,
                };
                let pdu = Pdu::management(message);
                let duration =
                    pdu.length_bits() as f64 / self.phy_mode.data_rate(self.symbol_duration);
                assert!(
                    duration <= self.phase_duration,
                    "{}: PDU overran the maximum duration of the frame phase",
                    self.name
                );

                let now = self.kernel.now();
                let mut pdu = pdu;
                pdu.phy = Some(PhyAccess {
                    source: self.station_id,
                    destination: None,
                    transmission_start: now + ACCURACY_FACTOR,
                    transmission_stop: now + duration,
                    phy_mode: self.phy_mode,
                });

                let weak = self.weak_self.clone();
                self.timeout = Some(self.kernel.schedule_in(duration, move || {
                    if let Some(collector) = weak.upgrade() {
                        FrameHeadCollector::on_timeout(&collector);
                    }
                }));

                info!(
                    "{}: frame head {} started with duration {}",
                    self.name, self.frame_number, duration
                );
                self.frame_number += 1;
                self.phy.send_data(pdu);
            }
            CollectorMode::Receiving => {}
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.timeout.take() {
            self.kernel.cancel(handle);
        }
    }

    fn is_accepting(&self, _pdu: &Pdu) -> bool {
        false
    }

    fn send_data(&mut self, _pdu: Pdu) {
        panic!("{}: frame head collector does not take compounds", self.name);
    }
}
