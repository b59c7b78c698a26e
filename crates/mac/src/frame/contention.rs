//! Contention-phase collector.
//!
//! Buffers PDUs for a contention access window (e.g. ranging
//! requests). When contention access is enabled the phase is split
//! into a slot grid and a station may only transmit within its drawn
//! back-off slot; the back-off counts down across frames while other
//! stations own the slots.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::{debug, info};

use airlink_core::{EventHandle, EventScheduler, StationId, StationType};

use crate::classifier::ManagerHandle;
use crate::config::{ContentionConfig, PhyConfig};
use crate::frame::collector::{CollectorMode, CompoundCollector, Receptor};
use crate::frame::timing::TimingControl;
use crate::pdu::Pdu;
use crate::phy::{PhyDataTransmission, PhyMode};
use crate::ACCURACY_FACTOR;

pub struct ContentionCollector {
    name: String,
    station_id: StationId,
    station_type: StationType,
    manager: ManagerHandle,
    phy: Rc<dyn PhyDataTransmission>,
    kernel: Rc<EventScheduler>,
    timing: Weak<RefCell<TimingControl>>,
    contention: ContentionConfig,
    symbol_duration: f64,
    phy_mode: PhyMode,
    accepting: bool,
    /// Drawn back-off slot; negative while unset.
    back_off: i64,
    /// Phase budget assigned by the timing control.
    phase_duration: f64,
    /// End of the window this station may fill, relative to the phase
    /// start. Equals the phase budget when contention access is off.
    window_limit: f64,
    accumulated: f64,
    compounds: VecDeque<Pdu>,
    receptors: Vec<Receptor>,
    timeout: Option<EventHandle>,
    weak_self: Weak<RefCell<ContentionCollector>>,
}

impl ContentionCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        station_id: StationId,
        station_type: StationType,
        manager: ManagerHandle,
        phy: Rc<dyn PhyDataTransmission>,
        kernel: Rc<EventScheduler>,
        timing: Weak<RefCell<TimingControl>>,
        contention: ContentionConfig,
        phy_config: &PhyConfig,
    ) -> Rc<RefCell<Self>> {
        let collector = Rc::new(RefCell::new(Self {
            name: name.into(),
            station_id,
            station_type,
            manager,
            phy,
            kernel,
            timing,
            contention,
            symbol_duration: phy_config.symbol_duration,
            phy_mode: phy_config.default_phy_mode,
            accepting: false,
            back_off: -1,
            phase_duration: 0.0,
            window_limit: 0.0,
            accumulated: 0.0,
            compounds: VecDeque::new(),
            receptors: Vec::new(),
            timeout: None,
            weak_self: Weak::new(),
        }));
        collector.borrow_mut().weak_self = Rc::downgrade(&collector);
        collector
    }

    pub fn add_receptor(&mut self, receptor: Receptor) {
        self.receptors.push(receptor);
    }

    /// Assign the back-off slot for the next contention opportunity.
    /// An already pending back-off is kept.
    pub fn set_back_off(&mut self, back_off: u32) {
        assert!(
            self.contention.enabled,
            "{}: back-off is only usable with contention access enabled",
            self.name
        );
        if self.back_off >= 0 {
            info!(
                "{}: back-off is already set, remaining: {}",
                self.name, self.back_off
            );
            return;
        }
        info!("{}: set back-off to {}", self.name, back_off);
        self.back_off = back_off as i64;
    }

    fn slot_duration(&self) -> f64 {
        self.contention.slot_length_in_symbols as f64 * self.symbol_duration
    }

    fn duration_of(&self, pdu: &Pdu) -> f64 {
        pdu.length_bits() as f64 / self.phy_mode.data_rate(self.symbol_duration)
    }

    /// Wake the upstream sources as an immediate event, outside the
    /// current dispatch.
    fn wake_receptors(&self) {
        for receptor in &self.receptors {
            let receptor = receptor.clone();
            self.kernel.schedule_in(0.0, move || (*receptor)());
        }
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

impl CompoundCollector for ContentionCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_maximum_duration(&mut self, duration: f64) {
        self.phase_duration = duration;
    }

    fn maximum_duration(&self) -> f64 {
        self.phase_duration
    }

    fn start_collection(&mut self, _mode: CollectorMode) {
        assert!(
            self.compounds.is_empty(),
            "queue in compound collector is not empty"
        );

        if self.phase_duration == 0.0 {
            // this collector is not in use
            return;
        }

        if self.contention.enabled {
            let grid = self.contention.grid_duration(self.symbol_duration);
            if grid > self.phase_duration + 1e-9 {
                panic!(
                    "{}: defined contention slots are longer than the total contention phase",
                    self.name
                );
            }
            if grid < self.phase_duration - 1e-9 {
                panic!(
                    "{}: defined contention slots are too short for this contention phase, \
                     they are wasting the frame resource",
                    self.name
                );
            }

            if self.back_off >= 0 && self.back_off < self.contention.number_of_slots as i64 {
                self.accumulated = self.back_off as f64 * self.slot_duration();
                self.window_limit = (self.back_off + 1) as f64 * self.slot_duration();
                assert!(
                    self.window_limit - 1e-13 <= self.phase_duration,
                    "{}: slot window is longer than the total phase",
                    self.name
                );
                self.accepting = true;
                self.back_off = -1;
                self.wake_receptors();
            } else {
                self.accumulated = 0.0;
                self.window_limit = self.phase_duration;
                self.accepting = false;
                self.back_off -= self.contention.number_of_slots as i64;
            }
        } else {
            self.accumulated = 0.0;
            self.window_limit = self.phase_duration;
            self.accepting = true;
            self.wake_receptors();
        }
    }

    fn start(&mut self, _mode: CollectorMode) {
        let phase_start = self.kernel.now();

        let weak = self.weak_self.clone();
        self.timeout = Some(self.kernel.schedule_in(self.window_limit, move || {
            if let Some(collector) = weak.upgrade() {
                ContentionCollector::on_timeout(&collector);
            }
        }));

        while let Some(mut pdu) = self.compounds.pop_front() {
            assert!(
                self.phy.is_accepting(),
                "lower layer is not accepting the compound but is supposed to"
            );
            let access = pdu.phy.as_mut().expect("buffered compound without PHY access");
            access.transmission_start += phase_start;
            access.transmission_stop += phase_start;
            self.phy.send_data(pdu);
        }
    }

    fn stop(&mut self) {
        self.accepting = false;
        if let Some(handle) = self.timeout.take() {
            self.kernel.cancel(handle);
        }
    }

    /// The hard capacity bound: a PDU is only accepted while its
    /// transmit duration still fits into the remaining window, and
    /// never for a peer that is known not to listen.
    fn is_accepting(&self, pdu: &Pdu) -> bool {
        if !self.accepting {
            return false;
        }

        let cid = match pdu.cid() {
            Some(cid) => cid,
            None => return false,
        };
        let ci = match self.manager.borrow().connection_with_id(cid) {
            Some(ci) => ci,
            None => return false,
        };
        if ci.not_listening > 0 {
            return false;
        }

        self.duration_of(pdu) + self.accumulated < self.window_limit
    }

    fn send_data(&mut self, mut pdu: Pdu) {
        let cid = pdu.cid().expect("unclassified compound in contention collector");
        let connection = self
            .manager
            .borrow()
            .connection_with_id(cid)
            .expect("no connection for compound in contention collector");

        let destination = match self.station_type {
            StationType::BaseStation => connection.subscriber_station,
            StationType::SubscriberStation => connection.base_station,
            // relays only use the contention path towards their
            // subscribers
            StationType::RelayStation => connection.subscriber_station,
        };

        let duration = self.duration_of(&pdu);
        pdu.phy = Some(crate::phy::PhyAccess {
            source: self.station_id,
            destination: Some(destination),
            transmission_start: self.accumulated + ACCURACY_FACTOR,
            transmission_stop: self.accumulated + duration,
            phy_mode: self.phy_mode,
        });
        self.accumulated += duration;

        debug!(
            "{}: buffered compound for station {} in contention phase",
            self.name, destination
        );
        self.compounds.push_back(pdu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlink_core::{
        CidAllocator, ConnectionIdentifier, ConnectionManager, ConnectionType, Direction,
        QosCategory,
    };

    struct NullPhy {
        sent: RefCell<Vec<Pdu>>,
    }

    impl PhyDataTransmission for NullPhy {
        fn send_data(&self, pdu: Pdu) {
            self.sent.borrow_mut().push(pdu);
        }
    }

    struct Fixture {
        collector: Rc<RefCell<ContentionCollector>>,
        manager: ManagerHandle,
        phy: Rc<NullPhy>,
        kernel: Rc<EventScheduler>,
    }

    fn fixture(contention: ContentionConfig, phase_duration: f64) -> Fixture {
        let kernel = EventScheduler::new();
        let phy = Rc::new(NullPhy {
            sent: RefCell::new(Vec::new()),
        });
        let manager = Rc::new(RefCell::new(ConnectionManager::new(
            "SS2",
            StationType::SubscriberStation,
            CidAllocator::new(),
        )));
        let collector = ContentionCollector::new(
            "contention",
            2,
            StationType::SubscriberStation,
            manager.clone(),
            phy.clone(),
            kernel.clone(),
            Weak::new(),
            contention,
            &PhyConfig::default(),
        );
        collector.borrow_mut().set_maximum_duration(phase_duration);
        Fixture {
            collector,
            manager,
            phy,
            kernel,
        }
    }

    fn ranging_ci(manager: &ManagerHandle) -> ConnectionIdentifier {
        manager
            .borrow_mut()
            .append_connection(ConnectionIdentifier::new(
                1,
                2,
                2,
                ConnectionType::InitialRanging,
                Direction::Bidirectional,
                QosCategory::Signaling,
            ))
    }

    fn classified_pdu(cid: i32, length_bits: usize) -> Pdu {
        let mut pdu = Pdu::fake(length_bits);
        pdu.set_cid(cid);
        pdu
    }

    #[test]
    fn accepted_durations_never_exceed_the_window() {
        let fixture = fixture(
            ContentionConfig {
                enabled: false,
                number_of_slots: 0,
                slot_length_in_symbols: 0,
            },
            2e-3,
        );
        let ci = ranging_ci(&fixture.manager);
        let mut collector = fixture.collector.borrow_mut();
        collector.start_collection(CollectorMode::Sending);

        let phy_config = PhyConfig::default();
        let rate = phy_config
            .default_phy_mode
            .data_rate(phy_config.symbol_duration);
        // feed PDUs taking a quarter of the window each
        let pdu_bits = (rate * 2e-3 / 4.0) as usize;

        let mut accepted = 0.0;
        loop {
            let pdu = classified_pdu(ci.cid, pdu_bits);
            if !collector.is_accepting(&pdu) {
                break;
            }
            accepted += pdu_bits as f64 / rate;
            collector.send_data(pdu);
        }
        assert!(accepted > 0.0);
        assert!(accepted <= 2e-3);

        // one more PDU must be rejected
        let pdu = classified_pdu(ci.cid, pdu_bits);
        assert!(!collector.is_accepting(&pdu));
    }

    #[test]
    fn not_listening_peers_are_rejected() {
        let fixture = fixture(
            ContentionConfig {
                enabled: false,
                number_of_slots: 0,
                slot_length_in_symbols: 0,
            },
            2e-3,
        );
        let mut ci = ranging_ci(&fixture.manager);
        ci.not_listening = 3;
        fixture.manager.borrow_mut().change_connection(ci.clone()).unwrap();

        let mut collector = fixture.collector.borrow_mut();
        collector.start_collection(CollectorMode::Sending);
        assert!(!collector.is_accepting(&classified_pdu(ci.cid, 30)));
    }

    #[test]
    #[should_panic(expected = "wasting the frame resource")]
    fn too_short_slot_grid_is_fatal() {
        // 4 slots x 5 symbols x 100us = 2 ms, phase is 3 ms
        let fixture = fixture(ContentionConfig::default(), 3e-3);
        fixture
            .collector
            .borrow_mut()
            .start_collection(CollectorMode::Sending);
    }

    #[test]
    #[should_panic(expected = "longer than the total contention phase")]
    fn too_long_slot_grid_is_fatal() {
        let fixture = fixture(ContentionConfig::default(), 1e-3);
        fixture
            .collector
            .borrow_mut()
            .start_collection(CollectorMode::Sending);
    }

    #[test]
    fn back_off_gates_the_collection_window() {
        let fixture = fixture(ContentionConfig::default(), 2e-3);
        let ci = ranging_ci(&fixture.manager);

        {
            let mut collector = fixture.collector.borrow_mut();
            // slot 6 is beyond this frame's 4 slots
            collector.set_back_off(6);
            collector.start_collection(CollectorMode::Sending);
            assert!(!collector.is_accepting(&classified_pdu(ci.cid, 30)));
            collector.stop();
        }

        // next frame the remaining back-off is 2, inside the grid
        {
            let mut collector = fixture.collector.borrow_mut();
            collector.start_collection(CollectorMode::Sending);
            assert!(collector.is_accepting(&classified_pdu(ci.cid, 30)));
            collector.send_data(classified_pdu(ci.cid, 30));

            // the transmission is placed inside slot 2
            let slot = collector.slot_duration();
            let pdu = collector.compounds.back().unwrap();
            let access = pdu.phy.as_ref().unwrap();
            assert!(access.transmission_start >= 2.0 * slot);
            assert!(access.transmission_stop <= 3.0 * slot);
        }
    }

    #[test]
    fn start_shifts_buffered_compounds_to_absolute_time() {
        let fixture = fixture(
            ContentionConfig {
                enabled: false,
                number_of_slots: 0,
                slot_length_in_symbols: 0,
            },
            2e-3,
        );
        let ci = ranging_ci(&fixture.manager);

        fixture.kernel.schedule_in(1.0, || {});
        fixture.kernel.run();
        assert_eq!(fixture.kernel.now(), 1.0);

        let mut collector = fixture.collector.borrow_mut();
        collector.start_collection(CollectorMode::Sending);
        collector.send_data(classified_pdu(ci.cid, 40));
        collector.start(CollectorMode::Sending);

        let sent = fixture.phy.sent.borrow();
        assert_eq!(sent.len(), 1);
        let access = sent[0].phy.as_ref().unwrap();
        assert!(access.transmission_start >= 1.0);
        assert!(access.transmission_stop > access.transmission_start);
    }
}
