//! The scheduler aggregate.
//!
//! One `Scheduler` instance owns the pluggable pieces of one
//! scheduling role: the per-CID queue, the allocation strategy, the
//! registry proxy and the callback that turns bursts into PHY
//! instructions. The data collector drives it through
//! `start_scheduling` (collection opens) and `deliver_schedule`
//! (phase starts).

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use airlink_core::{
    ConnectionDeletedObserver, ConnectionIdentifier, ConnectionType, EventScheduler,
};

use crate::config::{PhyConfig, SchedulerConfig};
use crate::frame::collector::Receptor;
use crate::frame::map::UlMapCollector;
use crate::pdu::{BurstDescriptor, Pdu};
use crate::phy::PhyDataTransmission;

pub mod bwreq;
pub mod callback;
pub mod grouper;
pub mod queue;
pub mod registry;
pub mod strategy;

pub use bwreq::PseudoBwRequestGenerator;
pub use callback::Callback;
pub use grouper::{Group, Grouper, NoGrouper};
pub use queue::{CidQueue, ProbeOutput};
pub use registry::{MacRegistryProxy, RegistryProxy};
pub use strategy::{Burst, FcfsStrategy, Strategy, StrategyInput, StrategyResult};

/// The three positions a scheduler can hold in a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerRole {
    /// Base station scheduling its own downlink transmissions.
    DownlinkMaster,
    /// Base station allocating uplink resources for its subscribers;
    /// it does not transmit itself.
    UplinkMaster,
    /// Subscriber station transmitting into the burst the master
    /// granted via the UL-MAP.
    UplinkSlave,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub reset_bits: usize,
    pub reset_compounds: usize,
}

pub struct Scheduler {
    name: String,
    role: SchedulerRole,
    config: SchedulerConfig,
    symbol_duration: f64,
    queue: CidQueue,
    strategy: Box<dyn Strategy>,
    registry: Rc<dyn RegistryProxy>,
    callback: Callback,
    receptors: Vec<Receptor>,
    kernel: Rc<EventScheduler>,
    /// Phase budget, set by the owning data collector each frame.
    duration: f64,
    accepting: bool,
    /// Burst descriptors of the last scheduling pass, consumed by the
    /// MAP collectors.
    last_bursts: Vec<BurstDescriptor>,
    /// Slave role only: where the master's grant is retrieved from.
    ul_map: Option<Rc<RefCell<UlMapCollector>>>,
    frame_no: u32,
    stats: SchedulerStats,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        role: SchedulerRole,
        config: SchedulerConfig,
        phy_config: &PhyConfig,
        strategy: Box<dyn Strategy>,
        registry: Rc<dyn RegistryProxy>,
        kernel: Rc<EventScheduler>,
    ) -> Rc<RefCell<Self>> {
        let name = name.into();
        let uplink = role != SchedulerRole::DownlinkMaster;
        let callback = Callback::new(
            name.clone(),
            uplink,
            registry.my_user_id(),
            phy_config.symbol_duration,
        );
        Rc::new(RefCell::new(Self {
            name,
            role,
            config,
            symbol_duration: phy_config.symbol_duration,
            queue: CidQueue::new(),
            strategy,
            registry,
            callback,
            receptors: Vec::new(),
            kernel,
            duration: 0.0,
            accepting: false,
            last_bursts: Vec::new(),
            ul_map: None,
            frame_no: 0,
            stats: SchedulerStats::default(),
        }))
    }

    pub fn add_receptor(&mut self, receptor: Receptor) {
        self.receptors.push(receptor);
    }

    pub fn set_ul_map(&mut self, ul_map: Rc<RefCell<UlMapCollector>>) {
        assert_eq!(
            self.role,
            SchedulerRole::UplinkSlave,
            "{}: only the uplink slave consumes the UL MAP",
            self.name
        );
        self.ul_map = Some(ul_map);
    }

    pub fn role(&self) -> SchedulerRole {
        self.role
    }

    pub fn set_duration(&mut self, duration: f64) {
        self.duration = duration;
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// The allocation computed in this frame, for the MAP broadcast.
    pub fn bursts(&self) -> &[BurstDescriptor] {
        &self.last_bursts
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn queued_pdus(&self, cid: airlink_core::Cid) -> usize {
        self.queue.len_for(cid)
    }

    pub fn is_accepting(&self, pdu: &Pdu) -> bool {
        if self.config.always_accept_if_queue_accepts {
            self.queue.is_accepting(pdu)
        } else {
            self.accepting && self.queue.is_accepting(pdu)
        }
    }

    /// Accept a classified PDU into the backlog.
    pub fn schedule(&mut self, pdu: Pdu) {
        assert!(
            self.is_accepting(&pdu),
            "{}: schedule called but not accepting",
            self.name
        );
        debug!("{}: forwarding accepted PDU to queue", self.name);
        self.queue.put(pdu);
    }

    pub fn reset_all_queues(&mut self) {
        self.queue.reset_all();
    }

    /// End of this frame's collection; advances the frame counter.
    pub fn finish_scheduling(&mut self) {
        self.frame_no += 1;
    }

    pub fn frame_no(&self) -> u32 {
        self.frame_no
    }

    /// One scheduling pass at the start of the collection window:
    /// pull in backlog, run the strategy, keep the resulting bursts.
    pub fn start_scheduling(this: &Rc<RefCell<Scheduler>>) {
        let (receptors, role, name) = {
            let mut scheduler = this.borrow_mut();
            scheduler.accepting = true;
            (
                scheduler.receptors.clone(),
                scheduler.role,
                scheduler.name.clone(),
            )
        };

        // backlog is injected while no borrow is held; receptors call
        // straight back into `schedule`
        for receptor in &receptors {
            (**receptor)();
        }

        let mut scheduler = this.borrow_mut();
        scheduler.accepting = false;

        if role == SchedulerRole::UplinkSlave {
            // the slave's pass runs against the master grant when the
            // phase starts
            return;
        }

        let duration = scheduler.duration;
        assert!(
            scheduler.config.number_of_time_slots as f64 * scheduler.config.slot_duration
                < duration,
            "{}: scheduling resource budget does not fit the phase duration",
            name
        );

        let input = StrategyInput {
            freq_channels: scheduler.config.freq_channels,
            number_of_time_slots: scheduler.config.number_of_time_slots,
            slot_duration: scheduler.config.slot_duration,
            symbol_duration: scheduler.symbol_duration,
            beamforming: scheduler.config.beamforming,
            max_beams: scheduler.config.max_beams,
            phase_duration: duration,
            granted: None,
        };

        let result = {
            let Scheduler {
                strategy,
                queue,
                registry,
                ..
            } = &mut *scheduler;
            strategy.schedule(&input, queue, registry.as_ref())
        };

        match result {
            None => {
                // an idle frame is not an error
                debug!("{}: nothing to schedule this frame", name);
                scheduler.last_bursts.clear();
            }
            Some(result) => {
                scheduler.last_bursts = result
                    .bursts
                    .iter()
                    .map(|burst| burst.descriptor.clone())
                    .collect();

                if role == SchedulerRole::UplinkMaster && !scheduler.config.beamforming {
                    // the master's allocation only feeds the UL MAP;
                    // the synthetic backlog is dropped here
                    info!(
                        "{}: allocated {} uplink bursts",
                        name,
                        result.bursts.len()
                    );
                } else {
                    for burst in result.bursts {
                        scheduler.callback.schedule_burst(burst);
                    }
                }
            }
        }
    }

    /// The phase starts: flush what was scheduled. The uplink slave
    /// runs its pass now, against the burst granted in the UL-MAP.
    pub fn deliver_schedule(this: &Rc<RefCell<Scheduler>>, phy: &Rc<dyn PhyDataTransmission>) {
        let role = this.borrow().role;
        match role {
            SchedulerRole::DownlinkMaster => {
                let now = this.borrow().kernel.now();
                this.borrow_mut().callback.deliver_now(phy.as_ref(), now);
            }
            SchedulerRole::UplinkMaster => {
                let mut scheduler = this.borrow_mut();
                debug!("{}: uplink master bookkeeping only", scheduler.name);
                scheduler.callback.clear();
            }
            SchedulerRole::UplinkSlave => Self::deliver_slave(this, phy),
        }
    }

    fn deliver_slave(this: &Rc<RefCell<Scheduler>>, phy: &Rc<dyn PhyDataTransmission>) {
        let (granted, phase_duration, receptors, name) = {
            let scheduler = this.borrow();
            let ul_map = scheduler
                .ul_map
                .as_ref()
                .expect("uplink slave without UL MAP collector")
                .borrow();
            (
                ul_map.granted_burst(),
                ul_map.ul_phase_duration(),
                scheduler.receptors.clone(),
                scheduler.name.clone(),
            )
        };

        let granted = match granted {
            Some(granted) => granted,
            None => {
                info!("{}: no uplink resources granted this frame", name);
                return;
            }
        };
        info!(
            "{}: has {}s to schedule starting at offset {}",
            name,
            granted.stop - granted.start,
            granted.start
        );

        {
            let mut scheduler = this.borrow_mut();
            scheduler.accepting = true;
        }
        for receptor in &receptors {
            (**receptor)();
        }

        let mut scheduler = this.borrow_mut();
        scheduler.accepting = false;

        let input = StrategyInput {
            freq_channels: scheduler.config.freq_channels,
            number_of_time_slots: scheduler.config.number_of_time_slots,
            slot_duration: scheduler.config.slot_duration,
            symbol_duration: scheduler.symbol_duration,
            beamforming: scheduler.config.beamforming,
            max_beams: scheduler.config.max_beams,
            phase_duration,
            granted: Some(granted),
        };

        let result = {
            let Scheduler {
                strategy,
                queue,
                registry,
                ..
            } = &mut *scheduler;
            strategy.schedule(&input, queue, registry.as_ref())
        };

        if let Some(result) = result {
            scheduler.last_bursts = result
                .bursts
                .iter()
                .map(|burst| burst.descriptor.clone())
                .collect();
            for burst in result.bursts {
                scheduler.callback.schedule_burst(burst);
            }
        }

        let now = scheduler.kernel.now();
        scheduler.callback.deliver_now(phy.as_ref(), now);
    }
}

impl ConnectionDeletedObserver for Scheduler {
    /// Flush the queue of a torn-down connection so no stale
    /// per-connection state survives.
    fn connection_deleted(&mut self, ci: &ConnectionIdentifier) {
        if !self.queue.has_queue(ci.cid) {
            return;
        }
        info!("{}: deleting queue for CID {}", self.name, ci.cid);
        let drained = self.queue.reset_queue(ci.cid);

        if ci.connection_type == ConnectionType::Data {
            self.stats.reset_bits += drained.bits;
            self.stats.reset_compounds += drained.compounds;
            info!(
                "{}: probe reset, {} bits in {} compounds",
                self.name, drained.bits, drained.compounds
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlink_core::{Cid, StationId};
    use crate::phy::PhyMode;

    struct StubRegistry;

    impl RegistryProxy for StubRegistry {
        fn user_for_cid(&self, cid: Cid) -> Option<StationId> {
            Some(100 + cid as StationId)
        }

        fn name_for_user(&self, user: StationId) -> String {
            format!("station {}", user)
        }

        fn my_user_id(&self) -> StationId {
            1
        }

        fn phy_mode_for_user(&self, _user: StationId) -> PhyMode {
            PhyMode { bits_per_symbol: 4 }
        }
    }

    struct RecordingPhy {
        sent: RefCell<Vec<Pdu>>,
    }

    impl PhyDataTransmission for RecordingPhy {
        fn send_data(&self, pdu: Pdu) {
            self.sent.borrow_mut().push(pdu);
        }
    }

    fn scheduler(role: SchedulerRole) -> Rc<RefCell<Scheduler>> {
        let kernel = EventScheduler::new();
        let scheduler = Scheduler::new(
            "test",
            role,
            SchedulerConfig::default(),
            &PhyConfig::default(),
            Box::new(FcfsStrategy::new()),
            Rc::new(StubRegistry),
            kernel,
        );
        scheduler.borrow_mut().set_duration(3e-3);
        scheduler
    }

    fn classified(cid: Cid, bits: usize) -> Pdu {
        let mut pdu = Pdu::fake(bits);
        pdu.set_cid(cid);
        pdu
    }

    #[test]
    fn downlink_pass_schedules_and_delivers() {
        let scheduler = scheduler(SchedulerRole::DownlinkMaster);
        scheduler.borrow_mut().schedule(classified(4, 20));
        scheduler.borrow_mut().schedule(classified(4, 20));

        Scheduler::start_scheduling(&scheduler);
        assert_eq!(scheduler.borrow().bursts().len(), 1);

        let phy: Rc<dyn PhyDataTransmission> = Rc::new(RecordingPhy {
            sent: RefCell::new(Vec::new()),
        });
        Scheduler::deliver_schedule(&scheduler, &phy);

        // both PDUs were flushed with PHY access stamped
        assert_eq!(scheduler.borrow().queued_pdus(4), 0);
    }

    #[test]
    fn idle_frame_is_silently_skipped() {
        let scheduler = scheduler(SchedulerRole::DownlinkMaster);
        Scheduler::start_scheduling(&scheduler);
        assert!(scheduler.borrow().bursts().is_empty());
    }

    #[test]
    fn uplink_master_keeps_bursts_but_transmits_nothing() {
        let scheduler = scheduler(SchedulerRole::UplinkMaster);
        scheduler.borrow_mut().schedule(classified(7, 40));

        Scheduler::start_scheduling(&scheduler);
        assert_eq!(scheduler.borrow().bursts().len(), 1);

        let phy = Rc::new(RecordingPhy {
            sent: RefCell::new(Vec::new()),
        });
        let phy_dyn: Rc<dyn PhyDataTransmission> = phy.clone();
        Scheduler::deliver_schedule(&scheduler, &phy_dyn);
        assert!(phy.sent.borrow().is_empty());
    }

    #[test]
    #[should_panic(expected = "resource budget")]
    fn oversized_slot_grid_is_fatal() {
        let scheduler = scheduler(SchedulerRole::DownlinkMaster);
        // 8 slots x 250us = 2 ms does not fit into 1 ms
        scheduler.borrow_mut().set_duration(1e-3);
        scheduler.borrow_mut().schedule(classified(4, 20));
        Scheduler::start_scheduling(&scheduler);
    }

    #[test]
    fn receptors_inject_backlog_during_the_pass() {
        let scheduler = scheduler(SchedulerRole::DownlinkMaster);
        let injected = {
            let weak = Rc::downgrade(&scheduler);
            Rc::new(move || {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.borrow_mut().schedule(classified(3, 20));
                }
            })
        };
        scheduler.borrow_mut().add_receptor(injected);

        Scheduler::start_scheduling(&scheduler);
        assert_eq!(scheduler.borrow().bursts().len(), 1);
        assert_eq!(scheduler.borrow().bursts()[0].cid, 3);
    }

    #[test]
    fn deleted_connection_resets_its_queue() {
        let scheduler = scheduler(SchedulerRole::DownlinkMaster);
        scheduler.borrow_mut().schedule(classified(4, 100));

        let ci = ConnectionIdentifier::with_cid(
            1,
            4,
            2,
            2,
            ConnectionType::Data,
            airlink_core::Direction::Downlink,
            airlink_core::QosCategory::BestEffort,
        );
        scheduler.borrow_mut().connection_deleted(&ci);

        assert_eq!(scheduler.borrow().queued_pdus(4), 0);
        let stats = scheduler.borrow().stats();
        assert_eq!(stats.reset_compounds, 1);
        assert_eq!(stats.reset_bits, 100);
    }
}
