//! Data-phase collector.
//!
//! Thin adapter between the timing control and up to two scheduler
//! roles: a transmitting one and a receiving one. The activation mode
//! selects which role a phase drives.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use airlink_core::{EventHandle, EventScheduler};

use crate::frame::collector::{CollectorMode, CompoundCollector};
use crate::frame::timing::TimingControl;
use crate::pdu::Pdu;
use crate::phy::PhyDataTransmission;
use crate::scheduler::Scheduler;

pub struct DataCollector {
    name: String,
    tx_scheduler: Option<Rc<RefCell<Scheduler>>>,
    rx_scheduler: Option<Rc<RefCell<Scheduler>>>,
    phy: Rc<dyn PhyDataTransmission>,
    kernel: Rc<EventScheduler>,
    timing: Weak<RefCell<TimingControl>>,
    phase_duration: f64,
    current_mode: Option<CollectorMode>,
    timeout: Option<EventHandle>,
    weak_self: Weak<RefCell<DataCollector>>,
}

impl DataCollector {
    pub fn new(
        name: impl Into<String>,
        tx_scheduler: Option<Rc<RefCell<Scheduler>>>,
        rx_scheduler: Option<Rc<RefCell<Scheduler>>>,
        phy: Rc<dyn PhyDataTransmission>,
        kernel: Rc<EventScheduler>,
        timing: Weak<RefCell<TimingControl>>,
    ) -> Rc<RefCell<Self>> {
        let collector = Rc::new(RefCell::new(Self {
            name: name.into(),
            tx_scheduler,
            rx_scheduler,
            phy,
            kernel,
            timing,
            phase_duration: 0.0,
            current_mode: None,
            timeout: None,
            weak_self: Weak::new(),
        }));
        collector.borrow_mut().weak_self = Rc::downgrade(&collector);
        collector
    }

    pub fn tx_scheduler(&self) -> Option<Rc<RefCell<Scheduler>>> {
        self.tx_scheduler.clone()
    }

    pub fn rx_scheduler(&self) -> Option<Rc<RefCell<Scheduler>>> {
        self.rx_scheduler.clone()
    }

    fn scheduler_for(&self, mode: CollectorMode) -> Option<Rc<RefCell<Scheduler>>> {
        match mode {
            CollectorMode::Sending => self.tx_scheduler.clone(),
            CollectorMode::Receiving => self.rx_scheduler.clone(),
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

impl CompoundCollector for DataCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_maximum_duration(&mut self, duration: f64) {
        self.phase_duration = duration;
    }

    fn maximum_duration(&self) -> f64 {
        self.phase_duration
    }

    fn start_collection(&mut self, mode: CollectorMode) {
        self.current_mode = Some(mode);
        if let Some(scheduler) = self.scheduler_for(mode) {
            scheduler.borrow_mut().set_duration(self.phase_duration);
            Scheduler::start_scheduling(&scheduler);
        }
    }

    fn finish_collection(&mut self) {
        if let Some(mode) = self.current_mode {
            if let Some(scheduler) = self.scheduler_for(mode) {
                scheduler.borrow_mut().finish_scheduling();
            }
        }
    }

    fn start(&mut self, mode: CollectorMode) {
        if let Some(scheduler) = self.scheduler_for(mode) {
            Scheduler::deliver_schedule(&scheduler, &self.phy);
        }

        let weak = self.weak_self.clone();
        self.timeout = Some(self.kernel.schedule_in(self.phase_duration, move || {
            if let Some(collector) = weak.upgrade() {
                DataCollector::on_timeout(&collector);
            }
        }));
    }

    fn stop(&mut self) {
        if let Some(handle) = self.timeout.take() {
            self.kernel.cancel(handle);
        }
    }

    fn is_accepting(&self, pdu: &Pdu) -> bool {
        let tx = self
            .tx_scheduler
            .as_ref()
            .map(|s| s.borrow().is_accepting(pdu))
            .unwrap_or(false);
        let rx = self
            .rx_scheduler
            .as_ref()
            .map(|s| s.borrow().is_accepting(pdu))
            .unwrap_or(false);
        tx || rx
    }

    fn send_data(&mut self, pdu: Pdu) {
        if let Some(rx) = &self.rx_scheduler {
            if rx.borrow().is_accepting(&pdu) {
                rx.borrow_mut().schedule(pdu);
                return;
            }
        }
        if let Some(tx) = &self.tx_scheduler {
            if tx.borrow().is_accepting(&pdu) {
                tx.borrow_mut().schedule(pdu);
                return;
            }
        }
        panic!("{}: no scheduler accepts the compound as requested", self.name);
    }
}
