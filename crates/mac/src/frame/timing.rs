//! Frame-synchronous timing control.
//!
//! Owns the chronologically ordered list of activation entries for
//! one frame and drives the bound compound collectors through it: a
//! periodic tick opens each frame, new-frame observers get a stable
//! view of the station state, then the activation walk applies
//! collection start/finish entries immediately and lets `Start` and
//! `Pause` entries consume frame time through one-shot timeouts.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, info, warn};

use airlink_core::{EventHandle, EventScheduler, Time};

use crate::config::PhyConfig;
use crate::frame::collector::{Activation, CollectorHandle, CollectorMode};

/// Notified once per frame, before any phase activation begins.
pub trait NewFrameObserver {
    fn new_frame(&mut self);
}

#[derive(Clone)]
pub struct ActivationEntry {
    pub action: Activation,
    pub mode: CollectorMode,
    /// `None` only for `Pause` entries.
    pub collector: Option<CollectorHandle>,
    pub duration: f64,
}

enum WalkStep {
    Immediate(ActivationEntry),
    Timed(ActivationEntry),
    Done,
}

pub struct TimingControl {
    name: String,
    kernel: Rc<EventScheduler>,
    frame_duration: f64,
    startup_delay: f64,
    symbol_duration: f64,
    activations: Vec<ActivationEntry>,
    /// Index of the currently active entry; `activations.len()` when
    /// no phase is active.
    walk: usize,
    running: bool,
    frame_start_time: Time,
    periodic: Option<EventHandle>,
    startup: Option<EventHandle>,
    phase: Option<EventHandle>,
    observers: Vec<(u64, Rc<RefCell<dyn NewFrameObserver>>)>,
    next_observer_token: u64,
    weak_self: Weak<RefCell<TimingControl>>,
}

impl TimingControl {
    pub fn new(
        name: impl Into<String>,
        kernel: Rc<EventScheduler>,
        phy: &PhyConfig,
    ) -> Rc<RefCell<Self>> {
        let control = Rc::new(RefCell::new(Self {
            name: name.into(),
            kernel,
            frame_duration: phy.frame_duration,
            startup_delay: phy.frame_startup_delay,
            symbol_duration: phy.symbol_duration,
            activations: Vec::new(),
            walk: 0,
            running: false,
            frame_start_time: 0.0,
            periodic: None,
            startup: None,
            phase: None,
            observers: Vec::new(),
            next_observer_token: 0,
            weak_self: Weak::new(),
        }));
        control.borrow_mut().weak_self = Rc::downgrade(&control);
        control
    }

    /// Install the frame's activation list. The time-consuming
    /// entries must fit into the frame duration; anything else is an
    /// inconsistent static configuration the simulation must not run
    /// with.
    pub fn configure(&mut self, activations: Vec<ActivationEntry>) {
        let mut sum_duration = 0.0;
        for entry in &activations {
            match entry.action {
                Activation::Start | Activation::Pause => sum_duration += entry.duration,
                _ => {}
            }
            if entry.action == Activation::Pause {
                assert!(entry.collector.is_none(), "pause entries carry no collector");
            } else {
                assert!(
                    entry.collector.is_some(),
                    "activation entry without a compound collector"
                );
            }
        }

        info!(
            "{}: {} activations registered at timing control, sum duration: {}, frame duration: {}",
            self.name,
            activations.len(),
            sum_duration,
            self.frame_duration
        );
        assert!(
            sum_duration <= self.frame_duration + 1e-12,
            "the sum of all phases does not fit into the frame duration"
        );

        self.activations = activations;
        self.walk = self.activations.len();
    }

    /// Begin frame processing: the first tick fires one frame
    /// duration from now and re-arms itself every period.
    pub fn start(&mut self) {
        self.walk = self.activations.len();
        self.running = true;
        if self.periodic.is_none() {
            self.arm_periodic();
        }
    }

    /// Suspend phase processing. The periodic tick keeps running so
    /// frame numbering stays aligned; the current phase is cut off
    /// without its completion logic.
    pub fn pause(&mut self) {
        self.running = false;
        self.cancel_one_shots();
        self.deactivate_current();
    }

    /// Cancel the periodic tick and all pending one-shot timeouts.
    pub fn stop(&mut self) {
        if let Some(handle) = self.periodic.take() {
            self.kernel.cancel(handle);
        }
        self.cancel_one_shots();
        self.deactivate_current();
        self.running = false;
    }

    /// Cut off the active phase, if any, without its completion
    /// logic.
    fn deactivate_current(&mut self) {
        if self.walk < self.activations.len() {
            if let Some(collector) = self.activations[self.walk].collector.clone() {
                collector.borrow_mut().stop();
            }
        }
        self.walk = self.activations.len();
    }

    fn cancel_one_shots(&mut self) {
        if let Some(handle) = self.phase.take() {
            self.kernel.cancel(handle);
        }
        if let Some(handle) = self.startup.take() {
            self.kernel.cancel(handle);
        }
    }

    pub fn subscribe_new_frame(&mut self, observer: Rc<RefCell<dyn NewFrameObserver>>) -> u64 {
        let token = self.next_observer_token;
        self.next_observer_token += 1;
        self.observers.push((token, observer));
        token
    }

    pub fn unsubscribe_new_frame(&mut self, token: u64) {
        self.observers.retain(|(t, _)| *t != token);
    }

    /// Offset from the current frame start in whole symbols.
    pub fn offset_symbols(&self) -> u32 {
        let offset = self.kernel.now() - self.frame_start_time;
        (offset / self.symbol_duration) as u32
    }

    pub fn frame_start_time(&self) -> Time {
        self.frame_start_time
    }

    /// A collector reports that its phase is complete. Only the
    /// currently active collector may do so; anything else means two
    /// phases were live at once.
    pub fn finished_phase(&self, collector_name: &str) {
        assert!(
            self.walk < self.activations.len(),
            "{}: phase finished, but no active compound collector",
            self.name
        );
        let active = self.activations[self.walk]
            .collector
            .as_ref()
            .map(|collector| collector.borrow().name().to_string());
        assert_eq!(
            active.as_deref(),
            Some(collector_name),
            "an inactive compound collector has reported to have finished"
        );
        assert!(
            self.phase.is_some(),
            "the current phase finished after the final phase"
        );
        info!("{}: current phase has finished", self.name);
    }

    fn arm_periodic(&mut self) {
        let weak = self.weak_self.clone();
        self.periodic = Some(self.kernel.schedule_in(self.frame_duration, move || {
            if let Some(control) = weak.upgrade() {
                TimingControl::periodically(&control);
            }
        }));
    }

    /// The frame tick: notify new-frame observers, then enter the
    /// activation walk after the configured startup delay.
    fn periodically(this: &Rc<RefCell<TimingControl>>) {
        let (observers, running, startup_delay, kernel) = {
            let mut control = this.borrow_mut();
            control.frame_start_time = control.kernel.now();
            control.arm_periodic();
            (
                control.observers.clone(),
                control.running,
                control.startup_delay,
                control.kernel.clone(),
            )
        };

        for (_, observer) in observers {
            observer.borrow_mut().new_frame();
        }

        if !running {
            return;
        }

        let weak = Rc::downgrade(this);
        let handle = kernel.schedule_in(startup_delay, move || {
            if let Some(control) = weak.upgrade() {
                TimingControl::start_processing_activations(&control);
            }
        });
        this.borrow_mut().startup = Some(handle);
    }

    fn start_processing_activations(this: &Rc<RefCell<TimingControl>>) {
        {
            let mut control = this.borrow_mut();
            if control.walk != control.activations.len() {
                warn!(
                    "{}: frame builder has not yet finished the current frame",
                    control.name
                );
            }
            info!("{}: starting frame", control.name);
            control.walk = 0;
        }
        Self::process_activations(this);
    }

    /// Walk the activation list: apply collection entries
    /// immediately, stop at the first entry that consumes frame time
    /// and arm its timeout.
    fn process_activations(this: &Rc<RefCell<TimingControl>>) {
        loop {
            let step = {
                let mut control = this.borrow_mut();
                if control.walk >= control.activations.len() {
                    WalkStep::Done
                } else {
                    let entry = control.activations[control.walk].clone();
                    match entry.action {
                        Activation::StartCollection | Activation::FinishCollection => {
                            control.walk += 1;
                            WalkStep::Immediate(entry)
                        }
                        Activation::Start | Activation::Pause => WalkStep::Timed(entry),
                    }
                }
            };

            match step {
                WalkStep::Immediate(entry) => {
                    let collector = entry.collector.as_ref().expect("checked at configure");
                    let mut collector = collector.borrow_mut();
                    match entry.action {
                        Activation::StartCollection => {
                            collector.set_maximum_duration(entry.duration);
                            collector.start_collection(entry.mode);
                        }
                        Activation::FinishCollection => collector.finish_collection(),
                        _ => unreachable!(),
                    }
                }
                WalkStep::Timed(entry) => {
                    if let Some(collector) = &entry.collector {
                        let mut collector = collector.borrow_mut();
                        collector.set_maximum_duration(entry.duration);
                        collector.start(entry.mode);
                    }

                    let (kernel, name) = {
                        let control = this.borrow();
                        (control.kernel.clone(), control.name.clone())
                    };
                    let weak = Rc::downgrade(this);
                    let handle = kernel.schedule_in(entry.duration, move || {
                        if let Some(control) = weak.upgrade() {
                            TimingControl::on_phase_timeout(&control);
                        }
                    });
                    this.borrow_mut().phase = Some(handle);

                    match entry.action {
                        Activation::Start => info!(
                            "{}: next phase activated with a duration of {}",
                            name, entry.duration
                        ),
                        _ => info!("{}: pause for a duration of {}", name, entry.duration),
                    }
                    return;
                }
                WalkStep::Done => return,
            }
        }
    }

    /// The current phase's duration has elapsed: stop its collector
    /// and advance the walk.
    fn on_phase_timeout(this: &Rc<RefCell<TimingControl>>) {
        let (collector, name) = {
            let mut control = this.borrow_mut();
            control.phase = None;
            debug!("{}: timing control received timeout", control.name);
            let collector = control.activations[control.walk].collector.clone();
            control.walk += 1;
            (collector, control.name.clone())
        };

        if let Some(collector) = collector {
            // pause entries do not have a compound collector
            collector.borrow_mut().stop();
        }

        let done = {
            let control = this.borrow();
            control.walk >= control.activations.len()
        };
        if done {
            info!("{}: last compound collector finished", name);
        } else {
            Self::process_activations(this);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Pdu;
    use std::cell::Cell;

    /// Records its lifecycle with timestamps and tracks how many
    /// collectors are active at once.
    struct MockCollector {
        name: String,
        max_duration: f64,
        kernel: Rc<EventScheduler>,
        events: Rc<RefCell<Vec<(String, &'static str, Time)>>>,
        active: Rc<Cell<i32>>,
        high_water: Rc<Cell<i32>>,
    }

    impl MockCollector {
        fn new(
            name: &str,
            kernel: Rc<EventScheduler>,
            events: Rc<RefCell<Vec<(String, &'static str, Time)>>>,
            active: Rc<Cell<i32>>,
            high_water: Rc<Cell<i32>>,
        ) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                name: name.to_string(),
                max_duration: 0.0,
                kernel,
                events,
                active,
                high_water,
            }))
        }

        fn log(&self, what: &'static str) {
            self.events
                .borrow_mut()
                .push((self.name.clone(), what, self.kernel.now()));
        }
    }

    impl super::super::collector::CompoundCollector for MockCollector {
        fn name(&self) -> &str {
            &self.name
        }

        fn set_maximum_duration(&mut self, duration: f64) {
            self.max_duration = duration;
        }

        fn maximum_duration(&self) -> f64 {
            self.max_duration
        }

        fn start_collection(&mut self, _mode: CollectorMode) {
            self.log("start_collection");
        }

        fn start(&mut self, _mode: CollectorMode) {
            self.active.set(self.active.get() + 1);
            self.high_water
                .set(self.high_water.get().max(self.active.get()));
            self.log("start");
        }

        fn stop(&mut self) {
            self.active.set(self.active.get() - 1);
            self.log("stop");
        }

        fn is_accepting(&self, _pdu: &Pdu) -> bool {
            false
        }

        fn send_data(&mut self, _pdu: Pdu) {}
    }

    struct Fixture {
        kernel: Rc<EventScheduler>,
        control: Rc<RefCell<TimingControl>>,
        events: Rc<RefCell<Vec<(String, &'static str, Time)>>>,
        high_water: Rc<Cell<i32>>,
    }

    fn fixture(phase_durations: &[(&str, f64)]) -> Fixture {
        let kernel = EventScheduler::new();
        let phy = PhyConfig {
            frame_duration: 10e-3,
            ..PhyConfig::default()
        };
        let control = TimingControl::new("TC", kernel.clone(), &phy);

        let events = Rc::new(RefCell::new(Vec::new()));
        let active = Rc::new(Cell::new(0));
        let high_water = Rc::new(Cell::new(0));

        let mut entries = Vec::new();
        for (name, duration) in phase_durations {
            let collector = MockCollector::new(
                name,
                kernel.clone(),
                events.clone(),
                active.clone(),
                high_water.clone(),
            );
            entries.push(ActivationEntry {
                action: Activation::StartCollection,
                mode: CollectorMode::Sending,
                collector: Some(collector.clone()),
                duration: *duration,
            });
            entries.push(ActivationEntry {
                action: Activation::Start,
                mode: CollectorMode::Sending,
                collector: Some(collector),
                duration: *duration,
            });
        }
        control.borrow_mut().configure(entries);

        Fixture {
            kernel,
            control,
            events,
            high_water,
        }
    }

    fn close(a: Time, b: Time) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn phases_run_sequentially_and_exclusively() {
        let fixture = fixture(&[("A", 2e-3), ("B", 3e-3), ("C", 1e-3)]);
        fixture.control.borrow_mut().start();
        fixture.kernel.run_until(25e-3);

        // at most one collector active at any simulated instant
        assert_eq!(fixture.high_water.get(), 1);

        let events = fixture.events.borrow();
        let first_frame: Vec<_> = events
            .iter()
            .filter(|(_, what, at)| *what == "start" && *at < 20e-3)
            .collect();
        assert_eq!(first_frame.len(), 3);
        // frame begins one period after start; phases back to back
        assert!(close(first_frame[0].2, 10e-3));
        assert!(close(first_frame[1].2, 12e-3));
        assert!(close(first_frame[2].2, 15e-3));
    }

    #[test]
    fn collection_entries_apply_before_the_first_phase_starts() {
        let fixture = fixture(&[("A", 2e-3), ("B", 3e-3)]);
        fixture.control.borrow_mut().start();
        fixture.kernel.run_until(11e-3);

        let events = fixture.events.borrow();
        let collected: Vec<_> = events
            .iter()
            .filter(|(_, what, _)| *what == "start_collection")
            .collect();
        // both collection windows open at the frame tick, before B's
        // phase begins
        assert_eq!(collected.len(), 2);
        assert!(close(collected[0].2, 10e-3));
        assert!(close(collected[1].2, 10e-3));
    }

    #[test]
    fn frames_repeat_every_period() {
        let fixture = fixture(&[("A", 2e-3)]);
        fixture.control.borrow_mut().start();
        fixture.kernel.run_until(35e-3);

        let events = fixture.events.borrow();
        let starts: Vec<_> = events
            .iter()
            .filter(|(_, what, _)| *what == "start")
            .map(|(_, _, at)| *at)
            .collect();
        assert_eq!(starts.len(), 3);
        for (start, expected) in starts.iter().zip([10e-3, 20e-3, 30e-3]) {
            assert!(close(*start, expected));
        }
    }

    #[test]
    fn pause_suspends_phase_processing_but_keeps_the_tick() {
        let fixture = fixture(&[("A", 2e-3)]);
        fixture.control.borrow_mut().start();
        fixture.kernel.run_until(11e-3);
        fixture.control.borrow_mut().pause();
        fixture.kernel.run_until(25e-3);

        {
            let events = fixture.events.borrow();
            let starts = events.iter().filter(|(_, what, _)| *what == "start").count();
            assert_eq!(starts, 1);
        }

        // resuming picks the next frame tick up again
        fixture.control.borrow_mut().start();
        fixture.kernel.run_until(35e-3);
        let events = fixture.events.borrow();
        let starts = events.iter().filter(|(_, what, _)| *what == "start").count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn stop_cancels_the_periodic_tick() {
        let fixture = fixture(&[("A", 2e-3)]);
        fixture.control.borrow_mut().start();
        fixture.kernel.run_until(11e-3);
        fixture.control.borrow_mut().stop();
        fixture.kernel.run();

        let events = fixture.events.borrow();
        let starts = events.iter().filter(|(_, what, _)| *what == "start").count();
        assert_eq!(starts, 1);
    }

    #[test]
    #[should_panic(expected = "does not fit into the frame duration")]
    fn overlong_activation_list_is_a_fatal_configuration_error() {
        let kernel = EventScheduler::new();
        let phy = PhyConfig {
            frame_duration: 1e-3,
            ..PhyConfig::default()
        };
        let control = TimingControl::new("TC", kernel, &phy);
        control.borrow_mut().configure(vec![ActivationEntry {
            action: Activation::Pause,
            mode: CollectorMode::Sending,
            collector: None,
            duration: 2e-3,
        }]);
    }

    struct CountingObserver {
        frames: u32,
    }

    impl NewFrameObserver for CountingObserver {
        fn new_frame(&mut self) {
            self.frames += 1;
        }
    }

    #[test]
    fn new_frame_observers_fire_once_per_frame() {
        let fixture = fixture(&[("A", 2e-3)]);
        let observer = Rc::new(RefCell::new(CountingObserver { frames: 0 }));
        let token = fixture
            .control
            .borrow_mut()
            .subscribe_new_frame(observer.clone());

        fixture.control.borrow_mut().start();
        fixture.kernel.run_until(35e-3);
        assert_eq!(observer.borrow().frames, 3);

        fixture.control.borrow_mut().unsubscribe_new_frame(token);
        fixture.kernel.run_until(45e-3);
        assert_eq!(observer.borrow().frames, 3);
    }
}
