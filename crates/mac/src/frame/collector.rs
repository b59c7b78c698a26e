//! The compound collector contract the timing control drives.

use std::cell::RefCell;
use std::rc::Rc;

use crate::pdu::Pdu;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorMode {
    Sending,
    Receiving,
}

/// What the timing control asks a collector to do when an activation
/// entry is reached. `StartCollection` and `FinishCollection` are
/// applied immediately during the activation walk; `Start` and
/// `Pause` consume frame time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    StartCollection,
    FinishCollection,
    Start,
    Pause,
}

/// Wakes an upstream compound source so it can push backlog into the
/// component that invoked it.
pub type Receptor = Rc<dyn Fn()>;

/// A phase-scoped buffer for PDUs, driven by the timing control.
pub trait CompoundCollector {
    fn name(&self) -> &str;

    /// The phase budget assigned by the current activation entry.
    fn set_maximum_duration(&mut self, duration: f64);
    fn maximum_duration(&self) -> f64;

    /// Open the collection window for this frame.
    fn start_collection(&mut self, mode: CollectorMode);

    /// Close the collection window; by default nothing to do.
    fn finish_collection(&mut self) {}

    /// The phase begins: deliver buffered PDUs to the lower layer.
    fn start(&mut self, mode: CollectorMode);

    /// The phase is over; deactivate and cancel pending timers.
    fn stop(&mut self);

    fn is_accepting(&self, pdu: &Pdu) -> bool;

    /// Buffer a PDU for transmission within this phase. Callers must
    /// check [`CompoundCollector::is_accepting`] first.
    fn send_data(&mut self, pdu: Pdu);
}

pub type CollectorHandle = Rc<RefCell<dyn CompoundCollector>>;
