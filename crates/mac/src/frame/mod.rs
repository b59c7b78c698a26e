//! The frame machinery: timing control and the compound collectors
//! bound to the per-frame phases.

pub mod collector;
pub mod contention;
pub mod data;
pub mod head;
pub mod map;
pub mod timing;

pub use collector::{Activation, CollectorHandle, CollectorMode, CompoundCollector, Receptor};
pub use contention::ContentionCollector;
pub use data::DataCollector;
pub use head::FrameHeadCollector;
pub use map::{DlMapCollector, UlMapCollector};
pub use timing::{ActivationEntry, NewFrameObserver, TimingControl};
