//! Frame-based wireless MAC layer for Airlink
//!
//! The crate hosts the protocol machinery of one station: the
//! classifier that maps PDUs onto connections, the frame timing
//! control that sequences the per-frame phases, the compound
//! collectors bound to those phases, and the schedulers that turn
//! per-connection backlog into transmission bursts.

use thiserror::Error;

use airlink_core::StationId;

pub mod classifier;
pub mod config;
pub mod frame;
pub mod pdu;
pub mod phy;
pub mod ranging;
pub mod scheduler;
pub mod station;

pub use classifier::Classifier;
pub use config::{ContentionConfig, MacConfig, PhyConfig, RangingConfig, SchedulerConfig};
pub use pdu::{ManagementMessage, Pdu};
pub use phy::{PhyAccess, PhyDataTransmission, PhyMode};
pub use station::{Station, StationRegistry};

/// Small slack added to transmission start offsets so that phase
/// boundaries computed from floating point durations never overlap.
pub const ACCURACY_FACTOR: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum MacError {
    #[error("no outgoing connection towards station {0}")]
    NoConnection(StationId),

    #[error("station {0} is not registered")]
    UnknownStation(StationId),
}
