//! The contract between the MAC and the physical layer.
//!
//! The MAC stamps every outgoing PDU with a [`PhyAccess`] descriptor
//! and hands it to a [`PhyDataTransmission`] service. What happens on
//! the air (propagation, loss, interference) is the service's
//! business; the simulated channel lives in the sim crate.

use serde::{Deserialize, Serialize};

use airlink_core::{StationId, Time};

use crate::pdu::Pdu;

/// Station ID used as the broadcast destination within a cell.
pub const BROADCAST_STATION: StationId = 0;

/// A modulation/coding selection. Determines the achievable data rate
/// for a given symbol duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyMode {
    pub bits_per_symbol: u32,
}

impl PhyMode {
    /// Data rate in bit/s.
    pub fn data_rate(&self, symbol_duration: f64) -> f64 {
        self.bits_per_symbol as f64 / symbol_duration
    }
}

/// Per-PDU transmission descriptor.
///
/// Start and stop are phase-relative offsets while the PDU sits in a
/// collector and become absolute simulation times when the owning
/// phase starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyAccess {
    pub source: StationId,
    /// `None` broadcasts to the whole cell.
    pub destination: Option<StationId>,
    pub transmission_start: Time,
    pub transmission_stop: Time,
    pub phy_mode: PhyMode,
}

/// Transmission service registered with the MAC once at startup.
pub trait PhyDataTransmission {
    fn send_data(&self, pdu: Pdu);

    /// The PHY accepts everything the MAC has already reserved
    /// capacity for; a refusal here is a contract violation the
    /// callers treat as fatal.
    fn is_accepting(&self) -> bool {
        true
    }
}
