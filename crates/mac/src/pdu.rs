//! The compound model: a PDU plus the per-stage command metadata it
//! accumulates while traversing the protocol stack.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use airlink_core::{Cid, QosCategory, StationId};

use crate::phy::{PhyAccess, PhyMode};

/// Generic MAC header overhead in bits (without CRC).
pub const MAC_HEADER_BITS: usize = 48;

/// Resource allocation of one burst, as carried in a MAP message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstDescriptor {
    pub user: StationId,
    pub cid: Cid,
    /// Offset of the burst from the start of its phase, in seconds.
    pub start: f64,
    pub stop: f64,
    pub subchannel: u32,
    pub phy_mode: PhyMode,
}

/// Broadcast description of one frame's resource allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMessage {
    pub base_station: StationId,
    pub frame_number: u64,
    /// Duration of the described data phase in seconds.
    pub phase_duration: f64,
    pub bursts: Vec<BurstDescriptor>,
}

/// The closed world of management messages. An unrecognized type
/// reaching a control-plane handler is a version mismatch and halts
/// the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManagementMessage {
    FrameHead {
        base_station: StationId,
        frame_number: u64,
    },
    DlMap(MapMessage),
    UlMap(MapMessage),
    RngReq {
        transaction_id: u16,
        base_station: StationId,
        subscriber_station: StationId,
    },
    RngRsp {
        transaction_id: u16,
        base_station: StationId,
        subscriber_station: StationId,
        basic_cid: Cid,
        primary_cid: Cid,
    },
}

impl ManagementMessage {
    /// Serialized size in bits, used to derive transmission durations.
    pub fn size_bits(&self) -> usize {
        let encoded = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .expect("management messages always serialize");
        encoded.len() * 8
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ManagementMessage::FrameHead { .. } => "FCH",
            ManagementMessage::DlMap(_) => "DL-MAP",
            ManagementMessage::UlMap(_) => "UL-MAP",
            ManagementMessage::RngReq { .. } => "RNG_REQ",
            ManagementMessage::RngRsp { .. } => "RNG_RSP",
        }
    }
}

/// Upper-layer addressing attached by the convergence layer.
#[derive(Debug, Clone, PartialEq)]
pub struct UpperCommand {
    pub source: StationId,
    pub dest: StationId,
    pub qos: QosCategory,
}

/// The classifier's per-PDU command: the CID all further dispatch
/// keys on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierCommand {
    pub id: Cid,
}

#[derive(Debug, Clone)]
pub struct Pdu {
    payload: Bytes,
    length_bits: usize,
    pub upper: Option<UpperCommand>,
    pub classifier: Option<ClassifierCommand>,
    pub phy: Option<PhyAccess>,
    pub mgmt: Option<ManagementMessage>,
}

impl Pdu {
    /// A data PDU carrying an upper-layer payload.
    pub fn data(source: StationId, dest: StationId, qos: QosCategory, payload: Bytes) -> Self {
        let length_bits = payload.len() * 8 + MAC_HEADER_BITS;
        Self {
            payload,
            length_bits,
            upper: Some(UpperCommand { source, dest, qos }),
            classifier: None,
            phy: None,
            mgmt: None,
        }
    }

    /// A management PDU; its length follows from the serialized
    /// message.
    pub fn management(message: ManagementMessage) -> Self {
        let length_bits = message.size_bits() + MAC_HEADER_BITS;
        Self {
            payload: Bytes::new(),
            length_bits,
            upper: None,
            classifier: None,
            phy: None,
            mgmt: Some(message),
        }
    }

    /// A synthetic PDU of the given size, standing in for backlog the
    /// scheduler only knows by volume (bandwidth-request shortcut).
    pub fn fake(length_bits: usize) -> Self {
        Self {
            payload: Bytes::new(),
            length_bits,
            upper: None,
            classifier: None,
            phy: None,
            mgmt: None,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn length_bits(&self) -> usize {
        self.length_bits
    }

    /// The stamped CID, if the PDU has been classified.
    pub fn cid(&self) -> Option<Cid> {
        self.classifier.map(|command| command.id)
    }

    pub fn set_cid(&mut self, cid: Cid) {
        self.classifier = Some(ClassifierCommand { id: cid });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_pdu_length_includes_the_mac_header() {
        let pdu = Pdu::data(1, 2, QosCategory::BestEffort, Bytes::from(vec![0u8; 100]));
        assert_eq!(pdu.length_bits(), 800 + MAC_HEADER_BITS);
    }

    #[test]
    fn management_pdu_length_follows_the_message_size() {
        let message = ManagementMessage::RngReq {
            transaction_id: 1,
            base_station: 1,
            subscriber_station: 2,
        };
        let pdu = Pdu::management(message.clone());
        assert_eq!(pdu.length_bits(), message.size_bits() + MAC_HEADER_BITS);
        assert!(pdu.length_bits() > MAC_HEADER_BITS);
    }

    #[test]
    fn classification_stamps_the_cid() {
        let mut pdu = Pdu::fake(128);
        assert_eq!(pdu.cid(), None);
        pdu.set_cid(7);
        assert_eq!(pdu.cid(), Some(7));
    }
}
