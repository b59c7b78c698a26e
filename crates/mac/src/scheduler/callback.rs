//! Converts abstract bursts into concrete PHY transmit instructions.
//!
//! PDUs are stamped with phase-relative access descriptors when their
//! burst is scheduled; `deliver_now` shifts them to absolute time and
//! flushes them to the PHY.

use std::collections::VecDeque;

use log::info;

use airlink_core::{StationId, Time};

use crate::pdu::Pdu;
use crate::phy::{PhyAccess, PhyDataTransmission, BROADCAST_STATION};
use crate::scheduler::strategy::Burst;

pub struct Callback {
    name: String,
    uplink: bool,
    source: StationId,
    symbol_duration: f64,
    scheduled: VecDeque<Pdu>,
}

impl Callback {
    pub fn new(
        name: impl Into<String>,
        uplink: bool,
        source: StationId,
        symbol_duration: f64,
    ) -> Self {
        Self {
            name: name.into(),
            uplink,
            source,
            symbol_duration,
            scheduled: VecDeque::new(),
        }
    }

    /// Stamp every compound of the burst with its transmit window,
    /// phase-relative for now.
    pub fn schedule_burst(&mut self, burst: Burst) {
        let descriptor = burst.descriptor;
        let rate = descriptor.phy_mode.data_rate(self.symbol_duration);
        let mut pdu_pointer = descriptor.start;

        for mut pdu in burst.compounds {
            let duration = pdu.length_bits() as f64 / rate;
            let destination = if descriptor.user == BROADCAST_STATION {
                None
            } else {
                Some(descriptor.user)
            };

            info!(
                "{}: PDU scheduled, direction {}, user {}, subchannel {}, start {} end {}",
                self.name,
                if self.uplink { "UL" } else { "DL" },
                descriptor.user,
                descriptor.subchannel,
                pdu_pointer,
                pdu_pointer + duration
            );

            pdu.phy = Some(PhyAccess {
                source: self.source,
                destination,
                transmission_start: pdu_pointer,
                transmission_stop: pdu_pointer + duration,
                phy_mode: descriptor.phy_mode,
            });
            pdu_pointer += duration;
            self.scheduled.push_back(pdu);
        }
    }

    /// Shift the pending compounds to absolute time and hand them to
    /// the PHY. The PHY refusing a compound the scheduler reserved
    /// capacity for is a contract violation.
    pub fn deliver_now(&mut self, phy: &dyn PhyDataTransmission, now: Time) {
        while let Some(mut pdu) = self.scheduled.pop_front() {
            let access = pdu.phy.as_mut().expect("scheduled PDU without PHY access");
            access.transmission_start += now;
            access.transmission_stop += now;

            assert!(
                phy.is_accepting(),
                "lower layer is not accepting a scheduled PDU but is supposed to"
            );
            phy.send_data(pdu);
        }
    }

    /// Drop the pending compounds without transmitting; the uplink
    /// master's allocation only exists as bookkeeping for the MAP.
    pub fn clear(&mut self) {
        self.scheduled.clear();
    }

    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::BurstDescriptor;
    use crate::phy::PhyMode;
    use std::cell::RefCell;

    struct RecordingPhy {
        sent: RefCell<Vec<Pdu>>,
    }

    impl PhyDataTransmission for RecordingPhy {
        fn send_data(&self, pdu: Pdu) {
            self.sent.borrow_mut().push(pdu);
        }
    }

    fn classified(cid: i32, bits: usize) -> Pdu {
        let mut pdu = Pdu::fake(bits);
        pdu.set_cid(cid);
        pdu
    }

    #[test]
    fn compounds_are_stamped_sequentially_within_the_burst() {
        let mut callback = Callback::new("BS1.dl", false, 1, 100e-6);
        let burst = Burst {
            descriptor: BurstDescriptor {
                user: 2,
                cid: 4,
                start: 1e-3,
                stop: 2e-3,
                subchannel: 0,
                phy_mode: PhyMode { bits_per_symbol: 4 },
            },
            compounds: vec![classified(4, 20), classified(4, 20)],
        };
        callback.schedule_burst(burst);
        assert_eq!(callback.pending(), 2);

        let phy = RecordingPhy {
            sent: RefCell::new(Vec::new()),
        };
        callback.deliver_now(&phy, 10.0);

        let sent = phy.sent.borrow();
        let first = sent[0].phy.as_ref().unwrap();
        let second = sent[1].phy.as_ref().unwrap();
        // 20 bits at 40 kbit/s = 0.5 ms each, shifted by now
        assert!((first.transmission_start - 10.001).abs() < 1e-9);
        assert!((first.transmission_stop - 10.0015).abs() < 1e-9);
        assert!((second.transmission_start - 10.0015).abs() < 1e-9);
        assert_eq!(first.destination, Some(2));
        assert_eq!(callback.pending(), 0);
    }

    #[test]
    fn broadcast_user_maps_to_a_broadcast_descriptor() {
        let mut callback = Callback::new("BS1.dl", false, 1, 100e-6);
        callback.schedule_burst(Burst {
            descriptor: BurstDescriptor {
                user: BROADCAST_STATION,
                cid: 0,
                start: 0.0,
                stop: 1e-3,
                subchannel: 0,
                phy_mode: PhyMode { bits_per_symbol: 4 },
            },
            compounds: vec![classified(0, 20)],
        });

        let phy = RecordingPhy {
            sent: RefCell::new(Vec::new()),
        };
        callback.deliver_now(&phy, 0.0);
        assert_eq!(phy.sent.borrow()[0].phy.as_ref().unwrap().destination, None);
    }
}
