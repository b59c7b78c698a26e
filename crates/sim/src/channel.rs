//! Simulated radio channel.
//!
//! Implements the MAC's PHY transmission contract: a stamped PDU is
//! delivered to its destination (or, for broadcasts, to every other
//! station of the cell) after its transmission window plus
//! propagation latency and jitter, unless the loss draw eats it.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use airlink_core::EventScheduler;
use airlink_mac::station::StationRegistry;
use airlink_mac::{Pdu, PhyDataTransmission};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub loss_probability: f32,
    /// Propagation plus processing delay in seconds.
    pub latency: f64,
    /// Standard deviation of the per-PDU latency jitter.
    pub latency_jitter: f64,
    pub seed: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            loss_probability: 0.05,
            latency: 50e-6,
            latency_jitter: 10e-6,
            seed: 7,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelStats {
    pub pdus_sent: u64,
    pub pdus_dropped: u64,
    pub bits_sent: u64,
}

pub struct RadioChannel {
    kernel: Rc<EventScheduler>,
    stations: Rc<StationRegistry>,
    config: ChannelConfig,
    rng: RefCell<StdRng>,
    stats: RefCell<ChannelStats>,
}

impl RadioChannel {
    pub fn new(
        kernel: Rc<EventScheduler>,
        stations: Rc<StationRegistry>,
        config: ChannelConfig,
    ) -> Rc<Self> {
        let rng = StdRng::seed_from_u64(config.seed);
        Rc::new(Self {
            kernel,
            stations,
            config,
            rng: RefCell::new(rng),
            stats: RefCell::new(ChannelStats::default()),
        })
    }

    pub fn stats(&self) -> ChannelStats {
        *self.stats.borrow()
    }

    fn delay(&self) -> f64 {
        let mut rng = self.rng.borrow_mut();
        let jitter = if self.config.latency_jitter > 0.0 {
            Normal::new(0.0, self.config.latency_jitter)
                .expect("jitter deviation is finite")
                .sample(&mut *rng)
        } else {
            0.0
        };
        (self.config.latency + jitter).max(0.0)
    }

    fn lost(&self) -> bool {
        self.rng.borrow_mut().random::<f32>() < self.config.loss_probability
    }
}

impl PhyDataTransmission for RadioChannel {
    fn send_data(&self, pdu: Pdu) {
        let access = pdu
            .phy
            .clone()
            .expect("PDU reached the PHY without an access descriptor");

        if !pdu.payload().is_empty() {
            let head = &pdu.payload()[..pdu.payload().len().min(8)];
            trace!(
                "channel: {} -> {:?}, payload {}…",
                access.source,
                access.destination,
                hex::encode(head)
            );
        }

        let targets: Vec<_> = match access.destination {
            Some(destination) => match self.stations.get(destination) {
                Some(station) => vec![station],
                None => {
                    warn!("channel: station {} not found, dropping PDU", destination);
                    Vec::new()
                }
            },
            None => self
                .stations
                .all()
                .into_iter()
                .filter(|station| station.id() != access.source)
                .collect(),
        };

        {
            let mut stats = self.stats.borrow_mut();
            stats.pdus_sent += 1;
            stats.bits_sent += pdu.length_bits() as u64;
        }

        for target in targets {
            if self.lost() {
                self.stats.borrow_mut().pdus_dropped += 1;
                debug!("channel: simulated PDU loss towards {}", target.id());
                continue;
            }

            let deliver_at = (access.transmission_stop + self.delay()).max(self.kernel.now());
            let pdu = pdu.clone();
            self.kernel
                .schedule_at(deliver_at, move || target.on_data(pdu));
        }
    }
}
