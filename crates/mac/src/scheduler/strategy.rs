//! Allocation strategies.
//!
//! A strategy turns per-CID backlog into bursts on the
//! time/frequency grid of one data phase. In master mode it packs
//! into the whole phase budget; in slave mode it packs into the burst
//! the master granted.

use log::debug;

use crate::pdu::BurstDescriptor;
use crate::pdu::Pdu;
use crate::scheduler::grouper::{Grouper, NoGrouper};
use crate::scheduler::queue::CidQueue;
use crate::scheduler::registry::RegistryProxy;

/// Everything a strategy pass may depend on.
#[derive(Debug, Clone)]
pub struct StrategyInput {
    pub freq_channels: u32,
    pub number_of_time_slots: u32,
    pub slot_duration: f64,
    pub symbol_duration: f64,
    pub beamforming: bool,
    pub max_beams: u32,
    /// Total duration of the phase being filled.
    pub phase_duration: f64,
    /// Slave mode: the burst granted by the master.
    pub granted: Option<BurstDescriptor>,
}

pub struct Burst {
    pub descriptor: BurstDescriptor,
    pub compounds: Vec<Pdu>,
}

pub struct StrategyResult {
    pub bursts: Vec<Burst>,
}

pub trait Strategy {
    fn name(&self) -> &'static str;

    /// One scheduling pass. `None` means nothing could be scheduled,
    /// which is a normal outcome for an idle frame.
    fn schedule(
        &mut self,
        input: &StrategyInput,
        queue: &mut CidQueue,
        registry: &dyn RegistryProxy,
    ) -> Option<StrategyResult>;
}

/// First-come-first-served packing: groups are served in first-seen
/// order, each user's backlog filling the grid from the current
/// cursor until the capacity runs out.
pub struct FcfsStrategy {
    grouper: Box<dyn Grouper>,
}

impl FcfsStrategy {
    pub fn new() -> Self {
        Self {
            grouper: Box::new(NoGrouper),
        }
    }

    pub fn with_grouper(grouper: Box<dyn Grouper>) -> Self {
        Self { grouper }
    }
}

impl Default for FcfsStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for FcfsStrategy {
    fn name(&self) -> &'static str {
        "FCFS"
    }

    fn schedule(
        &mut self,
        input: &StrategyInput,
        queue: &mut CidQueue,
        registry: &dyn RegistryProxy,
    ) -> Option<StrategyResult> {
        let (window_start, window_end) = match &input.granted {
            Some(granted) => (granted.start, granted.stop),
            None => (
                0.0,
                input.number_of_time_slots as f64 * input.slot_duration,
            ),
        };

        // users with backlog, in first-seen order
        let mut users = Vec::new();
        for cid in queue.cids() {
            match registry.user_for_cid(cid) {
                Some(user) => {
                    if !users.contains(&user) {
                        users.push(user);
                    }
                }
                None => {
                    // connection vanished while the backlog waited
                    debug!("no user for CID {}, leaving backlog untouched", cid);
                }
            }
        }
        let groups = self.grouper.group(&users, input.max_beams);

        let mut bursts = Vec::new();
        let mut subchannel = match &input.granted {
            Some(granted) => granted.subchannel,
            None => 0,
        };
        let last_subchannel = match &input.granted {
            Some(granted) => granted.subchannel,
            None => input.freq_channels.saturating_sub(1),
        };
        let mut cursor = window_start;

        'groups: for group in groups {
            for user in group.users {
                let phy_mode = registry.phy_mode_for_user(user);
                let rate = phy_mode.data_rate(input.symbol_duration);

                let cids: Vec<_> = queue
                    .cids()
                    .into_iter()
                    .filter(|cid| registry.user_for_cid(*cid) == Some(user))
                    .collect();

                for cid in cids {
                    let mut compounds = Vec::new();
                    let burst_start = cursor;
                    while let Some(bits) = queue.head_of_line_bits(cid) {
                        let duration = bits as f64 / rate;
                        if cursor + duration > window_end + 1e-12 {
                            break;
                        }
                        compounds.push(queue.pop(cid).expect("head of line exists"));
                        cursor += duration;
                    }

                    if !compounds.is_empty() {
                        bursts.push(Burst {
                            descriptor: BurstDescriptor {
                                user,
                                cid,
                                start: burst_start,
                                stop: cursor,
                                subchannel,
                                phy_mode,
                            },
                            compounds,
                        });
                    }

                    if cursor >= window_end - 1e-12 {
                        if subchannel >= last_subchannel {
                            break 'groups;
                        }
                        subchannel += 1;
                        cursor = window_start;
                    }
                }
            }
        }

        if bursts.is_empty() {
            None
        } else {
            Some(StrategyResult { bursts })
        }
    }
}
