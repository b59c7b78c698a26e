//! Static configuration of one station's MAC.
//!
//! All values are loaded once at construction and immutable
//! afterwards.

use serde::{Deserialize, Serialize};

use crate::phy::PhyMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhyConfig {
    /// Duration of one OFDM symbol in seconds.
    pub symbol_duration: f64,
    /// Duration of one radio frame in seconds.
    pub frame_duration: f64,
    /// Delay between the frame tick and the start of phase
    /// processing.
    pub frame_startup_delay: f64,
    pub default_phy_mode: PhyMode,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            symbol_duration: 100e-6,
            frame_duration: 10e-3,
            frame_startup_delay: 0.0,
            // 192 data subcarriers, QPSK 1/2
            default_phy_mode: PhyMode { bits_per_symbol: 768 },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentionConfig {
    pub enabled: bool,
    pub number_of_slots: u32,
    pub slot_length_in_symbols: u32,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            number_of_slots: 4,
            slot_length_in_symbols: 5,
        }
    }
}

impl ContentionConfig {
    /// The frame time the configured slot grid occupies.
    pub fn grid_duration(&self, symbol_duration: f64) -> f64 {
        self.number_of_slots as f64 * self.slot_length_in_symbols as f64 * symbol_duration
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub freq_channels: u32,
    pub number_of_time_slots: u32,
    /// Duration of one scheduling time slot in seconds.
    pub slot_duration: f64,
    pub beamforming: bool,
    pub max_beams: u32,
    /// Accept a PDU whenever the queue accepts it, independent of the
    /// scheduling window.
    pub always_accept_if_queue_accepts: bool,
    /// Estimated size of one peer compound for the bandwidth-request
    /// shortcut, including IP and MAC header overhead.
    pub bwreq_packet_size_bits: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            freq_channels: 1,
            number_of_time_slots: 8,
            slot_duration: 250e-6,
            beamforming: false,
            max_beams: 1,
            always_accept_if_queue_accepts: true,
            bwreq_packet_size_bits: 8 * 20 + 48 + 800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangingConfig {
    /// Frames to wait for an RNG_RSP before retrying.
    pub timer_waiting_for_rsp: u32,
    pub number_of_retries: u32,
    pub bo_window_size_min: u32,
    pub bo_window_size_max: u32,
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            timer_waiting_for_rsp: 4,
            number_of_retries: 3,
            bo_window_size_min: 2,
            bo_window_size_max: 8,
        }
    }
}

/// Per-phase durations of one frame, in seconds. Phases that consume
/// frame time must sum to at most the frame duration; the timing
/// control checks this at configuration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramePhaseConfig {
    pub frame_head: f64,
    pub dl_map: f64,
    pub ul_map: f64,
    pub contention: f64,
    pub dl_data: f64,
    pub ul_data: f64,
}

impl Default for FramePhaseConfig {
    fn default() -> Self {
        Self {
            frame_head: 100e-6,
            dl_map: 200e-6,
            ul_map: 200e-6,
            contention: 2e-3,
            dl_data: 3e-3,
            ul_data: 3e-3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MacConfig {
    pub phy: PhyConfig,
    pub phases: FramePhaseConfig,
    pub contention: ContentionConfig,
    pub scheduler: SchedulerConfig,
    pub ranging: RangingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phases_fit_into_the_frame() {
        let config = MacConfig::default();
        let sum = config.phases.frame_head
            + config.phases.dl_map
            + config.phases.ul_map
            + config.phases.contention
            + config.phases.dl_data
            + config.phases.ul_data;
        assert!(sum <= config.phy.frame_duration);
    }

    #[test]
    fn default_contention_grid_matches_the_contention_phase() {
        let config = MacConfig::default();
        let grid = config.contention.grid_duration(config.phy.symbol_duration);
        assert!((grid - config.phases.contention).abs() < 1e-9);
    }

    #[test]
    fn default_scheduler_budget_stays_below_the_data_phase() {
        let config = MacConfig::default();
        let budget =
            config.scheduler.number_of_time_slots as f64 * config.scheduler.slot_duration;
        assert!(budget < config.phases.dl_data);
        assert!(budget < config.phases.ul_data);
    }
}
