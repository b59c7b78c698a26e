//! Simulation tools for Airlink

pub mod channel;
pub mod scenarios;

pub use channel::{ChannelConfig, RadioChannel};

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> ChannelConfig {
        ChannelConfig {
            loss_probability: 0.01,
            latency: 30e-6,
            latency_jitter: 5e-6, // ±5us jitter (good conditions)
            seed: 7,
        }
    }

    pub fn average_conditions() -> ChannelConfig {
        ChannelConfig {
            loss_probability: 0.05,
            latency: 50e-6,
            latency_jitter: 10e-6, // ±10us jitter (average conditions)
            seed: 7,
        }
    }

    pub fn poor_conditions() -> ChannelConfig {
        ChannelConfig {
            loss_probability: 0.20,
            latency: 80e-6,
            latency_jitter: 20e-6, // ±20us jitter (poor conditions)
            seed: 7,
        }
    }

    /// Lossless, jitter-free channel for deterministic tests.
    pub fn ideal_conditions() -> ChannelConfig {
        ChannelConfig {
            loss_probability: 0.0,
            latency: 30e-6,
            latency_jitter: 0.0,
            seed: 7,
        }
    }
}
