//! Channel configuration and the registry that owns it.
//!
//! A channel is one named laser routed through the switcher. The registry is
//! built once from configuration and is immutable for the life of the server
//! process; a config reload replaces the registry wholesale rather than
//! mutating it while a scan is in flight.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::WavemuxError;
use crate::measurement::Source;

fn default_exposure_ms() -> u32 {
    10
}

fn default_array() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

fn default_modes() -> Vec<Source> {
    vec![Source::Wavemeter]
}

/// Static configuration of one measurement channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Globally unique channel name; the identity key everywhere else.
    pub name: String,
    /// Reference frequency in Hz. Detuning is measured relative to this.
    pub reference: f64,
    /// Wavemeter exposure time in milliseconds.
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: u32,
    /// 1-based physical position on the switcher.
    pub switcher_position: usize,
    /// CCD array index on the wavemeter used for this channel.
    #[serde(default = "default_array")]
    pub array: u32,
    /// Selects the blue etalon input/trigger pair for OSA scans; red otherwise.
    #[serde(default)]
    pub use_blue_etalon: bool,
    /// Inactive channels are skipped by the acquisition cycle entirely.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Which instrument reads this channel gets per cycle. A channel may
    /// carry both; it then yields one measurement per source per cycle.
    #[serde(default = "default_modes")]
    pub modes: Vec<Source>,
}

impl ChannelConfig {
    /// True when `source` is part of this channel's mode set.
    pub fn has_mode(&self, source: Source) -> bool {
        self.modes.contains(&source)
    }
}

/// Immutable, ordered set of configured channels.
///
/// Preserves configuration order (the acquisition cycle visits channels in
/// this order) and guarantees name and switcher-position uniqueness.
#[derive(Debug)]
pub struct ChannelRegistry {
    channels: Vec<ChannelConfig>,
    by_name: HashMap<String, usize>,
}

impl ChannelRegistry {
    /// Builds a registry, rejecting duplicate names, duplicate switcher
    /// positions, and channels with an empty or repeating mode set.
    pub fn new(channels: Vec<ChannelConfig>) -> Result<Self, WavemuxError> {
        let mut by_name = HashMap::with_capacity(channels.len());
        let mut positions = HashMap::with_capacity(channels.len());
        for (idx, channel) in channels.iter().enumerate() {
            if by_name.insert(channel.name.clone(), idx).is_some() {
                return Err(WavemuxError::Configuration(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            if let Some(other) = positions.insert(channel.switcher_position, &channel.name) {
                return Err(WavemuxError::Configuration(format!(
                    "channels '{}' and '{}' share switcher position {}",
                    other, channel.name, channel.switcher_position
                )));
            }
            if channel.modes.is_empty() {
                return Err(WavemuxError::Configuration(format!(
                    "channel '{}' has an empty mode set",
                    channel.name
                )));
            }
            for source in [Source::Wavemeter, Source::Osa] {
                if channel.modes.iter().filter(|m| **m == source).count() > 1 {
                    return Err(WavemuxError::Configuration(format!(
                        "channel '{}' lists mode '{}' more than once",
                        channel.name, source
                    )));
                }
            }
        }
        Ok(Self { channels, by_name })
    }

    /// Looks a channel up by name.
    pub fn get(&self, name: &str) -> Option<&ChannelConfig> {
        self.by_name.get(name).map(|&idx| &self.channels[idx])
    }

    /// True when `name` is a configured channel.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All channels in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter()
    }

    /// Channels the acquisition cycle should visit, in configuration order.
    pub fn active(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.active)
    }

    /// Number of configured channels, active or not.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channels are configured.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Highest switcher position any channel uses, for bounds probing.
    pub fn max_position(&self) -> usize {
        self.channels
            .iter()
            .map(|c| c.switcher_position)
            .max()
            .unwrap_or(0)
    }
}
