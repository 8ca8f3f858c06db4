//! Instrument capability traits.
//!
//! The acquisition loop only ever talks to two narrow capabilities: reading
//! a frequency for the routed channel, and capturing a windowed etalon scan.
//! Vendor drivers live behind these traits out of tree; the crate ships the
//! simulation backends in [`sim`].
//!
//! Both capabilities are async, take `&self` (interior mutability for device
//! state), and answer within a bounded time or return a [`DeviceError`].
//! The loop additionally wraps every call in its own timeout.

pub mod sim;

use async_trait::async_trait;

use crate::channel::ChannelConfig;
use crate::error::DeviceError;
use crate::measurement::{OsaTrace, RawReading};

pub use sim::{SimulatedOsa, SimulatedWavemeter};

/// Capability: triggered frequency read on the routed channel.
#[async_trait]
pub trait FrequencyReader: Send + Sync {
    /// Applies the channel's exposure, triggers a read and returns the raw
    /// outcome. Non-positive frequencies and explicit no-signal codes are
    /// both expressed through [`RawReading`].
    async fn read_frequency(&self, channel: &ChannelConfig) -> Result<RawReading, DeviceError>;

    /// Short device description for log lines.
    fn describe(&self) -> String;
}

/// Capability: windowed analog capture on the etalon path.
#[async_trait]
pub trait EtalonScanner: Send + Sync {
    /// Captures one scan window gated by the channel's trigger line, on the
    /// blue or red etalon input per the channel flag, and returns it
    /// downsampled and scaled.
    async fn scan(&self, channel: &ChannelConfig) -> Result<OsaTrace, DeviceError>;

    /// Short device description for log lines.
    fn describe(&self) -> String;
}

/// Mean-downsamples `samples` by `factor`, then scales and truncates each
/// point to an integer. A trailing partial block is dropped, matching the
/// capture card's whole-block readout.
pub fn downsample_and_scale(samples: &[f64], factor: usize, scale: f64) -> Vec<i32> {
    let factor = factor.max(1);
    samples
        .chunks_exact(factor)
        .map(|block| {
            let mean = block.iter().sum::<f64>() / block.len() as f64;
            (mean * scale) as i32
        })
        .collect()
}
