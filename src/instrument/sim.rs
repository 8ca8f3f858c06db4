//! Simulation backends.
//!
//! Deterministic-ish synthetic instruments so the whole pipeline runs
//! without hardware. Each channel gets a fixed pseudo-random detuning offset
//! derived from its switcher position, so repeated runs against the same
//! configuration show the same lasers sitting at the same places, with
//! per-read wobble on top.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;

use crate::channel::ChannelConfig;
use crate::config::OsaSection;
use crate::error::DeviceError;
use crate::instrument::{downsample_and_scale, EtalonScanner, FrequencyReader};
use crate::measurement::{OsaTrace, RawReading};

/// Fixed per-channel offset: uniform in ±2 GHz, seeded by switcher position.
fn channel_offset(position: usize) -> f64 {
    let mut rng = StdRng::seed_from_u64(position as u64);
    rng.gen_range(-2e9..2e9)
}

/// Synthetic wavemeter.
///
/// Reads take the channel's exposure time and yield the channel reference
/// plus its fixed offset plus ±1 MHz of wobble. A configurable fraction of
/// reads instead reports the firmware's no-signal codes (-3 underexposed,
/// -4 overexposed).
pub struct SimulatedWavemeter {
    rng: Mutex<StdRng>,
    no_signal_probability: f64,
}

impl SimulatedWavemeter {
    /// Creates a generator with a 10% no-signal rate, seeded from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            no_signal_probability: 0.1,
        }
    }

    /// Overrides the no-signal rate (0.0 disables error injection; useful
    /// in tests that assert on values).
    pub fn with_no_signal_probability(mut self, probability: f64) -> Self {
        self.no_signal_probability = probability.clamp(0.0, 1.0);
        self
    }

    fn draw(&self) -> (f64, f64) {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (rng.gen::<f64>(), rng.gen_range(-1e6..1e6))
    }
}

#[async_trait]
impl FrequencyReader for SimulatedWavemeter {
    async fn read_frequency(&self, channel: &ChannelConfig) -> Result<RawReading, DeviceError> {
        // The read takes roughly the exposure time, like the real article.
        sleep(Duration::from_millis(u64::from(channel.exposure_ms))).await;
        let (fault, wobble) = self.draw();
        if fault < self.no_signal_probability / 2.0 {
            return Ok(RawReading::NoSignal(-3));
        }
        if fault < self.no_signal_probability {
            return Ok(RawReading::NoSignal(-4));
        }
        let value = channel.reference + channel_offset(channel.switcher_position) + wobble;
        Ok(RawReading::Frequency(value))
    }

    fn describe(&self) -> String {
        "simulated wavemeter".to_string()
    }
}

/// Synthetic etalon scanner.
///
/// Produces a sum of Lorentzian peaks over the scan window, with peak
/// placement seeded by the channel's switcher position and nudged by the
/// blue/red input flag, then downsampled and scaled like the real capture.
pub struct SimulatedOsa {
    geometry: OsaSection,
    rng: Mutex<StdRng>,
}

impl SimulatedOsa {
    /// Creates a scanner with the given scan geometry, seeded from `seed`.
    pub fn new(geometry: OsaSection, seed: u64) -> Self {
        Self {
            geometry,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl EtalonScanner for SimulatedOsa {
    async fn scan(&self, channel: &ChannelConfig) -> Result<OsaTrace, DeviceError> {
        // Stand-in for the gated capture window.
        sleep(Duration::from_millis(1)).await;

        let n = self.geometry.samples;
        let mut peak_rng = StdRng::seed_from_u64(channel.switcher_position as u64 ^ 0x5A);
        let shift: f64 = if channel.use_blue_etalon { 0.07 } else { 0.0 };
        let peaks: Vec<(f64, f64, f64)> = (0..3)
            .map(|i| {
                let centre = (peak_rng.gen_range(0.1..0.9) + shift).fract() * n as f64;
                let width = n as f64 / peak_rng.gen_range(40.0..80.0);
                let amplitude = 1.0 / f64::from(i + 1);
                (centre, width, amplitude)
            })
            .collect();

        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let samples: Vec<f64> = (0..n)
            .map(|x| {
                let x = x as f64;
                let signal: f64 = peaks
                    .iter()
                    .map(|&(c, w, a)| a / (1.0 + ((x - c) / w).powi(2)))
                    .sum();
                signal + rng.gen_range(-5e-3..5e-3)
            })
            .collect();
        drop(rng);

        Ok(OsaTrace {
            channel: channel.name.clone(),
            timestamp: Utc::now(),
            points: downsample_and_scale(&samples, self.geometry.downsample, self.geometry.scale),
        })
    }

    fn describe(&self) -> String {
        format!(
            "simulated etalon scanner ({} samples / {})",
            self.geometry.samples, self.geometry.downsample
        )
    }
}
