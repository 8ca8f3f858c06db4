//! Measurement values and the per-channel latest-value cache.
//!
//! A [`Measurement`] is created by the acquisition loop once per completed
//! read and never mutated afterwards; the next reading for the same channel
//! supersedes it. [`MeasurementLog`] keeps a short ring of recent values per
//! channel, enough to backfill a freshly subscribed client or bridge a
//! momentary fan-out stall, and nothing more. History belongs to the
//! persistence sink.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;

/// Which instrument produced a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Wavelength-meter frequency read.
    Wavemeter,
    /// Etalon scan on the optical spectrum analyzer path.
    Osa,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Wavemeter => write!(f, "wavemeter"),
            Source::Osa => write!(f, "osa"),
        }
    }
}

/// Quality of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// A valid value was read.
    Ok,
    /// The instrument answered but saw no usable signal (under/overexposed).
    NoSignal,
    /// The read failed outright (device error or timeout).
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::NoSignal => write!(f, "no_signal"),
            Status::Error => write!(f, "error"),
        }
    }
}

/// Raw outcome of a single instrument read, before channel attribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawReading {
    /// Measured frequency in Hz. Non-positive values are device error codes
    /// in disguise and are mapped to [`Status::NoSignal`].
    Frequency(f64),
    /// Device-reported no-signal code (-3 underexposed, -4 overexposed on
    /// the usual wavemeter firmware).
    NoSignal(i32),
}

/// Downsampled etalon scan for one channel, in scaled detector units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsaTrace {
    /// Name of the channel the scan was gated on.
    pub channel: String,
    /// When the capture completed.
    pub timestamp: DateTime<Utc>,
    /// Mean-downsampled, scale-truncated samples.
    pub points: Vec<i32>,
}

/// One reading for one channel, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Name of the channel this reading belongs to.
    pub channel: String,
    /// When the read completed.
    pub timestamp: DateTime<Utc>,
    /// Measured frequency in Hz; absent unless `status` is [`Status::Ok`].
    pub value: Option<f64>,
    /// `value` minus the channel's reference frequency, in Hz.
    pub detuning: Option<f64>,
    /// Instrument that produced the reading.
    pub source: Source,
    /// Quality of the reading.
    pub status: Status,
    /// Device error code when `status` is not [`Status::Ok`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
}

impl Measurement {
    /// Attributes a raw reading to a channel, deriving detuning and status.
    pub fn from_reading(channel: &ChannelConfig, source: Source, reading: RawReading) -> Self {
        let (value, detuning, status, error_code) = match reading {
            RawReading::Frequency(v) if v > 0.0 => {
                (Some(v), Some(v - channel.reference), Status::Ok, None)
            }
            RawReading::Frequency(v) => (None, None, Status::NoSignal, Some(v as i32)),
            RawReading::NoSignal(code) => (None, None, Status::NoSignal, Some(code)),
        };
        Self {
            channel: channel.name.clone(),
            timestamp: Utc::now(),
            value,
            detuning,
            source,
            status,
            error_code,
        }
    }

    /// Reduces an etalon scan to its scalar form: the peak sample. Scan
    /// amplitudes are detector units, not frequencies, so no detuning is
    /// derived. An empty trace reads as no signal.
    pub fn from_scan(channel: &ChannelConfig, trace: &OsaTrace) -> Self {
        let peak = trace.points.iter().copied().max();
        Self {
            channel: channel.name.clone(),
            timestamp: trace.timestamp,
            value: peak.map(f64::from),
            detuning: None,
            source: Source::Osa,
            status: if peak.is_some() {
                Status::Ok
            } else {
                Status::NoSignal
            },
            error_code: None,
        }
    }

    /// A `status = error` placeholder emitted when the device could not be
    /// read at all (unreachable switcher, instrument timeout).
    pub fn device_error(channel: &str, source: Source) -> Self {
        Self {
            channel: channel.to_string(),
            timestamp: Utc::now(),
            value: None,
            detuning: None,
            source,
            status: Status::Error,
            error_code: None,
        }
    }

    /// True when the reading carries a usable value.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Latest-value cache: one bounded ring of recent measurements per channel.
///
/// Single writer (the acquisition loop), many readers (session backfill).
/// The lock is never held across I/O or awaits.
#[derive(Debug)]
pub struct MeasurementLog {
    rings: RwLock<HashMap<String, VecDeque<Measurement>>>,
    depth: usize,
}

impl MeasurementLog {
    /// Creates a log keeping up to `depth` recent measurements per channel.
    pub fn new(depth: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            depth: depth.max(1),
        }
    }

    /// Records a new measurement, evicting the channel's oldest if full.
    pub fn update(&self, measurement: Measurement) {
        let mut rings = match self.rings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let ring = rings
            .entry(measurement.channel.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.depth));
        if ring.len() == self.depth {
            ring.pop_front();
        }
        ring.push_back(measurement);
    }

    /// Ring capacity per channel.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Most recent measurement for `channel`, if any has been recorded.
    pub fn latest(&self, channel: &str) -> Option<Measurement> {
        let rings = match self.rings.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rings.get(channel).and_then(|ring| ring.back().cloned())
    }

    /// Up to the last `n` measurements for `channel`, oldest first.
    pub fn recent(&self, channel: &str, n: usize) -> Vec<Measurement> {
        let rings = match self.rings.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match rings.get(channel) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(n);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> ChannelConfig {
        ChannelConfig {
            name: "probe".into(),
            reference: 4.74e14,
            exposure_ms: 10,
            switcher_position: 1,
            array: 1,
            use_blue_etalon: false,
            active: true,
            modes: vec![Source::Wavemeter],
        }
    }

    #[test]
    fn valid_frequency_yields_detuning() {
        let m = Measurement::from_reading(
            &probe(),
            Source::Wavemeter,
            RawReading::Frequency(4.74e14 + 1.5e6),
        );
        assert!(m.is_ok());
        assert_eq!(m.value, Some(4.74e14 + 1.5e6));
        let detuning = m.detuning.unwrap();
        assert!((detuning - 1.5e6).abs() < 1.0, "detuning was {detuning}");
        assert_eq!(m.error_code, None);
    }

    #[test]
    fn negative_frequency_is_a_no_signal_code() {
        let m = Measurement::from_reading(&probe(), Source::Wavemeter, RawReading::Frequency(-4.0));
        assert_eq!(m.status, Status::NoSignal);
        assert_eq!(m.value, None);
        assert_eq!(m.detuning, None);
        assert_eq!(m.error_code, Some(-4));
    }

    #[test]
    fn explicit_no_signal_keeps_its_code() {
        let m = Measurement::from_reading(&probe(), Source::Osa, RawReading::NoSignal(-3));
        assert_eq!(m.status, Status::NoSignal);
        assert_eq!(m.error_code, Some(-3));
        assert_eq!(m.source, Source::Osa);
    }

    #[test]
    fn scan_reduces_to_peak_without_detuning() {
        let trace = OsaTrace {
            channel: "probe".into(),
            timestamp: Utc::now(),
            points: vec![120, 9_840, 311],
        };
        let m = Measurement::from_scan(&probe(), &trace);
        assert_eq!(m.source, Source::Osa);
        assert_eq!(m.value, Some(9_840.0));
        assert_eq!(m.detuning, None);
        assert!(m.is_ok());

        let empty = OsaTrace {
            channel: "probe".into(),
            timestamp: Utc::now(),
            points: vec![],
        };
        assert_eq!(Measurement::from_scan(&probe(), &empty).status, Status::NoSignal);
    }

    #[test]
    fn log_keeps_latest_and_bounded_history() {
        let log = MeasurementLog::new(3);
        let ch = probe();
        for i in 0..5 {
            log.update(Measurement::from_reading(
                &ch,
                Source::Wavemeter,
                RawReading::Frequency(4.74e14 + f64::from(i)),
            ));
        }
        let latest = log.latest("probe").unwrap();
        assert_eq!(latest.value, Some(4.74e14 + 4.0));

        let recent = log.recent("probe", 10);
        assert_eq!(recent.len(), 3, "ring must stay bounded");
        let values: Vec<_> = recent.iter().map(|m| m.value.unwrap()).collect();
        assert_eq!(values, [4.74e14 + 2.0, 4.74e14 + 3.0, 4.74e14 + 4.0]);
    }

    #[test]
    fn unknown_channel_reads_empty() {
        let log = MeasurementLog::new(3);
        assert!(log.latest("nope").is_none());
        assert!(log.recent("nope", 4).is_empty());
    }
}
