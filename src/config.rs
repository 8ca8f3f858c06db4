//! Server configuration.
//!
//! Layered loading via figment: a TOML file merged with `WAVEMUX_`-prefixed
//! environment overrides, extracted into plain serde structs. Validation is a
//! separate pass so a config can be checked (`wavemux check`) without
//! starting anything.
//!
//! Channels are declared as an array of tables (`[[channels]]`); their file
//! order is the acquisition cycle order.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::error::WavemuxError;
use crate::version::{Compatibility, VersionTuple};

fn default_name() -> String {
    "wavemux".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_switch_port() -> u16 {
    10001
}

fn default_settle() -> Duration {
    Duration::from_millis(2)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_idle_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_osa_samples() -> usize {
    16_000
}

fn default_osa_downsample() -> usize {
    10
}

fn default_osa_scale() -> f64 {
    1e4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_high_water() -> usize {
    48
}

fn default_eviction_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_ring_depth() -> usize {
    16
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Csv
}

fn default_sink_path() -> String {
    "wavemux-logs".to_string()
}

fn default_log_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_sink_queue() -> usize {
    256
}

fn default_exposure_min_ms() -> u32 {
    1
}

fn default_exposure_max_ms() -> u32 {
    500
}

/// Which switcher backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitcherKind {
    /// Channel switching integrated in the wavemeter itself.
    Wavemeter,
    /// External fibre switch speaking the line protocol over TCP.
    Leoni,
    /// In-process simulated switch.
    Simulated,
}

/// Which persistence sink to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Append rows to a CSV file.
    Csv,
    /// Discard everything (simulation / bench setups).
    Null,
}

/// `[server]` section: identity and listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Server name, echoed in handshakes and log lines.
    #[serde(default = "default_name")]
    pub name: String,
    /// TCP listen address for client sessions.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Version this configuration was written for, as a dotted string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Interval between keepalive pings pushed to every session.
    #[serde(with = "humantime_serde", default = "default_ping_interval")]
    pub ping_interval: Duration,
    /// Log level when `WAVEMUX_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            listen: default_listen(),
            version: default_version(),
            ping_interval: default_ping_interval(),
            log_level: default_log_level(),
        }
    }
}

/// `[switcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitcherSection {
    /// Backend variant.
    pub kind: SwitcherKind,
    /// Fibre-switch host; required for [`SwitcherKind::Leoni`].
    #[serde(default)]
    pub host: Option<String>,
    /// Fibre-switch TCP port.
    #[serde(default = "default_switch_port")]
    pub port: u16,
    /// Optical settling delay applied after each successful select.
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
}

impl Default for SwitcherSection {
    fn default() -> Self {
        Self {
            kind: SwitcherKind::Simulated,
            host: None,
            port: default_switch_port(),
            settle: default_settle(),
        }
    }
}

/// `[acquisition.osa]` subsection: etalon scan geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsaSection {
    /// Raw samples captured per scan window.
    #[serde(default = "default_osa_samples")]
    pub samples: usize,
    /// Integer downsampling factor (mean over each block).
    #[serde(default = "default_osa_downsample")]
    pub downsample: usize,
    /// Multiplier applied before truncating trace points to integers.
    #[serde(default = "default_osa_scale")]
    pub scale: f64,
}

impl Default for OsaSection {
    fn default() -> Self {
        Self {
            samples: default_osa_samples(),
            downsample: default_osa_downsample(),
            scale: default_osa_scale(),
        }
    }
}

/// `[acquisition]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSection {
    /// Replace all hardware with the synthetic generator. Construction-time:
    /// flipping this requires a restart.
    #[serde(default)]
    pub simulate: bool,
    /// Bounded wait for a single instrument read.
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// Pause between cycle polls when nothing is active or the switcher is
    /// down, so a degraded server does not spin.
    #[serde(with = "humantime_serde", default = "default_idle_backoff")]
    pub idle_backoff: Duration,
    /// Etalon scan geometry.
    #[serde(default)]
    pub osa: OsaSection,
}

impl Default for AcquisitionSection {
    fn default() -> Self {
        Self {
            simulate: false,
            read_timeout: default_read_timeout(),
            idle_backoff: default_idle_backoff(),
            osa: OsaSection::default(),
        }
    }
}

/// `[distribution]` section: per-session queue policy and the ring cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSection {
    /// Bound of each session's outbound queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Occupancy above which the eviction clock starts running.
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    /// How long a session may stay above the high-water mark before it is
    /// disconnected.
    #[serde(with = "humantime_serde", default = "default_eviction_grace")]
    pub eviction_grace: Duration,
    /// Recent measurements kept per channel for subscriber backfill.
    #[serde(default = "default_ring_depth")]
    pub ring_depth: usize,
}

impl Default for DistributionSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            high_water: default_high_water(),
            eviction_grace: default_eviction_grace(),
            ring_depth: default_ring_depth(),
        }
    }
}

/// `[sink]` section: persistence adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSection {
    /// Which sink implementation to run.
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    /// Directory where file-backed sinks place one timestamped file per run.
    #[serde(default = "default_sink_path")]
    pub path: String,
    /// Per-channel minimum spacing between persisted wavemeter points.
    #[serde(with = "humantime_serde", default = "default_log_interval")]
    pub log_interval: Duration,
    /// Bound of the channel feeding the sink worker; overflow drops
    /// persistence samples, never measurements.
    #[serde(default = "default_sink_queue")]
    pub queue_capacity: usize,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            path: default_sink_path(),
            log_interval: default_log_interval(),
            queue_capacity: default_sink_queue(),
        }
    }
}

/// `[limits]` section: bounds the registry enforces on channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Minimum accepted wavemeter exposure, milliseconds.
    #[serde(default = "default_exposure_min_ms")]
    pub exposure_min_ms: u32,
    /// Maximum accepted wavemeter exposure, milliseconds.
    #[serde(default = "default_exposure_max_ms")]
    pub exposure_max_ms: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            exposure_min_ms: default_exposure_min_ms(),
            exposure_max_ms: default_exposure_max_ms(),
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity and listener settings.
    #[serde(default)]
    pub server: ServerSection,
    /// Switcher backend selection.
    #[serde(default)]
    pub switcher: SwitcherSection,
    /// Acquisition loop tuning.
    #[serde(default)]
    pub acquisition: AcquisitionSection,
    /// Fan-out queue policy.
    #[serde(default)]
    pub distribution: DistributionSection,
    /// Persistence adapter settings.
    #[serde(default)]
    pub sink: SinkSection,
    /// Channel setting bounds.
    #[serde(default)]
    pub limits: LimitsSection,
    /// The channel table, in cycle order.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    /// Loads configuration from a TOML file with `WAVEMUX_` environment
    /// overrides layered on top.
    pub fn load_from(path: &Path) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("WAVEMUX_").split("__"))
            .extract()
    }

    /// Loads configuration from a TOML string (tests, embedded defaults).
    pub fn from_toml(toml: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(toml)).extract()
    }

    /// Checks semantic validity: channel uniqueness, exposure bounds,
    /// queue-policy sanity, backend completeness.
    pub fn validate(&self) -> Result<(), String> {
        self.server
            .version
            .parse::<VersionTuple>()
            .map_err(|e| e.to_string())?;
        crate::tracing_setup::parse_log_level(&self.server.log_level)?;

        if self.channels.is_empty() {
            return Err("no channels configured".to_string());
        }

        let mut names = std::collections::HashSet::new();
        let mut positions = std::collections::HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err("channel with empty name".to_string());
            }
            if !names.insert(channel.name.as_str()) {
                return Err(format!("duplicate channel name '{}'", channel.name));
            }
            if !positions.insert(channel.switcher_position) {
                return Err(format!(
                    "switcher position {} used by more than one channel",
                    channel.switcher_position
                ));
            }
            if channel.switcher_position == 0 {
                return Err(format!(
                    "channel '{}': switcher positions are 1-based",
                    channel.name
                ));
            }
            if channel.exposure_ms < self.limits.exposure_min_ms
                || channel.exposure_ms > self.limits.exposure_max_ms
            {
                return Err(format!(
                    "channel '{}': exposure {}ms outside {}..={}ms",
                    channel.name,
                    channel.exposure_ms,
                    self.limits.exposure_min_ms,
                    self.limits.exposure_max_ms
                ));
            }
            if channel.modes.is_empty() {
                return Err(format!("channel '{}' has an empty mode set", channel.name));
            }
        }

        if self.switcher.kind == SwitcherKind::Leoni
            && !self.acquisition.simulate
            && self.switcher.host.is_none()
        {
            return Err("switcher.kind = 'leoni' requires switcher.host".to_string());
        }

        if self.distribution.queue_capacity == 0 {
            return Err("distribution.queue_capacity must be at least 1".to_string());
        }
        if self.distribution.high_water >= self.distribution.queue_capacity {
            return Err(format!(
                "distribution.high_water ({}) must be below queue_capacity ({})",
                self.distribution.high_water, self.distribution.queue_capacity
            ));
        }
        if self.acquisition.osa.downsample == 0 {
            return Err("acquisition.osa.downsample must be at least 1".to_string());
        }

        Ok(())
    }

    /// The version this configuration declares.
    pub fn declared_version(&self) -> Result<VersionTuple, WavemuxError> {
        self.server.version.parse()
    }

    /// Applies the version compatibility rule between the configuration's
    /// declared version and this server build. A major mismatch refuses
    /// startup; a minor mismatch is returned for the caller to log.
    pub fn check_version(&self) -> Result<Compatibility, WavemuxError> {
        let declared = self.declared_version()?;
        let server = VersionTuple::server();
        match server.check_peer(&declared) {
            Compatibility::Incompatible { .. } => Err(WavemuxError::VersionMismatch {
                client: declared,
                server,
            }),
            other => Ok(other),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            switcher: SwitcherSection::default(),
            acquisition: AcquisitionSection::default(),
            distribution: DistributionSection::default(),
            sink: SinkSection::default(),
            limits: LimitsSection::default(),
            channels: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [server]
        name = "lab-wavemeter"
        listen = "0.0.0.0:8888"
        ping_interval = "1s"

        [switcher]
        kind = "leoni"
        host = "10.255.6.93"
        port = 10001
        settle = "2ms"

        [acquisition]
        read_timeout = "2s"

        [acquisition.osa]
        samples = 16000
        downsample = 10

        [distribution]
        queue_capacity = 64
        high_water = 48
        eviction_grace = "5s"

        [sink]
        kind = "csv"
        path = "/var/log/wavemux"
        log_interval = "5s"

        [[channels]]
        name = "cesium"
        reference = 3.517264e14
        exposure_ms = 10
        switcher_position = 1
        modes = ["wavemeter", "osa"]

        [[channels]]
        name = "repump"
        reference = 3.517346e14
        switcher_position = 2
        active = false
    "#;

    #[test]
    fn full_config_parses_and_validates() {
        let config = Config::from_toml(FULL).unwrap();
        assert_eq!(config.server.name, "lab-wavemeter");
        assert_eq!(config.switcher.kind, SwitcherKind::Leoni);
        assert_eq!(config.switcher.settle, Duration::from_millis(2));
        assert_eq!(config.channels.len(), 2);
        assert!(config.channels[0].has_mode(crate::measurement::Source::Osa));
        assert!(!config.channels[1].active);
        config.validate().unwrap();
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_toml(
            r#"
            [switcher]
            kind = "simulated"

            [[channels]]
            name = "probe"
            reference = 4.74e14
            switcher_position = 1
        "#,
        )
        .unwrap();
        assert_eq!(config.server.ping_interval, Duration::from_secs(1));
        assert_eq!(config.distribution.queue_capacity, 64);
        assert_eq!(config.channels[0].exposure_ms, 10);
        assert!(config.channels[0].active);
        config.validate().unwrap();
    }

    #[test]
    fn duplicate_names_fail_validation() {
        let mut config = Config::from_toml(FULL).unwrap();
        config.channels[1].name = "cesium".into();
        let err = config.validate().unwrap_err();
        assert!(err.contains("duplicate channel name"));
    }

    #[test]
    fn exposure_outside_limits_fails_validation() {
        let mut config = Config::from_toml(FULL).unwrap();
        config.channels[0].exposure_ms = 900;
        let err = config.validate().unwrap_err();
        assert!(err.contains("exposure"));
    }

    #[test]
    fn high_water_must_stay_below_capacity() {
        let mut config = Config::from_toml(FULL).unwrap();
        config.distribution.high_water = 64;
        let err = config.validate().unwrap_err();
        assert!(err.contains("high_water"));
    }

    #[test]
    fn leoni_without_host_fails_validation() {
        let mut config = Config::from_toml(FULL).unwrap();
        config.switcher.host = None;
        let err = config.validate().unwrap_err();
        assert!(err.contains("switcher.host"));
    }

    #[test]
    fn config_version_major_mismatch_refuses_startup() {
        let mut config = Config::from_toml(FULL).unwrap();
        let server = VersionTuple::server();
        config.server.version = format!("{}.0.0", server.major + 1);
        assert!(config.check_version().is_err());
    }

    #[test]
    fn config_version_minor_mismatch_is_degraded() {
        let mut config = Config::from_toml(FULL).unwrap();
        let server = VersionTuple::server();
        config.server.version = format!("{}.{}.7", server.major, server.minor + 1);
        match config.check_version().unwrap() {
            Compatibility::Degraded { .. } => {}
            other => panic!("expected degraded, got {:?}", other),
        }
    }
}
