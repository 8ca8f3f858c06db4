//! # Wavemux Core Library
//!
//! This crate is the core library for the `wavemux` server, which shares one
//! wavelength-measurement instrument (a wavemeter and an optical spectrum
//! analyser behind a fibre switch) between many laser channels. A serial
//! scheduler cycles the switch through the configured channels, reads each
//! one, and fans the measurements out to TCP subscriber sessions. Keeping the
//! logic in a library lets the server binary (`main.rs`), the integration
//! tests and embedding deployments assemble the same components.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct
//! responsibility:
//!
//! - **`app`**: Wires a validated [`config::Config`] into a running server
//!   and owns its shutdown sequence.
//! - **`channel`**: The laser channel table, `ChannelConfig` and the
//!   `ChannelRegistry` that fixes acquisition order.
//! - **`config`**: Layered TOML + environment configuration via `figment`,
//!   with validation and config-format version checking.
//! - **`distribution`**: Bounded per-session outbound queues with gap
//!   markers and sustained-overflow eviction.
//! - **`error`**: The central `WavemuxError` enum and device error taxonomy.
//! - **`health`**: Lock-free acquisition counters snapshotted into state
//!   pushes.
//! - **`instrument`**: The `FrequencyReader` and `EtalonScanner` capability
//!   traits plus the simulated implementations.
//! - **`measurement`**: Measurement records, detuning arithmetic and the
//!   per-channel history rings backing late-subscriber backfill.
//! - **`network`**: The newline-delimited JSON protocol, per-client
//!   sessions and the subscriber server.
//! - **`scheduler`**: The serial acquisition loop that drives the switch and
//!   instruments and applies lock/pause commands between reads.
//! - **`sink`**: Pluggable measurement persistence (CSV) behind a throttled
//!   worker task.
//! - **`switch`**: The `Switcher` trait with the fibre-switch driver and a
//!   simulated switch.
//! - **`tracing_setup`**: `tracing-subscriber` initialization with an
//!   env-filter override and selectable output format.
//! - **`version`**: Semantic version tuples and the compatibility rule used
//!   for both client handshakes and configuration files.

pub mod app;
pub mod channel;
pub mod config;
pub mod distribution;
pub mod error;
pub mod health;
pub mod instrument;
pub mod measurement;
pub mod network;
pub mod scheduler;
pub mod sink;
pub mod switch;
pub mod tracing_setup;
pub mod version;

pub use app::App;
pub use channel::{ChannelConfig, ChannelRegistry};
pub use config::Config;
pub use error::{AppResult, DeviceError, WavemuxError};
pub use measurement::{Measurement, MeasurementLog, Source, Status};
pub use version::{Compatibility, VersionTuple};
