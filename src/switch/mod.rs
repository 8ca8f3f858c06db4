//! Channel switcher abstraction.
//!
//! One capability trait, [`Switcher`], shared by every backend that can route
//! a numbered optical channel to the measurement instrument: the switch
//! integrated in the wavemeter, an external fibre switch on the network, or
//! the in-process simulated switch. Callers treat `select_channel` as a
//! blocking call that may take the physical settling time and may fail
//! transiently (busy, timed out) or fatally (unreachable); the two classes
//! are distinguished by [`DeviceError::is_fatal`].
//!
//! All methods take `&self`; backends keep their connection state behind
//! interior mutability. Position transitions are only ever issued by the
//! acquisition loop, one at a time.

pub mod leoni;
pub mod sim;

use async_trait::async_trait;

use crate::error::DeviceError;

pub use leoni::LeoniSwitcher;
pub use sim::SimulatedSwitcher;

/// Capability: routing one of several optical channels to the instrument.
#[async_trait]
pub trait Switcher: Send + Sync {
    /// Routes the given 1-based position to the instrument.
    ///
    /// May suspend for the device's settling time. Transient failures leave
    /// the previously held position in place and may be retried; fatal
    /// failures mean the device is gone until it reconnects.
    async fn select_channel(&self, position: usize) -> Result<(), DeviceError>;

    /// The position currently routed, if the device knows it.
    async fn current_position(&self) -> Result<Option<usize>, DeviceError>;

    /// Which backend variant this is.
    fn capability(&self) -> SwitcherCapability;

    /// Short device description for log lines.
    fn describe(&self) -> String;
}

/// Backend variant of a switcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitcherCapability {
    /// Switching performed by the wavemeter itself.
    Integrated,
    /// Stand-alone fibre switch reached over TCP.
    FibreSwitch,
    /// In-process simulation.
    Simulated,
}

/// Outcome of the most recent switch command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The select completed.
    Ok,
    /// The select failed; `fatal` mirrors [`DeviceError::is_fatal`].
    Failed {
        /// Whether the device is considered gone.
        fatal: bool,
        /// Rendered device error.
        message: String,
    },
}

/// Book-keeping the acquisition loop keeps about its switcher.
///
/// Owned exclusively by the loop; never shared or mutated elsewhere.
#[derive(Debug)]
pub struct SwitcherState {
    current_position: Option<usize>,
    capability: SwitcherCapability,
    last_command: Option<CommandOutcome>,
    available: bool,
}

impl SwitcherState {
    /// Fresh state for a device of the given variant; position unknown,
    /// device presumed available.
    pub fn new(capability: SwitcherCapability) -> Self {
        Self {
            current_position: None,
            capability,
            last_command: None,
            available: true,
        }
    }

    /// Records a completed select.
    pub fn record_success(&mut self, position: usize) {
        self.current_position = Some(position);
        self.last_command = Some(CommandOutcome::Ok);
        self.available = true;
    }

    /// Records a failed select; fatal failures mark the device unavailable.
    pub fn record_failure(&mut self, error: &DeviceError) {
        let fatal = error.is_fatal();
        self.last_command = Some(CommandOutcome::Failed {
            fatal,
            message: error.to_string(),
        });
        if fatal {
            self.available = false;
            self.current_position = None;
        }
    }

    /// Position held after the last successful select, if any.
    pub fn current_position(&self) -> Option<usize> {
        self.current_position
    }

    /// False once a fatal failure was recorded, until the next success.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Backend variant recorded at construction.
    pub fn capability(&self) -> SwitcherCapability {
        self.capability
    }

    /// Outcome of the most recent command, if one has run.
    pub fn last_command(&self) -> Option<&CommandOutcome> {
        self.last_command.as_ref()
    }
}
