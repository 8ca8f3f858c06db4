//! Simulated switcher.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::DeviceError;
use crate::switch::{Switcher, SwitcherCapability};

/// In-process switch: bounds-checked position state and an optional settle
/// delay, no hardware.
pub struct SimulatedSwitcher {
    channel_count: usize,
    settle: Duration,
    position: RwLock<Option<usize>>,
}

impl SimulatedSwitcher {
    /// Creates a simulated switch with `channel_count` positions and no
    /// settle delay.
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count: channel_count.max(1),
            settle: Duration::ZERO,
            position: RwLock::new(None),
        }
    }

    /// Adds a settle delay after each select, for timing-realistic runs.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

#[async_trait]
impl Switcher for SimulatedSwitcher {
    async fn select_channel(&self, position: usize) -> Result<(), DeviceError> {
        if position == 0 || position > self.channel_count {
            return Err(DeviceError::PositionOutOfRange {
                position,
                max: self.channel_count,
            });
        }
        *self.position.write().await = Some(position);
        trace!(position, "simulated switch routed");
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Ok(())
    }

    async fn current_position(&self) -> Result<Option<usize>, DeviceError> {
        Ok(*self.position.read().await)
    }

    fn capability(&self) -> SwitcherCapability {
        SwitcherCapability::Simulated
    }

    fn describe(&self) -> String {
        format!("simulated 1x{} switch", self.channel_count)
    }
}
