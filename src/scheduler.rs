//! The acquisition scheduler.
//!
//! One logically single-threaded loop owns the switcher and the instruments:
//! it visits the active channels in registry order, routes each one through
//! the switcher, runs every instrument read the channel's mode set asks for,
//! and publishes the resulting measurements to the log, the fan-out path and
//! the persistence sink. Exactly one switch selection or instrument trigger
//! is ever in flight; the hardware is a single shared resource and nothing
//! else in the process is allowed to touch it.
//!
//! Errors stay scoped to their channel: a failed read yields an error-status
//! measurement and the cycle moves on. When the switcher itself goes
//! unreachable the loop retries it once per pass and publishes error-status
//! measurements for every planned channel, backing off between passes and
//! reporting the degraded condition through the health monitor until the
//! switcher answers again. Clients stay connected throughout.
//!
//! Control arrives on a command channel with oneshot replies: a session can
//! pin the cycle to one channel (`lock`), pause and resume acquisition, or
//! request a state snapshot. Shutdown completes the in-flight channel read
//! before exiting; it never abandons a read midway.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelConfig, ChannelRegistry};
use crate::config::AcquisitionSection;
use crate::error::{AppResult, DeviceError, WavemuxError};
use crate::health::HealthMonitor;
use crate::instrument::{EtalonScanner, FrequencyReader};
use crate::measurement::{Measurement, MeasurementLog, Source};
use crate::network::protocol::{Push, StateSnapshot};
use crate::network::session::SessionRegistry;
use crate::sink::SinkHandle;
use crate::switch::{Switcher, SwitcherState};

/// Control messages the scheduler accepts while running.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Pin the cycle to a single named channel.
    Lock {
        channel: String,
        reply: oneshot::Sender<AppResult<()>>,
    },
    /// Return to cycling over all active channels.
    Unlock { reply: oneshot::Sender<()> },
    /// Suspend acquisition; sessions and the switcher stay up.
    Pause { reply: oneshot::Sender<()> },
    /// Resume a paused loop.
    Resume { reply: oneshot::Sender<()> },
    /// Fetch the current state without changing anything.
    Snapshot {
        reply: oneshot::Sender<StateSnapshot>,
    },
}

/// Cheap cloneable handle for sending [`SchedulerCommand`]s.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub async fn lock(&self, channel: impl Into<String>) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Lock {
                channel: channel.into(),
                reply,
            })
            .await
            .map_err(|_| WavemuxError::SchedulerGone)?;
        rx.await.map_err(|_| WavemuxError::SchedulerGone)?
    }

    pub async fn unlock(&self) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Unlock { reply })
            .await
            .map_err(|_| WavemuxError::SchedulerGone)?;
        rx.await.map_err(|_| WavemuxError::SchedulerGone)
    }

    pub async fn pause(&self) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Pause { reply })
            .await
            .map_err(|_| WavemuxError::SchedulerGone)?;
        rx.await.map_err(|_| WavemuxError::SchedulerGone)
    }

    pub async fn resume(&self) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Resume { reply })
            .await
            .map_err(|_| WavemuxError::SchedulerGone)?;
        rx.await.map_err(|_| WavemuxError::SchedulerGone)
    }

    pub async fn snapshot(&self) -> AppResult<StateSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Snapshot { reply })
            .await
            .map_err(|_| WavemuxError::SchedulerGone)?;
        rx.await.map_err(|_| WavemuxError::SchedulerGone)
    }
}

/// Everything the scheduler needs, assembled by the application wiring.
pub struct SchedulerParts {
    pub channels: Arc<ChannelRegistry>,
    pub switcher: Box<dyn Switcher>,
    pub wavemeter: Option<Arc<dyn FrequencyReader>>,
    pub osa: Option<Arc<dyn EtalonScanner>>,
    pub log: Arc<MeasurementLog>,
    pub sessions: Arc<SessionRegistry>,
    pub sink: SinkHandle,
    pub health: Arc<HealthMonitor>,
    pub acquisition: AcquisitionSection,
}

/// Starts the scheduler task. The loop runs until `shutdown` flips to true
/// or every [`SchedulerHandle`] is dropped.
pub fn spawn(
    parts: SchedulerParts,
    shutdown: watch::Receiver<bool>,
) -> (SchedulerHandle, JoinHandle<()>) {
    let (tx, commands) = mpsc::channel(16);
    let capability = parts.switcher.capability();
    let scheduler = AcquisitionScheduler {
        channels: parts.channels,
        switcher: parts.switcher,
        switcher_state: SwitcherState::new(capability),
        wavemeter: parts.wavemeter,
        osa: parts.osa,
        log: parts.log,
        sessions: parts.sessions,
        sink: parts.sink,
        health: parts.health,
        acquisition: parts.acquisition,
        commands,
        shutdown,
        paused: false,
        locked: None,
    };
    let task = tokio::spawn(scheduler.run());
    (SchedulerHandle { tx }, task)
}

struct AcquisitionScheduler {
    channels: Arc<ChannelRegistry>,
    switcher: Box<dyn Switcher>,
    switcher_state: SwitcherState,
    wavemeter: Option<Arc<dyn FrequencyReader>>,
    osa: Option<Arc<dyn EtalonScanner>>,
    log: Arc<MeasurementLog>,
    sessions: Arc<SessionRegistry>,
    sink: SinkHandle,
    health: Arc<HealthMonitor>,
    acquisition: AcquisitionSection,
    commands: mpsc::Receiver<SchedulerCommand>,
    shutdown: watch::Receiver<bool>,
    paused: bool,
    locked: Option<String>,
}

impl AcquisitionScheduler {
    async fn run(mut self) {
        info!(
            switcher = %self.switcher.describe(),
            channels = self.channels.len(),
            "acquisition scheduler started"
        );
        let mut announced_idle = false;

        'outer: loop {
            if self.drain_commands().await {
                announced_idle = false;
            }
            if *self.shutdown.borrow() {
                break;
            }

            let plan = self.plan();
            if plan.is_empty() {
                if !announced_idle {
                    if self.paused {
                        info!("acquisition paused");
                    } else {
                        warn!("no active channels; acquisition idle");
                    }
                    announced_idle = true;
                }
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => {
                            self.apply(command).await;
                            announced_idle = false;
                        }
                        None => break,
                    },
                    _ = self.shutdown.changed() => {}
                    _ = tokio::time::sleep(self.acquisition.idle_backoff) => {}
                }
                continue;
            }
            announced_idle = false;

            for (index, channel) in plan.iter().enumerate() {
                if *self.shutdown.borrow() {
                    break 'outer;
                }
                self.serve_channel(channel).await;
                if self.drain_commands().await {
                    // Lock, pause or resume changed the plan; rebuild it.
                    continue 'outer;
                }
                if !self.switcher_state.is_available() {
                    // Switcher gone; every remaining channel in the plan is
                    // just as unroutable. Mark them all without touching the
                    // device, then back off and retry on the next pass.
                    for unroutable in &plan[index + 1..] {
                        self.emit_read_failures(unroutable).await;
                    }
                    break;
                }
            }
            self.health.record_cycle();
            let snap = self.health.snapshot();
            debug!(
                cycles = snap.cycles,
                reads_ok = snap.reads_ok,
                reads_no_signal = snap.reads_no_signal,
                reads_failed = snap.reads_failed,
                switcher_available = snap.switcher_available,
                "cycle complete"
            );

            if !self.switcher_state.is_available() {
                tokio::select! {
                    _ = self.shutdown.changed() => {}
                    _ = tokio::time::sleep(self.acquisition.idle_backoff) => {}
                }
            }
        }
        info!("acquisition scheduler stopped");
    }

    /// Channels the next cycle should visit, in registry order.
    fn plan(&self) -> Vec<ChannelConfig> {
        if self.paused {
            return Vec::new();
        }
        if let Some(locked) = &self.locked {
            return self.channels.get(locked).cloned().into_iter().collect();
        }
        self.channels.active().cloned().collect()
    }

    /// Applies every command already waiting. Returns true when one of them
    /// changed what the cycle should visit.
    async fn drain_commands(&mut self) -> bool {
        let mut plan_changed = false;
        while let Ok(command) = self.commands.try_recv() {
            plan_changed |= self.apply(command).await;
        }
        plan_changed
    }

    async fn apply(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::Lock { channel, reply } => {
                let result = if self.channels.contains(&channel) {
                    info!(channel = %channel, "acquisition locked to channel");
                    self.locked = Some(channel);
                    Ok(())
                } else {
                    Err(WavemuxError::UnknownChannel(channel))
                };
                let changed = result.is_ok();
                let _ = reply.send(result);
                if changed {
                    self.push_state().await;
                }
                changed
            }
            SchedulerCommand::Unlock { reply } => {
                let changed = self.locked.take().is_some();
                if changed {
                    info!("acquisition lock released");
                }
                let _ = reply.send(());
                if changed {
                    self.push_state().await;
                }
                changed
            }
            SchedulerCommand::Pause { reply } => {
                let changed = !self.paused;
                self.paused = true;
                let _ = reply.send(());
                if changed {
                    self.push_state().await;
                }
                changed
            }
            SchedulerCommand::Resume { reply } => {
                let changed = self.paused;
                self.paused = false;
                if changed {
                    info!("acquisition resumed");
                }
                let _ = reply.send(());
                if changed {
                    self.push_state().await;
                }
                changed
            }
            SchedulerCommand::Snapshot { reply } => {
                let _ = reply.send(self.state_snapshot());
                false
            }
        }
    }

    fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            running: !self.paused,
            locked: self.locked.clone(),
            health: self.health.snapshot(),
        }
    }

    async fn push_state(&self) {
        let snapshot = self.state_snapshot();
        self.sessions.broadcast_all(&Push::State(snapshot)).await;
    }

    /// Routes one channel and runs every read its mode set asks for.
    async fn serve_channel(&mut self, channel: &ChannelConfig) {
        if let Err(error) = self.select(channel).await {
            self.health.record_switch_failure();
            let fatal = error.is_fatal();
            self.switcher_state.record_failure(&error);
            if fatal {
                if self.health.switcher_available() {
                    error!(
                        channel = %channel.name,
                        error = %error,
                        "switcher unreachable, serving degraded until it answers again"
                    );
                    self.health.set_switcher_available(false);
                    self.push_state().await;
                }
            } else {
                warn!(channel = %channel.name, error = %error, "switch selection failed");
            }
            self.emit_read_failures(channel).await;
            return;
        }

        if !self.health.switcher_available() {
            info!("switcher answering again, resuming normal cycle");
            self.health.set_switcher_available(true);
            self.push_state().await;
        }

        for source in [Source::Wavemeter, Source::Osa] {
            if !channel.has_mode(source) {
                continue;
            }
            match source {
                Source::Wavemeter => self.read_wavemeter(channel).await,
                Source::Osa => self.read_osa(channel).await,
            }
        }
    }

    /// Selects the channel's switcher position, retrying one transient
    /// failure before giving up on the channel for this cycle.
    async fn select(&mut self, channel: &ChannelConfig) -> Result<(), DeviceError> {
        let mut retried = false;
        loop {
            match self.switcher.select_channel(channel.switcher_position).await {
                Ok(()) => {
                    self.switcher_state.record_success(channel.switcher_position);
                    return Ok(());
                }
                Err(error) if !error.is_fatal() && !retried => {
                    debug!(
                        channel = %channel.name,
                        error = %error,
                        "retrying switch selection"
                    );
                    retried = true;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn read_wavemeter(&mut self, channel: &ChannelConfig) {
        let Some(reader) = self.wavemeter.clone() else {
            debug!(channel = %channel.name, "no wavemeter backend, skipping read");
            return;
        };
        let measurement = match tokio::time::timeout(
            self.acquisition.read_timeout,
            reader.read_frequency(channel),
        )
        .await
        {
            Ok(Ok(reading)) => Measurement::from_reading(channel, Source::Wavemeter, reading),
            Ok(Err(error)) => {
                warn!(channel = %channel.name, error = %error, "wavemeter read failed");
                Measurement::device_error(&channel.name, Source::Wavemeter)
            }
            Err(_) => {
                warn!(
                    channel = %channel.name,
                    timeout = ?self.acquisition.read_timeout,
                    "wavemeter read timed out"
                );
                Measurement::device_error(&channel.name, Source::Wavemeter)
            }
        };
        self.publish(measurement).await;
    }

    async fn read_osa(&mut self, channel: &ChannelConfig) {
        let Some(scanner) = self.osa.clone() else {
            debug!(channel = %channel.name, "no osa backend, skipping scan");
            return;
        };
        match tokio::time::timeout(self.acquisition.read_timeout, scanner.scan(channel)).await {
            Ok(Ok(trace)) => {
                let summary = Measurement::from_scan(channel, &trace);
                self.sessions
                    .broadcast_channel(&channel.name, &Push::OsaTrace(trace))
                    .await;
                self.publish(summary).await;
            }
            Ok(Err(error)) => {
                warn!(channel = %channel.name, error = %error, "osa scan failed");
                self.publish(Measurement::device_error(&channel.name, Source::Osa))
                    .await;
            }
            Err(_) => {
                warn!(
                    channel = %channel.name,
                    timeout = ?self.acquisition.read_timeout,
                    "osa scan timed out"
                );
                self.publish(Measurement::device_error(&channel.name, Source::Osa))
                    .await;
            }
        }
    }

    /// One error-status measurement per configured mode, emitted when the
    /// channel could not be routed at all.
    async fn emit_read_failures(&mut self, channel: &ChannelConfig) {
        for source in [Source::Wavemeter, Source::Osa] {
            if channel.has_mode(source) {
                self.publish(Measurement::device_error(&channel.name, source))
                    .await;
            }
        }
    }

    /// Sends one finished measurement everywhere it goes: health counters,
    /// the latest-value log, the persistence sink, and every subscribed
    /// session. None of these block on a slow consumer.
    async fn publish(&self, measurement: Measurement) {
        self.health.record_read(measurement.status);
        self.log.update(measurement.clone());
        self.sink.offer(&measurement);
        let channel = measurement.channel.clone();
        self.sessions
            .broadcast_channel(&channel, &Push::Measurement(measurement))
            .await;
    }
}
