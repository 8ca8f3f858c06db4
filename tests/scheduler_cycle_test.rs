//! Integration tests for the acquisition cycle.
//!
//! A recording switcher backend captures the exact order of switch
//! selections, proving the cycle visits active channels in configuration
//! order, skips inactive ones, honors locks, and keeps serving (degraded)
//! when the switcher disappears mid-run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use wavemux::channel::{ChannelConfig, ChannelRegistry};
use wavemux::config::{AcquisitionSection, DistributionSection, SinkKind, SinkSection};
use wavemux::error::DeviceError;
use wavemux::health::HealthMonitor;
use wavemux::instrument::sim::SimulatedWavemeter;
use wavemux::measurement::{MeasurementLog, Source, Status};
use wavemux::network::session::SessionRegistry;
use wavemux::scheduler::{self, SchedulerHandle, SchedulerParts};
use wavemux::sink::{self, NullSink};
use wavemux::switch::{Switcher, SwitcherCapability};

/// Switcher that records every selected position and can be switched into an
/// unreachable state, or wedge a single position, at will.
struct RecordingSwitcher {
    selections: Arc<Mutex<Vec<usize>>>,
    unreachable: Arc<AtomicBool>,
    busy_position: Arc<Mutex<Option<usize>>>,
}

#[async_trait]
impl Switcher for RecordingSwitcher {
    async fn select_channel(&self, position: usize) -> Result<(), DeviceError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DeviceError::Unreachable("test switch offline".into()));
        }
        if *self.busy_position.lock().unwrap() == Some(position) {
            return Err(DeviceError::Busy("test position wedged".into()));
        }
        self.selections.lock().unwrap().push(position);
        Ok(())
    }

    async fn current_position(&self) -> Result<Option<usize>, DeviceError> {
        Ok(self.selections.lock().unwrap().last().copied())
    }

    fn capability(&self) -> SwitcherCapability {
        SwitcherCapability::Simulated
    }

    fn describe(&self) -> String {
        "recording test switch".to_string()
    }
}

fn channel(name: &str, position: usize, active: bool) -> ChannelConfig {
    ChannelConfig {
        name: name.to_string(),
        reference: 4.74e14,
        exposure_ms: 5,
        switcher_position: position,
        array: 1,
        use_blue_etalon: false,
        active,
        modes: vec![Source::Wavemeter],
    }
}

struct Harness {
    handle: SchedulerHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    selections: Arc<Mutex<Vec<usize>>>,
    unreachable: Arc<AtomicBool>,
    busy_position: Arc<Mutex<Option<usize>>>,
    health: Arc<HealthMonitor>,
    log: Arc<MeasurementLog>,
}

fn start(channels: Vec<ChannelConfig>) -> Harness {
    let selections = Arc::new(Mutex::new(Vec::new()));
    let unreachable = Arc::new(AtomicBool::new(false));
    let busy_position = Arc::new(Mutex::new(None));
    let registry = Arc::new(ChannelRegistry::new(channels).unwrap());
    let sessions = Arc::new(SessionRegistry::new(
        registry.clone(),
        DistributionSection::default(),
    ));
    let (sink_handle, _sink_task) = sink::spawn(
        Box::new(NullSink),
        &SinkSection {
            kind: SinkKind::Null,
            path: String::new(),
            log_interval: Duration::from_secs(5),
            queue_capacity: 8,
        },
    );
    let health = Arc::new(HealthMonitor::new());
    let log = Arc::new(MeasurementLog::new(8));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (handle, task) = scheduler::spawn(
        SchedulerParts {
            channels: registry,
            switcher: Box::new(RecordingSwitcher {
                selections: selections.clone(),
                unreachable: unreachable.clone(),
                busy_position: busy_position.clone(),
            }),
            wavemeter: Some(Arc::new(SimulatedWavemeter::new(11))),
            osa: None,
            log: log.clone(),
            sessions,
            sink: sink_handle,
            health: health.clone(),
            acquisition: AcquisitionSection {
                simulate: true,
                read_timeout: Duration::from_secs(1),
                idle_backoff: Duration::from_millis(10),
                osa: Default::default(),
            },
        },
        shutdown_rx,
    );
    Harness {
        handle,
        shutdown,
        task,
        selections,
        unreachable,
        busy_position,
        health,
        log,
    }
}

/// Polls `condition` until it holds or the deadline passes.
async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_cycle_visits_active_channels_in_configuration_order() {
    // Positions deliberately not in sorted order: the cycle must follow
    // configuration order, not position order.
    let harness = start(vec![
        channel("alpha", 5, true),
        channel("beta", 2, true),
        channel("gamma", 9, false),
        channel("delta", 1, true),
    ]);

    assert!(
        wait_until(Duration::from_secs(2), || {
            harness.selections.lock().unwrap().len() >= 6
        })
        .await,
        "cycle never completed two passes"
    );

    let selections = harness.selections.lock().unwrap().clone();
    assert_eq!(&selections[..6], &[5, 2, 1, 5, 2, 1]);
    assert!(
        !selections.contains(&9),
        "inactive channel must never be routed"
    );
}

#[tokio::test]
async fn test_inactive_channel_yields_no_measurements() {
    let harness = start(vec![channel("alpha", 1, true), channel("beta", 2, false)]);

    assert!(
        wait_until(Duration::from_secs(2), || {
            harness.health.snapshot().cycles >= 3
        })
        .await,
        "scheduler never completed three cycles"
    );
    // Pause so the counters stop moving, then compare them.
    harness.handle.pause().await.unwrap();

    assert!(harness.log.latest("alpha").is_some());
    assert!(
        harness.log.latest("beta").is_none(),
        "inactive channels must never produce measurements"
    );

    let snap = harness.health.snapshot();
    let reads = snap.reads_ok + snap.reads_no_signal + snap.reads_failed;
    assert!(
        reads >= snap.cycles && reads <= snap.cycles + 1,
        "one active wavemeter channel means one read per cycle, got {reads} reads over {} cycles",
        snap.cycles
    );
}

#[tokio::test]
async fn test_lock_pins_the_cycle_to_one_channel() {
    let harness = start(vec![channel("alpha", 1, true), channel("beta", 2, true)]);

    harness.handle.lock("beta").await.unwrap();
    harness.selections.lock().unwrap().clear();
    sleep(Duration::from_millis(100)).await;

    let selections = harness.selections.lock().unwrap().clone();
    assert!(!selections.is_empty(), "locked cycle still runs");
    assert!(
        selections.iter().all(|&p| p == 2),
        "lock must exclude every other channel, saw {selections:?}"
    );
    assert!(harness.log.latest("beta").is_some());

    harness.handle.unlock().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            harness.selections.lock().unwrap().contains(&1)
        })
        .await,
        "unlock must return the cycle to the full plan"
    );
}

#[tokio::test]
async fn test_device_error_on_one_channel_never_blocks_the_next() {
    let harness = start(vec![channel("alpha", 1, true), channel("beta", 2, true)]);
    *harness.busy_position.lock().unwrap() = Some(1);

    assert!(
        wait_until(Duration::from_secs(2), || {
            let alpha_errored = harness
                .log
                .latest("alpha")
                .map(|m| m.status == Status::Error)
                .unwrap_or(false);
            let beta_reading = harness
                .log
                .latest("beta")
                .map(|m| m.status != Status::Error)
                .unwrap_or(false);
            alpha_errored && beta_reading
        })
        .await,
        "beta must keep reading while alpha's position is wedged"
    );
    assert!(
        harness.health.snapshot().switcher_available,
        "a busy position is not an outage"
    );
}

#[tokio::test]
async fn test_switcher_outage_degrades_without_stopping() {
    let harness = start(vec![channel("alpha", 1, true)]);

    assert!(
        wait_until(Duration::from_secs(2), || {
            harness.health.snapshot().reads_ok + harness.health.snapshot().reads_no_signal > 0
        })
        .await,
        "healthy phase produced no reads"
    );

    harness.unreachable.store(true, Ordering::SeqCst);
    assert!(
        wait_until(Duration::from_secs(2), || {
            !harness.health.snapshot().switcher_available
        })
        .await,
        "outage must be reflected in health"
    );
    assert!(
        wait_until(Duration::from_secs(2), || {
            harness.health.snapshot().reads_failed > 0
        })
        .await,
        "unroutable channels must yield error measurements"
    );
    assert_eq!(
        harness.log.latest("alpha").map(|m| m.status),
        Some(Status::Error)
    );
    // The command path stays responsive throughout the outage.
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.running);

    harness.unreachable.store(false, Ordering::SeqCst);
    assert!(
        wait_until(Duration::from_secs(2), || {
            harness.health.snapshot().switcher_available
        })
        .await,
        "recovery must be picked up by the lazy retry"
    );
    assert!(
        wait_until(Duration::from_secs(2), || {
            harness
                .log
                .latest("alpha")
                .map(|m| m.status != Status::Error)
                .unwrap_or(false)
        })
        .await,
        "reads must resume after the switcher answers again"
    );
}

#[tokio::test]
async fn test_outage_marks_every_active_channel_with_errors() {
    let harness = start(vec![channel("alpha", 1, true), channel("beta", 2, true)]);

    assert!(
        wait_until(Duration::from_secs(2), || {
            harness.log.latest("alpha").is_some() && harness.log.latest("beta").is_some()
        })
        .await,
        "healthy phase never reached both channels"
    );

    harness.unreachable.store(true, Ordering::SeqCst);
    let status_of = |name: &str| harness.log.latest(name).map(|m| m.status);
    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of("alpha") == Some(Status::Error) && status_of("beta") == Some(Status::Error)
        })
        .await,
        "every unroutable channel must keep yielding error-status measurements"
    );
    assert!(!harness.health.snapshot().switcher_available);

    harness.unreachable.store(false, Ordering::SeqCst);
    assert!(
        wait_until(Duration::from_secs(2), || {
            status_of("alpha").map(|s| s != Status::Error).unwrap_or(false)
                && status_of("beta").map(|s| s != Status::Error).unwrap_or(false)
        })
        .await,
        "every channel must resume once the switcher answers again"
    );
}

#[tokio::test]
async fn test_shutdown_finishes_the_in_flight_read_and_stops() {
    let harness = start(vec![channel("alpha", 1, true)]);
    sleep(Duration::from_millis(30)).await;

    harness.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), harness.task)
        .await
        .expect("scheduler must stop promptly after the shutdown flag")
        .unwrap();

    let after = harness.selections.lock().unwrap().len();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.selections.lock().unwrap().len(),
        after,
        "no selections may happen after the task ended"
    );
}
