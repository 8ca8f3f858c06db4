//! Fan-out backpressure tests.
//!
//! The scheduler publishes through bounded per-session queues; these tests
//! pin the two-tier overflow policy at the component level. A consumer that
//! falls behind loses oldest-first and sees a gap marker counting the loss;
//! a consumer that stalls above the high-water mark past the grace period is
//! evicted. The acquisition cycle must keep its pace through all of it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use wavemux::channel::{ChannelConfig, ChannelRegistry};
use wavemux::config::{AcquisitionSection, DistributionSection, SinkKind, SinkSection};
use wavemux::distribution::Drained;
use wavemux::health::HealthMonitor;
use wavemux::instrument::sim::SimulatedWavemeter;
use wavemux::measurement::{MeasurementLog, Source};
use wavemux::network::protocol::{Push, SubscriptionRequest};
use wavemux::network::session::SessionRegistry;
use wavemux::scheduler::{self, SchedulerHandle, SchedulerParts};
use wavemux::sink::{self, NullSink};
use wavemux::switch::SimulatedSwitcher;
use wavemux::version::VersionTuple;

fn channel(name: &str, position: usize) -> ChannelConfig {
    ChannelConfig {
        name: name.to_string(),
        reference: 4.74e14,
        exposure_ms: 5,
        switcher_position: position,
        array: 1,
        use_blue_etalon: false,
        active: true,
        modes: vec![Source::Wavemeter],
    }
}

fn peer() -> SocketAddr {
    "127.0.0.1:4000".parse().unwrap()
}

struct Harness {
    sessions: Arc<SessionRegistry>,
    health: Arc<HealthMonitor>,
    _handle: SchedulerHandle,
    _shutdown: watch::Sender<bool>,
}

fn start(distribution: DistributionSection) -> Harness {
    let registry = Arc::new(ChannelRegistry::new(vec![channel("cesium", 1)]).unwrap());
    let sessions = Arc::new(SessionRegistry::new(registry.clone(), distribution));
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
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (handle, _task) = scheduler::spawn(
        SchedulerParts {
            channels: registry,
            switcher: Box::new(SimulatedSwitcher::new(4)),
            wavemeter: Some(Arc::new(SimulatedWavemeter::new(3))),
            osa: None,
            log: Arc::new(MeasurementLog::new(8)),
            sessions: sessions.clone(),
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
        sessions,
        health,
        _handle: handle,
        _shutdown: shutdown,
    }
}

#[tokio::test]
async fn test_stalled_subscriber_is_evicted_and_the_cycle_keeps_pace() {
    let harness = start(DistributionSection {
        queue_capacity: 8,
        high_water: 4,
        eviction_grace: Duration::from_millis(100),
        ring_depth: 8,
    });

    let (stalled, _) = harness
        .sessions
        .admit(
            "stalled",
            peer(),
            VersionTuple::server(),
            false,
            &[SubscriptionRequest::new("cesium")],
        )
        .await;
    let (healthy, _) = harness
        .sessions
        .admit(
            "healthy",
            peer(),
            VersionTuple::server(),
            false,
            &[SubscriptionRequest::new("cesium")],
        )
        .await;

    // The healthy consumer drains continuously; the stalled one never does.
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let consumer = healthy.clone();
    tokio::spawn(async move {
        loop {
            match consumer.drain().await {
                Drained::Items(items) => {
                    let n = items
                        .iter()
                        .filter(|p| matches!(p, Push::Measurement(_)))
                        .count();
                    counter.fetch_add(n, Ordering::SeqCst);
                }
                _ => break,
            }
        }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while harness.sessions.count().await > 1 && tokio::time::Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        harness.sessions.count().await,
        1,
        "the stalled session must be evicted once the grace period passes"
    );
    match stalled.drain().await {
        Drained::Evicted { sustained } => {
            assert!(sustained >= Duration::from_millis(100));
        }
        other => panic!("expected the eviction marker, got {other:?}"),
    }

    // Acquisition pace and the surviving consumer are unaffected.
    let cycles_then = harness.health.snapshot().cycles;
    let received_then = received.load(Ordering::SeqCst);
    sleep(Duration::from_millis(300)).await;
    let cycles_now = harness.health.snapshot().cycles;
    assert!(
        cycles_now >= cycles_then + 10,
        "cycle slowed down: {cycles_then} -> {cycles_now}"
    );
    assert!(
        received.load(Ordering::SeqCst) > received_then,
        "healthy consumer must keep receiving"
    );
}

#[tokio::test]
async fn test_lagging_subscriber_sees_gap_markers_with_drops_counted() {
    let harness = start(DistributionSection {
        queue_capacity: 4,
        high_water: 3,
        eviction_grace: Duration::from_secs(30),
        ring_depth: 8,
    });
    let (lagging, _) = harness
        .sessions
        .admit(
            "lagging",
            peer(),
            VersionTuple::server(),
            false,
            &[SubscriptionRequest::new("cesium")],
        )
        .await;

    let mut saw_gap = false;
    let mut measurements = 0usize;
    let mut last_timestamp = None;
    for _ in 0..6 {
        // Fall well behind: the producer emits roughly 25 measurements per
        // window into a four-slot queue.
        sleep(Duration::from_millis(150)).await;
        match tokio::time::timeout(Duration::from_secs(2), lagging.drain())
            .await
            .expect("drain starved")
        {
            Drained::Items(items) => {
                for (idx, push) in items.iter().enumerate() {
                    match push {
                        Push::Gap { dropped } => {
                            assert_eq!(idx, 0, "gap marker must precede the survivors");
                            assert!(*dropped > 0);
                            saw_gap = true;
                        }
                        Push::Measurement(m) => {
                            measurements += 1;
                            if let Some(prev) = last_timestamp.replace(m.timestamp) {
                                assert!(
                                    m.timestamp >= prev,
                                    "delivery order must survive the drops"
                                );
                            }
                        }
                        other => panic!("unexpected push: {other:?}"),
                    }
                }
            }
            other => panic!("queue unexpectedly ended: {other:?}"),
        }
    }

    assert!(saw_gap, "a consumer this slow must observe at least one gap");
    assert!(measurements > 0);
    assert!(
        lagging.dropped_total() > 0,
        "drop accounting must reflect the overflow"
    );
    assert_eq!(
        harness.sessions.count().await,
        1,
        "a draining consumer is never evicted, however far behind"
    );
}
