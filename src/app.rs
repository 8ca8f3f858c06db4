//! Server assembly and lifecycle.
//!
//! [`App::start`] wires the whole process together from a validated
//! configuration: channel registry, switcher and instrument backends, the
//! measurement log, the session registry, the persistence sink, the
//! acquisition scheduler and the subscriber server. [`App::shutdown`] flips
//! the shared shutdown flag and joins the tasks in dependency order; the
//! scheduler finishes its in-flight channel read before exiting, and the sink
//! worker flushes once the scheduler's handle is gone.
//!
//! Backend selection is a construction-time choice. This build links the
//! simulated instruments and the fibre-switch driver; the vendor wavemeter
//! API is not part of it, so instrument-bearing configurations must run with
//! `acquisition.simulate = true`. Deployments with the real driver assemble
//! the scheduler from [`crate::scheduler::SchedulerParts`] directly.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::channel::ChannelRegistry;
use crate::config::{Config, SwitcherKind};
use crate::error::{AppResult, WavemuxError};
use crate::health::HealthMonitor;
use crate::instrument::sim::{SimulatedOsa, SimulatedWavemeter};
use crate::instrument::{EtalonScanner, FrequencyReader};
use crate::measurement::{MeasurementLog, Source};
use crate::network::session::SessionRegistry;
use crate::network::SubscriberServer;
use crate::scheduler::{self, SchedulerParts};
use crate::sink;
use crate::switch::{LeoniSwitcher, SimulatedSwitcher, Switcher};
use crate::version::Compatibility;

/// A running server: its listener address and the means to stop it.
pub struct App {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    scheduler_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
    sink_task: JoinHandle<()>,
}

impl App {
    /// Validates the configuration and starts every component.
    pub async fn start(config: Config) -> AppResult<Self> {
        config.validate().map_err(WavemuxError::Configuration)?;
        if let Compatibility::Degraded { warning } = config.check_version()? {
            warn!("configuration version differs from this build: {warning}");
        }

        let channels = Arc::new(ChannelRegistry::new(config.channels.clone())?);
        let log = Arc::new(MeasurementLog::new(config.distribution.ring_depth));
        let health = Arc::new(HealthMonitor::new());
        let sessions = Arc::new(SessionRegistry::new(
            channels.clone(),
            config.distribution.clone(),
        ));

        let switcher = build_switcher(&config, channels.max_position())?;
        let (wavemeter, osa) = build_instruments(&config)?;

        let mut sink_backend = sink::build(&config.sink)?;
        sink_backend.open().await?;
        let (sink_handle, sink_task) = sink::spawn(sink_backend, &config.sink);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (scheduler_handle, scheduler_task) = scheduler::spawn(
            SchedulerParts {
                channels,
                switcher,
                wavemeter,
                osa,
                log: log.clone(),
                sessions: sessions.clone(),
                sink: sink_handle,
                health,
                acquisition: config.acquisition.clone(),
            },
            shutdown_rx.clone(),
        );

        let server = SubscriberServer::bind(&config, sessions, log, scheduler_handle).await?;
        let local_addr = server.local_addr()?;
        let server_task = tokio::spawn(server.run(shutdown_rx));

        info!(
            name = %config.server.name,
            addr = %local_addr,
            simulate = config.acquisition.simulate,
            "server started"
        );
        Ok(Self {
            local_addr,
            shutdown,
            scheduler_task,
            server_task,
            sink_task,
        })
    }

    /// Address the subscriber listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops acquisition, closes every session and joins all tasks.
    pub async fn shutdown(self) -> AppResult<()> {
        info!("shutting down");
        let _ = self.shutdown.send(true);
        for (name, task) in [
            ("scheduler", self.scheduler_task),
            ("server", self.server_task),
            ("sink", self.sink_task),
        ] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "task did not shut down cleanly");
            }
        }
        info!("shutdown complete");
        Ok(())
    }
}

/// Starts the server and runs until interrupted.
pub async fn run(config: Config) -> AppResult<()> {
    let app = App::start(config).await?;
    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    app.shutdown().await
}

fn build_switcher(config: &Config, max_position: usize) -> AppResult<Box<dyn Switcher>> {
    if config.acquisition.simulate || config.switcher.kind == SwitcherKind::Simulated {
        return Ok(Box::new(
            SimulatedSwitcher::new(max_position.max(1)).with_settle(config.switcher.settle),
        ));
    }
    match config.switcher.kind {
        SwitcherKind::Leoni => {
            let host = config.switcher.host.clone().ok_or_else(|| {
                WavemuxError::Configuration("switcher.kind = 'leoni' requires switcher.host".into())
            })?;
            Ok(Box::new(LeoniSwitcher::new(
                host,
                config.switcher.port,
                config.switcher.settle,
            )))
        }
        SwitcherKind::Wavemeter => Err(WavemuxError::Configuration(
            "switcher.kind = 'wavemeter' needs the vendor wavemeter driver, which this build \
             does not link; use 'leoni' or 'simulated', or set acquisition.simulate"
                .into(),
        )),
        SwitcherKind::Simulated => unreachable!("handled above"),
    }
}

type Instruments = (
    Option<Arc<dyn FrequencyReader>>,
    Option<Arc<dyn EtalonScanner>>,
);

fn build_instruments(config: &Config) -> AppResult<Instruments> {
    if config.acquisition.simulate {
        let seed: u64 = rand::random();
        info!(seed, "using simulated instruments");
        return Ok((
            Some(Arc::new(SimulatedWavemeter::new(seed))),
            Some(Arc::new(SimulatedOsa::new(
                config.acquisition.osa.clone(),
                seed,
            ))),
        ));
    }

    let needs_wavemeter = config
        .channels
        .iter()
        .any(|c| c.active && c.has_mode(Source::Wavemeter));
    let needs_osa = config
        .channels
        .iter()
        .any(|c| c.active && c.has_mode(Source::Osa));
    if needs_wavemeter || needs_osa {
        return Err(WavemuxError::Configuration(
            "instrument-bearing channels need the vendor wavemeter driver, which this build \
             does not link; set acquisition.simulate = true"
                .into(),
        ));
    }
    Ok((None, None))
}
