//! TCP subscriber server.
//!
//! One task accepts connections; each client then gets two tasks of its own.
//! The reader runs the handshake and then consumes [`ClientRequest`] lines;
//! the writer drains the session's outbound queue onto the socket and emits
//! the keepalive ping. The two are tied together through the session's queue:
//! removing the session closes the queue, which ends the writer, and either
//! side finishing tears the whole client down.
//!
//! Socket writes happen only here, nothing upstream ever waits for them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::distribution::Drained;
use crate::error::{AppResult, WavemuxError};
use crate::measurement::MeasurementLog;
use crate::network::protocol::{
    read_message, write_message, ClientHello, ClientRequest, Push, ServerHello,
};
use crate::network::session::{Session, SessionRegistry};
use crate::scheduler::SchedulerHandle;
use crate::version::{Compatibility, VersionTuple};

/// Bounded wait for the client's hello after the TCP connect.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared context cloned into every client task.
#[derive(Clone)]
struct ClientCtx {
    server_name: String,
    ping_interval: Duration,
    sessions: Arc<SessionRegistry>,
    log: Arc<MeasurementLog>,
    scheduler: SchedulerHandle,
}

/// Listener plus the shared state client tasks need.
pub struct SubscriberServer {
    listener: TcpListener,
    ctx: ClientCtx,
}

impl SubscriberServer {
    /// Binds the listener declared in the configuration.
    pub async fn bind(
        config: &Config,
        sessions: Arc<SessionRegistry>,
        log: Arc<MeasurementLog>,
        scheduler: SchedulerHandle,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(&config.server.listen).await?;
        info!(addr = %listener.local_addr()?, "subscriber server listening");
        Ok(Self {
            listener,
            ctx: ClientCtx {
                server_name: config.server.name.clone(),
                ping_interval: config.server.ping_interval,
                sessions,
                log,
                scheduler,
            },
        })
    }

    /// Address actually bound, for port-0 test listeners.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients until `shutdown` flips to true, then closes every
    /// session and joins the client tasks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut clients: Vec<JoinHandle<()>> = Vec::new();
        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((socket, peer)) => {
                        let ctx = self.ctx.clone();
                        let shutdown = shutdown.clone();
                        clients.push(tokio::spawn(async move {
                            if let Err(e) = handle_client(socket, peer, ctx, shutdown).await {
                                debug!(peer = %peer, error = %e, "client connection ended");
                            }
                        }));
                        clients.retain(|task| !task.is_finished());
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("subscriber server shutting down, closing sessions");
        self.ctx.sessions.clear().await;
        futures::future::join_all(clients).await;
        info!("subscriber server stopped");
    }
}

async fn handle_client(
    socket: TcpStream,
    peer: SocketAddr,
    ctx: ClientCtx,
    shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    let _ = socket.set_nodelay(true);
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let hello: ClientHello = match timeout(HANDSHAKE_TIMEOUT, read_message(&mut reader)).await {
        Ok(Ok(Some(hello))) => hello,
        Ok(Ok(None)) => {
            debug!(peer = %peer, "closed before handshake");
            return Ok(());
        }
        Ok(Err(e)) => {
            let reply =
                ServerHello::rejected(&ctx.server_name, format!("malformed handshake: {}", e));
            let _ = write_message(&mut write_half, &reply).await;
            return Err(e);
        }
        Err(_) => {
            warn!(peer = %peer, "handshake timed out");
            return Ok(());
        }
    };

    let server_version = VersionTuple::server();
    let warning = match server_version.check_peer(&hello.version) {
        Compatibility::Incompatible { reason } => {
            warn!(
                peer = %peer,
                client = %hello.client,
                version = %hello.version,
                "handshake rejected: {reason}"
            );
            write_message(
                &mut write_half,
                &ServerHello::rejected(&ctx.server_name, reason),
            )
            .await?;
            return Ok(());
        }
        Compatibility::Degraded { warning } => {
            warn!(
                peer = %peer,
                client = %hello.client,
                version = %hello.version,
                "session degraded: {warning}"
            );
            Some(warning)
        }
        Compatibility::Full => None,
    };

    let (session, decisions) = ctx
        .sessions
        .admit(
            &hello.client,
            peer,
            hello.version,
            warning.is_some(),
            &hello.subscriptions,
        )
        .await;
    let reply = match warning {
        Some(warning) => ServerHello::degraded(&ctx.server_name, warning, decisions),
        None => ServerHello::accepted(&ctx.server_name, decisions),
    };
    write_message(&mut write_half, &reply).await?;

    // Seed the fresh session: current scheduler state, then the last known
    // measurement for every channel it subscribed to.
    if let Ok(snapshot) = ctx.scheduler.snapshot().await {
        session.push(Push::State(snapshot));
    }
    backfill(&ctx, &session, &session.subscriptions());

    let mut writer_task = {
        let session = session.clone();
        let ping_interval = ctx.ping_interval;
        tokio::spawn(write_loop(write_half, session, ping_interval))
    };

    let read_result;
    tokio::select! {
        result = read_loop(&mut reader, &ctx, &session, shutdown) => {
            read_result = result;
        }
        _ = &mut writer_task => {
            // Writer gone first: socket write failure or eviction.
            read_result = Ok(());
        }
    }

    ctx.sessions.remove(session.id).await;
    if !writer_task.is_finished() {
        let _ = writer_task.await;
    }
    read_result
}

/// Replays each named channel's recent measurement ring, oldest first.
fn backfill(ctx: &ClientCtx, session: &Session, channels: &[String]) {
    for channel in channels {
        for measurement in ctx.log.recent(channel, ctx.log.depth()) {
            session.push(Push::Measurement(measurement));
        }
    }
}

async fn read_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    ctx: &ClientCtx,
    session: &Arc<Session>,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    loop {
        let request = tokio::select! {
            request = read_message::<_, ClientRequest>(reader) => request,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };
        match request {
            Ok(Some(request)) => handle_request(ctx, session, request).await,
            Ok(None) => {
                debug!(client = %session.client, "client disconnected");
                return Ok(());
            }
            Err(e) => {
                // A protocol violation closes this session and nothing else.
                warn!(client = %session.client, error = %e, "protocol error, closing session");
                return Err(e);
            }
        }
    }
}

async fn handle_request(ctx: &ClientCtx, session: &Arc<Session>, request: ClientRequest) {
    match request {
        ClientRequest::Ping => {
            session.push(Push::Pong);
        }
        ClientRequest::Subscribe { channel, alias } => {
            // Ring replay happens once, on the fresh subscription; a repeat
            // subscribe is just an ack.
            let fresh = !session.is_subscribed(&channel);
            let decision = ctx.sessions.subscribe(session, &channel, alias);
            let accepted = decision.accepted;
            session.push(Push::Subscription(decision));
            if accepted && fresh {
                backfill(ctx, session, std::slice::from_ref(&channel));
            }
        }
        ClientRequest::Unsubscribe { channel } => {
            let decision = ctx.sessions.unsubscribe(session, &channel);
            session.push(Push::Subscription(decision));
        }
        ClientRequest::Lock { channel } => {
            if let Err(e) = ctx.scheduler.lock(&channel).await {
                session.push(Push::Error {
                    message: e.to_string(),
                });
            }
        }
        ClientRequest::Unlock => {
            if let Err(e) = ctx.scheduler.unlock().await {
                session.push(Push::Error {
                    message: e.to_string(),
                });
            }
        }
        ClientRequest::Pause => {
            if let Err(e) = ctx.scheduler.pause().await {
                session.push(Push::Error {
                    message: e.to_string(),
                });
            }
        }
        ClientRequest::Resume => {
            if let Err(e) = ctx.scheduler.resume().await {
                session.push(Push::Error {
                    message: e.to_string(),
                });
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, session: Arc<Session>, ping_interval: Duration) {
    // First tick a full interval out, so the keepalive never races the
    // handshake seeding onto the socket.
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ping = tokio::time::interval_at(start, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            drained = session.drain() => match drained {
                Drained::Items(items) => {
                    for item in &items {
                        if let Err(e) = write_message(&mut writer, item).await {
                            debug!(client = %session.client, error = %e, "write failed, closing session");
                            return;
                        }
                    }
                }
                Drained::Evicted { sustained } => {
                    let notice = WavemuxError::BackpressureEviction {
                        session: session.client.clone(),
                        sustained,
                    };
                    let _ = write_message(
                        &mut writer,
                        &Push::Error {
                            message: notice.to_string(),
                        },
                    )
                    .await;
                    return;
                }
                Drained::Closed => return,
            },
            _ = ping.tick() => {
                if write_message(&mut writer, &Push::Ping).await.is_err() {
                    debug!(client = %session.client, "keepalive write failed, closing session");
                    return;
                }
            }
        }
    }
}
