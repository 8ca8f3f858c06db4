//! Session registry and per-session state.
//!
//! A [`Session`] is one connected subscriber: its identity, negotiated
//! version, subscription set with display aliases, and the bounded outbound
//! queue its socket writer drains. The [`SessionRegistry`] owns the live set
//! and is the only place fan-out and teardown meet: removal takes the write
//! lock, a fan-out pass takes the read lock for its whole walk, so a session
//! is never half-delivered-to and then gone.
//!
//! Subscription changes are validated here against the channel registry at
//! subscribe time; per-entry rejection never discards the valid entries that
//! arrived in the same request.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::ChannelRegistry;
use crate::config::DistributionSection;
use crate::distribution::{Drained, OutboundQueue, PushOutcome};
use crate::network::protocol::{Push, SubscriptionDecision, SubscriptionRequest};
use crate::version::VersionTuple;

#[derive(Debug, Default)]
struct SubscriptionSet {
    channels: HashSet<String>,
    /// Channel name to client-chosen display alias. Opaque to the server.
    aliases: HashMap<String, String>,
}

/// One connected subscriber.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub client: String,
    pub peer: SocketAddr,
    pub version: VersionTuple,
    /// True when the handshake passed with a minor-version difference.
    pub degraded: bool,
    pub connected_at: DateTime<Utc>,
    subscriptions: StdRwLock<SubscriptionSet>,
    queue: OutboundQueue<Push>,
}

impl Session {
    pub fn new(
        client: impl Into<String>,
        peer: SocketAddr,
        version: VersionTuple,
        degraded: bool,
        distribution: &DistributionSection,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client: client.into(),
            peer,
            version,
            degraded,
            connected_at: Utc::now(),
            subscriptions: StdRwLock::new(SubscriptionSet::default()),
            queue: OutboundQueue::new(
                distribution.queue_capacity,
                distribution.high_water,
                distribution.eviction_grace,
            ),
        }
    }

    fn subs(&self) -> std::sync::RwLockReadGuard<'_, SubscriptionSet> {
        match self.subscriptions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn subs_mut(&self) -> std::sync::RwLockWriteGuard<'_, SubscriptionSet> {
        match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subs().channels.contains(channel)
    }

    /// Channels this session receives, in no particular order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subs().channels.iter().cloned().collect()
    }

    pub fn alias_of(&self, channel: &str) -> Option<String> {
        self.subs().aliases.get(channel).cloned()
    }

    fn add_subscription(&self, channel: &str, alias: Option<String>) {
        let mut subs = self.subs_mut();
        subs.channels.insert(channel.to_owned());
        match alias {
            Some(alias) => {
                subs.aliases.insert(channel.to_owned(), alias);
            }
            None => {
                subs.aliases.remove(channel);
            }
        }
    }

    fn drop_subscription(&self, channel: &str) -> bool {
        let mut subs = self.subs_mut();
        subs.aliases.remove(channel);
        subs.channels.remove(channel)
    }

    /// Offers a message to this session's outbound queue. Non-blocking.
    pub fn push(&self, message: Push) -> PushOutcome {
        self.queue.push(message)
    }

    /// Awaited by the session's socket writer.
    pub async fn drain(&self) -> Drained<Push> {
        self.queue.drain().await
    }

    pub fn close(&self) {
        self.queue.close();
    }

    pub fn dropped_total(&self) -> u64 {
        self.queue.dropped_total()
    }
}

/// Live session set shared between the acceptor, per-session tasks and the
/// fan-out path.
pub struct SessionRegistry {
    channels: Arc<ChannelRegistry>,
    distribution: DistributionSection,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(channels: Arc<ChannelRegistry>, distribution: DistributionSection) -> Self {
        Self {
            channels,
            distribution,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Validates a batch of requested subscriptions against the channel
    /// registry, one decision per entry in request order.
    pub fn decide(&self, requested: &[SubscriptionRequest]) -> Vec<SubscriptionDecision> {
        requested
            .iter()
            .map(|req| {
                if self.channels.contains(&req.channel) {
                    SubscriptionDecision::accepted(&req.channel)
                } else {
                    SubscriptionDecision::rejected(
                        &req.channel,
                        format!("unknown channel '{}'", req.channel),
                    )
                }
            })
            .collect()
    }

    /// Builds a session from a completed handshake and registers it. The
    /// returned decisions mirror [`Self::decide`]; accepted entries are
    /// already applied to the session.
    pub async fn admit(
        &self,
        client: impl Into<String>,
        peer: SocketAddr,
        version: VersionTuple,
        degraded: bool,
        requested: &[SubscriptionRequest],
    ) -> (Arc<Session>, Vec<SubscriptionDecision>) {
        let session = Arc::new(Session::new(
            client,
            peer,
            version,
            degraded,
            &self.distribution,
        ));
        let decisions = self.decide(requested);
        for (req, decision) in requested.iter().zip(&decisions) {
            if decision.accepted {
                session.add_subscription(&req.channel, req.alias.clone());
            }
        }

        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        info!(
            session = %session.id,
            client = %session.client,
            peer = %session.peer,
            degraded = session.degraded,
            subscriptions = session.subscriptions().len(),
            "session admitted"
        );
        (session, decisions)
    }

    /// Adds one channel to a live session, validating the name first.
    pub fn subscribe(
        &self,
        session: &Session,
        channel: &str,
        alias: Option<String>,
    ) -> SubscriptionDecision {
        if !self.channels.contains(channel) {
            return SubscriptionDecision::rejected(
                channel,
                format!("unknown channel '{}'", channel),
            );
        }
        session.add_subscription(channel, alias);
        debug!(session = %session.id, channel, "subscribed");
        SubscriptionDecision::accepted(channel)
    }

    /// Drops one channel from a live session. Unsubscribing a channel the
    /// session never had is not an error.
    pub fn unsubscribe(&self, session: &Session, channel: &str) -> SubscriptionDecision {
        session.drop_subscription(channel);
        debug!(session = %session.id, channel, "unsubscribed");
        SubscriptionDecision::accepted(channel)
    }

    /// Removes a session and closes its queue. Idempotent.
    pub async fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(&id);
        if let Some(session) = &removed {
            session.close();
            info!(
                session = %session.id,
                client = %session.client,
                dropped = session.dropped_total(),
                "session removed"
            );
        }
        removed
    }

    /// Enqueues a message onto every session subscribed to `channel`.
    /// Sessions that hit their hard backpressure ceiling are evicted after
    /// the walk.
    pub async fn broadcast_channel(&self, channel: &str, message: &Push) {
        let mut evicted = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for session in sessions.values() {
                if !session.is_subscribed(channel) {
                    continue;
                }
                if let PushOutcome::EvictionTriggered { sustained } =
                    session.push(message.clone())
                {
                    evicted.push((session.id, session.client.clone(), sustained));
                }
            }
        }
        for (id, client, sustained) in evicted {
            warn!(
                session = %id,
                client = %client,
                sustained = ?sustained,
                "evicting session: outbound queue above high-water mark past the grace period"
            );
            self.remove(id).await;
        }
    }

    /// Enqueues a message onto every live session regardless of
    /// subscriptions. Used for state change notifications.
    pub async fn broadcast_all(&self, message: &Push) {
        let mut evicted = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for session in sessions.values() {
                if let PushOutcome::EvictionTriggered { sustained } =
                    session.push(message.clone())
                {
                    evicted.push((session.id, session.client.clone(), sustained));
                }
            }
        }
        for (id, client, sustained) in evicted {
            warn!(
                session = %id,
                client = %client,
                sustained = ?sustained,
                "evicting session: outbound queue above high-water mark past the grace period"
            );
            self.remove(id).await;
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Closes every queue and empties the set. Part of server shutdown.
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values() {
            session.close();
        }
        sessions.clear();
    }
}
