//! Wire protocol for subscriber sessions.
//!
//! Everything on the socket is newline-delimited JSON, one message per line.
//! The first exchange is the handshake: the client sends a [`ClientHello`]
//! declaring its name, version and desired subscriptions, and the server
//! answers with a [`ServerHello`] carrying the compatibility verdict and a
//! per-entry subscription decision. After that the server pushes [`Push`]
//! messages as measurements are produced, and the client may send
//! [`ClientRequest`] lines at any time.
//!
//! Subscription handling is per entry: an unknown channel name rejects that
//! entry with a diagnostic while the rest of the request still proceeds.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::distribution::GapMarker;
use crate::error::{AppResult, WavemuxError};
use crate::health::HealthSnapshot;
use crate::measurement::{Measurement, OsaTrace};
use crate::version::VersionTuple;

/// Upper bound on a single protocol line, handshake included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// First message on a new connection, client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Client-chosen display name, used in logs and eviction diagnostics.
    pub client: String,
    /// Protocol version the client was built against.
    pub version: VersionTuple,
    /// Channels the client wants pushed, checked one entry at a time.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionRequest>,
}

/// One requested channel in a hello or a later subscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub channel: String,
    /// Display alias the client wants associated with the channel. Stored
    /// per session, never interpreted by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl SubscriptionRequest {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            alias: None,
        }
    }

    pub fn with_alias(channel: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            alias: Some(alias.into()),
        }
    }
}

/// Overall handshake outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeVerdict {
    /// Versions compatible, session is live.
    Accepted,
    /// Minor versions differ; session is live but feature availability is
    /// not guaranteed, see the attached warning.
    Degraded,
    /// Major versions differ; the connection closes after this message.
    Rejected,
}

/// Server's answer to one subscription entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDecision {
    pub channel: String,
    pub accepted: bool,
    /// Diagnostic naming the problem when `accepted` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SubscriptionDecision {
    pub fn accepted(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Server's reply to a [`ClientHello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    pub verdict: HandshakeVerdict,
    /// Server instance name from its configuration.
    pub server: String,
    /// Version this server build carries.
    pub version: VersionTuple,
    /// Present on `Degraded` (feature-availability risk) and on `Rejected`
    /// (the reason the connection is closing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// One decision per requested subscription, in request order.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionDecision>,
}

impl ServerHello {
    pub fn accepted(server: impl Into<String>, subscriptions: Vec<SubscriptionDecision>) -> Self {
        Self {
            verdict: HandshakeVerdict::Accepted,
            server: server.into(),
            version: VersionTuple::server(),
            warning: None,
            subscriptions,
        }
    }

    pub fn degraded(
        server: impl Into<String>,
        warning: impl Into<String>,
        subscriptions: Vec<SubscriptionDecision>,
    ) -> Self {
        Self {
            verdict: HandshakeVerdict::Degraded,
            server: server.into(),
            version: VersionTuple::server(),
            warning: Some(warning.into()),
            subscriptions,
        }
    }

    pub fn rejected(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            verdict: HandshakeVerdict::Rejected,
            server: server.into(),
            version: VersionTuple::server(),
            warning: Some(reason.into()),
            subscriptions: Vec::new(),
        }
    }
}

/// Requests a live session may send after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Add one channel to the session's subscription set.
    Subscribe {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    /// Drop one channel from the subscription set.
    Unsubscribe { channel: String },
    /// Pin the acquisition cycle to a single channel.
    Lock { channel: String },
    /// Resume cycling over all active channels.
    Unlock,
    /// Suspend acquisition without dropping sessions.
    Pause,
    /// Resume a paused acquisition loop.
    Resume,
    /// Liveness probe; the server answers with [`Push::Pong`].
    Ping,
}

/// Scheduler state as pushed to clients on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// False while the loop is paused.
    pub running: bool,
    /// Channel the cycle is pinned to, if a lock is held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<String>,
    pub health: HealthSnapshot,
}

/// Server-to-client stream messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Push {
    /// One reading for one subscribed channel.
    Measurement(Measurement),
    /// Full spectrum trace for a channel acquiring in OSA mode.
    OsaTrace(OsaTrace),
    /// Stands in for `dropped` measurements the session's queue discarded
    /// under the drop-oldest overflow policy.
    Gap { dropped: u64 },
    /// Scheduler and health state, sent after the handshake and on change.
    State(StateSnapshot),
    /// Outcome of a post-handshake subscribe or unsubscribe.
    Subscription(SubscriptionDecision),
    /// A request could not be honored; the session stays open.
    Error { message: String },
    /// Server keepalive, sent on an idle interval.
    Ping,
    /// Answer to a client [`ClientRequest::Ping`].
    Pong,
}

impl GapMarker for Push {
    fn gap(dropped: u64) -> Self {
        Push::Gap { dropped }
    }
}

/// Writes one message as a JSON line and flushes it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next non-blank line and parses it as `T`.
///
/// Returns `Ok(None)` on a clean EOF. Oversized or unparseable lines are
/// protocol errors; per policy those close the offending session and nothing
/// else. The line buffer is capped at [`MAX_LINE_BYTES`], so a runaway peer
/// cannot balloon memory; an over-long line's unread remainder is discarded
/// (up to one further cap's worth) so the error reply still reaches the peer
/// over an orderly close instead of a reset.
pub async fn read_message<R, T>(reader: &mut R) -> AppResult<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let (consumed, terminated) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                return Err(WavemuxError::Protocol(
                    "connection closed mid-message".to_string(),
                ));
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    line.extend_from_slice(&available[..idx]);
                    (idx + 1, true)
                }
                None => {
                    line.extend_from_slice(available);
                    (available.len(), false)
                }
            }
        };
        reader.consume(consumed);

        if line.len() > MAX_LINE_BYTES {
            if !terminated {
                discard_line_remainder(reader, MAX_LINE_BYTES).await?;
            }
            return Err(WavemuxError::Protocol(format!(
                "line exceeds the {} byte limit",
                MAX_LINE_BYTES
            )));
        }
        if !terminated {
            continue;
        }

        let text = std::str::from_utf8(&line)
            .map_err(|_| WavemuxError::Protocol("message is not valid utf-8".to_string()))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            line.clear();
            continue;
        }
        let message = serde_json::from_str(trimmed)
            .map_err(|e| WavemuxError::Protocol(format!("unparseable message: {}", e)))?;
        return Ok(Some(message));
    }
}

/// Consumes and drops the unread tail of an over-long line, giving up after
/// `budget` more bytes or at EOF.
async fn discard_line_remainder<R>(reader: &mut R, budget: usize) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut remaining = budget;
    while remaining > 0 {
        let (consumed, terminated) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            let take = available.len().min(remaining);
            match available[..take].iter().position(|&b| b == b'\n') {
                Some(idx) => (idx + 1, true),
                None => (take, false),
            }
        };
        reader.consume(consumed);
        remaining -= consumed;
        if terminated {
            break;
        }
    }
    Ok(())
}
