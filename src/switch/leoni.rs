//! Fibre-switch client.
//!
//! The switch speaks a bare line protocol over TCP: every command is a short
//! ASCII string terminated by CRLF and answered with exactly one line.
//! `ch<N>` routes position N, `ch?` reports the routed position, `type?`
//! reports the model string (`eol 1x16` and friends, where the trailing
//! figure is the channel count), `firmware?` reports the firmware revision.
//!
//! The client connects lazily and drops the connection after any transport
//! fault, so a power-cycled switch heals on the next select.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::DeviceError;
use crate::switch::{Switcher, SwitcherCapability};

const COMMAND_TERMINATOR: &str = "\r\n";

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Channel count probed from `type?` right after connecting.
    channel_count: usize,
    /// Position confirmed by the switch, if any select has run.
    position: Option<usize>,
}

/// TCP client for an external fibre switch.
pub struct LeoniSwitcher {
    host: String,
    port: u16,
    settle: Duration,
    io_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl LeoniSwitcher {
    /// Creates a client for `host:port`. No connection is made until the
    /// first command; `settle` is the optical settling delay applied after
    /// each successful select.
    pub fn new(host: impl Into<String>, port: u16, settle: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            settle,
            io_timeout: Duration::from_secs(2),
            conn: Mutex::new(None),
        }
    }

    /// Overrides the per-exchange I/O timeout (default 2s).
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<Connection, DeviceError> {
        let endpoint = self.endpoint();
        let stream = timeout(self.io_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| DeviceError::Timeout(self.io_timeout))?
            .map_err(|e| DeviceError::Unreachable(format!("{endpoint}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
            channel_count: 0,
            position: None,
        };

        let model = self.exchange(&mut conn, "type?").await?;
        conn.channel_count = parse_channel_count(&model)?;
        match self.exchange(&mut conn, "firmware?").await {
            Ok(firmware) => {
                info!(%endpoint, %model, %firmware, channels = conn.channel_count,
                    "connected to fibre switch");
            }
            Err(e) => {
                debug!(%endpoint, error = %e, "switch did not report firmware");
                info!(%endpoint, %model, channels = conn.channel_count,
                    "connected to fibre switch");
            }
        }
        Ok(conn)
    }

    /// One command, one response line, both bounded by the I/O timeout.
    async fn exchange(&self, conn: &mut Connection, command: &str) -> Result<String, DeviceError> {
        trace!(command, "fibre switch command");
        let payload = format!("{command}{COMMAND_TERMINATOR}");
        timeout(self.io_timeout, conn.writer.write_all(payload.as_bytes()))
            .await
            .map_err(|_| DeviceError::Timeout(self.io_timeout))?
            .map_err(|e| DeviceError::Unreachable(format!("{}: {e}", self.endpoint())))?;

        let mut line = String::new();
        let read = timeout(self.io_timeout, conn.reader.read_line(&mut line))
            .await
            .map_err(|_| DeviceError::Timeout(self.io_timeout))?
            .map_err(|e| DeviceError::Unreachable(format!("{}: {e}", self.endpoint())))?;
        if read == 0 {
            return Err(DeviceError::Unreachable(format!(
                "{}: connection closed by switch",
                self.endpoint()
            )));
        }
        let response = line.trim().to_string();
        trace!(command, %response, "fibre switch response");
        Ok(response)
    }
}

#[async_trait]
impl Switcher for LeoniSwitcher {
    async fn select_channel(&self, position: usize) -> Result<(), DeviceError> {
        {
            let mut guard = self.conn.lock().await;
            if guard.is_none() {
                *guard = Some(self.connect().await?);
            }
            let conn = match guard.as_mut() {
                Some(conn) => conn,
                None => return Err(DeviceError::Unreachable(self.endpoint())),
            };

            // Local bounds check; the switch would silently ignore a bad one.
            if position == 0 || position > conn.channel_count {
                return Err(DeviceError::PositionOutOfRange {
                    position,
                    max: conn.channel_count,
                });
            }

            let command = format!("ch{position}");
            match self.exchange(conn, &command).await {
                Ok(response) => {
                    if !response.is_empty() && !response.contains(&position.to_string()) {
                        warn!(%command, %response, "unexpected select acknowledgement");
                    }
                    conn.position = Some(position);
                }
                Err(e) => {
                    *guard = None;
                    return Err(e);
                }
            }
        }
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    async fn current_position(&self) -> Result<Option<usize>, DeviceError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return Err(DeviceError::Unreachable(self.endpoint())),
        };

        if let Some(position) = conn.position {
            return Ok(Some(position));
        }
        match self.exchange(conn, "ch?").await {
            Ok(response) => {
                let position = parse_position(&response)?;
                conn.position = Some(position);
                Ok(Some(position))
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    fn capability(&self) -> SwitcherCapability {
        SwitcherCapability::FibreSwitch
    }

    fn describe(&self) -> String {
        format!("fibre switch at {}", self.endpoint())
    }
}

/// Parses the channel count out of a model string such as `eol 1x16`.
fn parse_channel_count(model: &str) -> Result<usize, DeviceError> {
    model
        .rsplit(['x', 'X'])
        .next()
        .and_then(|tail| tail.trim().parse::<usize>().ok())
        .filter(|count| *count > 0)
        .ok_or_else(|| DeviceError::Malformed(model.to_string()))
}

/// Parses a routed position out of a `ch?` response such as `ch7`.
fn parse_position(response: &str) -> Result<usize, DeviceError> {
    response
        .trim()
        .trim_start_matches("ch")
        .trim()
        .parse::<usize>()
        .map_err(|_| DeviceError::Malformed(response.to_string()))
}
