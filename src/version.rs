//! Semantic version tuple and the client/server compatibility rule.
//!
//! Both the wire handshake and the configuration compatibility check use the
//! same rule, applied to a `(major, minor, patch)` tuple:
//!
//! - differing **major** versions are incompatible: the handshake is refused
//!   (or the server refuses to start with that configuration);
//! - differing **minor** versions are accepted but flagged: one side carries
//!   features the other lacks, so the session runs in degraded mode and a
//!   warning naming both versions is surfaced;
//! - **patch** is never compared.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WavemuxError;

/// A `(major, minor, patch)` version triple.
///
/// On the wire this serializes as an object with the three named fields, so
/// either side can add metadata later without breaking older peers. In
/// configuration files it appears as a dotted string and goes through
/// [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTuple {
    /// Incremented on wire-protocol or behavior breaks.
    pub major: u32,
    /// Incremented when features are added compatibly.
    pub minor: u32,
    /// Never part of any compatibility decision.
    pub patch: u32,
}

/// Outcome of comparing a peer (or configuration) version against the
/// running server's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    /// Major and minor match; patch may differ.
    Full,
    /// Minor differs. The session proceeds with reduced feature guarantees;
    /// the warning text is surfaced to the peer.
    Degraded {
        /// Human-readable description of the feature-availability risk.
        warning: String,
    },
    /// Major differs. The handshake (or startup) must fail.
    Incompatible {
        /// Human-readable refusal reason.
        reason: String,
    },
}

impl VersionTuple {
    /// Builds a tuple from its three components.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// The version of this server build, taken from the crate version.
    pub fn server() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        }
    }

    /// Applies the compatibility rule with `self` as the server side.
    pub fn check_peer(&self, peer: &VersionTuple) -> Compatibility {
        if peer.major != self.major {
            return Compatibility::Incompatible {
                reason: format!(
                    "peer version {peer} and server version {self} differ in major version"
                ),
            };
        }
        if peer.minor != self.minor {
            return Compatibility::Degraded {
                warning: format!(
                    "peer version {peer} and server version {self} differ in minor version; \
                     features added in the newer minor release may be unavailable"
                ),
            };
        }
        Compatibility::Full
    }
}

impl fmt::Display for VersionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for VersionTuple {
    type Err = WavemuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |what: &str| -> Result<u32, WavemuxError> {
            parts
                .next()
                .ok_or_else(|| {
                    WavemuxError::Configuration(format!(
                        "version '{s}' is missing its {what} component"
                    ))
                })?
                .parse()
                .map_err(|_| {
                    WavemuxError::Configuration(format!(
                        "version '{s}' has a non-numeric {what} component"
                    ))
                })
        };
        Ok(Self {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        })
    }
}
