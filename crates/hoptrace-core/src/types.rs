//! Core types for hop discovery.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// RTT slot value for a round that timed out without a reply.
pub const TIMED_OUT_RTT: f64 = -1.0;

pub const DEFAULT_MAX_TTL: u8 = 30;
pub const DEFAULT_PROBES_PER_HOP: usize = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Settings for a single trace run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSettings {
    /// Target hostname or IP address, resolved by the transport.
    pub target_host: String,
    /// Highest TTL to probe before giving up.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u8,
    /// Number of rounds sent for each TTL.
    #[serde(default = "default_probes_per_hop")]
    pub probes_per_hop: usize,
    /// How long a single probe may stay unanswered.
    #[serde(
        rename = "timeout_ms",
        with = "duration_ms",
        default = "default_timeout"
    )]
    pub timeout: Duration,
}

fn default_max_ttl() -> u8 {
    DEFAULT_MAX_TTL
}

fn default_probes_per_hop() -> usize {
    DEFAULT_PROBES_PER_HOP
}

fn default_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS)
}

impl TraceSettings {
    /// Creates settings for `target_host` with default limits.
    pub fn new(target_host: impl Into<String>) -> Self {
        Self {
            target_host: target_host.into(),
            max_ttl: DEFAULT_MAX_TTL,
            probes_per_hop: DEFAULT_PROBES_PER_HOP,
            timeout: default_timeout(),
        }
    }

    pub fn with_max_ttl(mut self, max_ttl: u8) -> Self {
        self.max_ttl = max_ttl;
        self
    }

    pub fn with_probes_per_hop(mut self, probes_per_hop: usize) -> Self {
        self.probes_per_hop = probes_per_hop;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), crate::TraceError> {
        if self.target_host.trim().is_empty() {
            return Err(crate::TraceError::InvalidSettings(
                "target host must not be empty".into(),
            ));
        }
        if self.max_ttl == 0 {
            return Err(crate::TraceError::InvalidSettings(
                "max_ttl must be at least 1".into(),
            ));
        }
        if self.probes_per_hop == 0 {
            return Err(crate::TraceError::InvalidSettings(
                "probes_per_hop must be at least 1".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(crate::TraceError::InvalidSettings(
                "timeout must be greater than zero".into(),
            ));
        }
        // Serialized as whole milliseconds.
        if self.timeout.subsec_nanos() % 1_000_000 != 0 {
            return Err(crate::TraceError::InvalidSettings(format!(
                "timeout must be a whole number of milliseconds, got {:?}",
                self.timeout
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Measurements collected for one TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopRecord {
    /// Probe sequence number in effect when the record was opened.
    pub sequence_number: Option<u16>,
    /// Source address of the first reply seen at this TTL.
    pub host_ip: Option<IpAddr>,
    /// The TTL this record represents.
    pub ttl: u8,
    /// One slot per round in round order, in milliseconds, or [`TIMED_OUT_RTT`].
    pub rtt: Vec<f64>,
    /// Whether any round at this TTL got an answer.
    #[serde(default)]
    pub reachable: bool,
}

impl HopRecord {
    pub(crate) fn open(ttl: u8) -> Self {
        Self {
            sequence_number: None,
            host_ip: None,
            ttl,
            rtt: Vec::new(),
            reachable: false,
        }
    }

    /// Appends the next round's slot.
    pub(crate) fn push_rtt(&mut self, rtt: f64) {
        self.reachable |= rtt >= 0.0;
        self.rtt.push(rtt);
    }

    /// RTTs of the rounds that got an answer.
    pub fn replies(&self) -> impl Iterator<Item = f64> + '_ {
        self.rtt.iter().copied().filter(|rtt| *rtt >= 0.0)
    }

    pub fn min_rtt(&self) -> Option<f64> {
        self.replies().reduce(f64::min)
    }

    pub fn max_rtt(&self) -> Option<f64> {
        self.replies().reduce(f64::max)
    }

    pub fn avg_rtt(&self) -> Option<f64> {
        let (count, sum) = self
            .replies()
            .fold((0usize, 0.0), |(count, sum), rtt| (count + 1, sum + rtt));
        (count > 0).then(|| sum / count as f64)
    }

    /// Fraction of rounds that timed out, 0.0 for an empty record.
    pub fn loss_ratio(&self) -> f64 {
        if self.rtt.is_empty() {
            return 0.0;
        }
        let lost = self.rtt.len() - self.replies().count();
        lost as f64 / self.rtt.len() as f64
    }
}

/// Destination reply that ended a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceCompletion {
    /// Address the transport resolved the target to.
    pub destination: Option<IpAddr>,
    /// TTL of the probe that reached the destination.
    pub ttl: u8,
    /// Sequence number of the matched reply.
    pub sequence_number: u16,
    /// Round-trip time in milliseconds, if the send time was known.
    pub rtt: Option<f64>,
    /// Number of hop records emitted before completion.
    pub hops_recorded: usize,
}

/// Named states of the hop discovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceState {
    #[default]
    Idle,
    /// Transport startup requested, not yet confirmed.
    Starting,
    /// One probe in flight with its timeout armed.
    AwaitingReply,
    /// A hop record was just closed; the next TTL is about to be probed.
    HopComplete,
    /// The destination replied.
    Completed,
    /// The TTL budget ran out.
    Aborted,
}

impl TraceState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            TraceState::Starting | TraceState::AwaitingReply | TraceState::HopComplete
        )
    }
}

impl std::fmt::Display for TraceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceState::Idle => write!(f, "idle"),
            TraceState::Starting => write!(f, "starting"),
            TraceState::AwaitingReply => write!(f, "awaiting_reply"),
            TraceState::HopComplete => write!(f, "hop_complete"),
            TraceState::Completed => write!(f, "completed"),
            TraceState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Converts an elapsed duration into an RTT slot value.
pub(crate) fn rtt_ms(elapsed: Duration) -> f64 {
    elapsed.as_nanos() as f64 / 1_000_000.0
}
