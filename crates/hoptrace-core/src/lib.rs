//! Hop discovery engine for ICMP traceroute.
//!
//! This crate drives a traceroute run one probe at a time:
//!
//! - [`TraceEngine`] hosts the TTL/round state machine on a tokio task
//! - [`PingTransport`] is the seam to the ICMP echo transport
//! - [`TraceObserver`] receives hop records, errors and completion
//! - [`TraceError`] for error handling
//! - [`TraceReport`] aggregates a run for JSON output

mod engine;
pub mod error;
pub mod event;
pub mod observer;
pub mod result;
mod timer;
pub mod traits;
pub mod types;

pub use engine::TraceEngine;
pub use error::{ErrorKind, TraceError, TraceResult};
pub use event::{TransportEvent, TransportEvents};
pub use observer::{ChannelObserver, TraceNotification, TracingObserver};
pub use result::{TraceOutcome, TraceReport};
pub use traits::{PingTransport, TraceObserver};
pub use types::{HopRecord, TraceCompletion, TraceSettings, TraceState, TIMED_OUT_RTT};
