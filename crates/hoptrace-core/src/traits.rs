//! Seams between the engine, the ping transport and result consumers.

use crate::{HopRecord, TraceCompletion, TraceError, TransportEvents};

/// ICMP echo transport driven by the engine.
///
/// Every method is a request: results come back later through the
/// [`TransportEvents`] handle passed to [`PingTransport::start`]. The transport
/// owns packet parsing, name resolution and sequence matching; the engine only
/// sees demultiplexed events.
pub trait PingTransport: Send + 'static {
    /// Resolves `host` and opens the socket, then reports `started` or
    /// `start_failed`.
    fn start(&mut self, host: &str, events: TransportEvents);

    /// Closes the socket. Must be safe to call when not started.
    fn stop(&mut self);

    /// Sets the TTL used for subsequent sends.
    fn set_ttl(&mut self, ttl: u8) -> std::io::Result<()>;

    /// Sends one echo request, then reports `sent` or `send_failed`.
    ///
    /// `sent` must be reported before any reply to that request; replies that
    /// arrive while the in-flight request is unconfirmed are treated as
    /// answers to earlier requests.
    fn send(&mut self);
}

/// Receiver of run results.
///
/// Notifications are delivered from the engine task, one at a time.
pub trait TraceObserver: Send + 'static {
    /// Called when the run flag flips, never twice with the same value.
    fn on_running_changed(&mut self, running: bool);

    /// Called exactly once per TTL whose rounds all completed.
    fn on_hop_recorded(&mut self, record: &HopRecord);

    /// Called for every failure that ends a run, including the TTL budget
    /// running out.
    fn on_error(&mut self, error: &TraceError);

    /// Called when the destination replied.
    fn on_completed(&mut self, _completion: &TraceCompletion) {}
}

impl<T: TraceObserver + ?Sized> TraceObserver for Box<T> {
    fn on_running_changed(&mut self, running: bool) {
        (**self).on_running_changed(running)
    }

    fn on_hop_recorded(&mut self, record: &HopRecord) {
        (**self).on_hop_recorded(record)
    }

    fn on_error(&mut self, error: &TraceError) {
        (**self).on_error(error)
    }

    fn on_completed(&mut self, completion: &TraceCompletion) {
        (**self).on_completed(completion)
    }
}

impl<T: PingTransport + ?Sized> PingTransport for Box<T> {
    fn start(&mut self, host: &str, events: TransportEvents) {
        (**self).start(host, events)
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn set_ttl(&mut self, ttl: u8) -> std::io::Result<()> {
        (**self).set_ttl(ttl)
    }

    fn send(&mut self) {
        (**self).send()
    }
}
