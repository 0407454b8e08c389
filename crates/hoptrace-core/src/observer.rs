//! Ready-made observers.

use crate::{ErrorKind, HopRecord, TraceCompletion, TraceError, TraceObserver};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A single observer callback, as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceNotification {
    RunningChanged(bool),
    HopRecorded(HopRecord),
    Error { kind: ErrorKind, detail: String },
    Completed(TraceCompletion),
}

/// Forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TraceNotification>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TraceNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, notification: TraceNotification) {
        // The receiver going away only means nobody is listening anymore.
        let _ = self.tx.send(notification);
    }
}

impl TraceObserver for ChannelObserver {
    fn on_running_changed(&mut self, running: bool) {
        self.forward(TraceNotification::RunningChanged(running));
    }

    fn on_hop_recorded(&mut self, record: &HopRecord) {
        self.forward(TraceNotification::HopRecorded(record.clone()));
    }

    fn on_error(&mut self, error: &TraceError) {
        self.forward(TraceNotification::Error {
            kind: error.kind(),
            detail: error.to_string(),
        });
    }

    fn on_completed(&mut self, completion: &TraceCompletion) {
        self.forward(TraceNotification::Completed(completion.clone()));
    }
}

/// Logs every notification through `tracing`, then hands it to `inner`.
#[derive(Debug, Clone)]
pub struct TracingObserver<O> {
    target_host: String,
    inner: O,
}

impl<O: TraceObserver> TracingObserver<O> {
    pub fn new(target_host: impl Into<String>, inner: O) -> Self {
        Self {
            target_host: target_host.into(),
            inner,
        }
    }

    pub fn into_inner(self) -> O {
        self.inner
    }
}

impl<O: TraceObserver> TraceObserver for TracingObserver<O> {
    fn on_running_changed(&mut self, running: bool) {
        debug!(target_host = %self.target_host, running, "Trace running state changed");
        self.inner.on_running_changed(running);
    }

    fn on_hop_recorded(&mut self, record: &HopRecord) {
        match record.host_ip {
            Some(ip) => info!(
                ttl = record.ttl,
                ip = %ip,
                seq = ?record.sequence_number,
                rtt_ms = ?record.rtt,
                avg_ms = ?record.avg_rtt(),
                "Hop recorded"
            ),
            None => info!(ttl = record.ttl, rtt_ms = ?record.rtt, "Hop recorded, no reply"),
        }
        self.inner.on_hop_recorded(record);
    }

    fn on_error(&mut self, error: &TraceError) {
        if error.is_fatal() {
            warn!(target_host = %self.target_host, kind = ?error.kind(), error = %error, "Trace failed");
        } else {
            info!(target_host = %self.target_host, error = %error, "Trace ended");
        }
        self.inner.on_error(error);
    }

    fn on_completed(&mut self, completion: &TraceCompletion) {
        info!(
            target_host = %self.target_host,
            destination = ?completion.destination,
            ttl = completion.ttl,
            seq = completion.sequence_number,
            rtt_ms = ?completion.rtt,
            hops = completion.hops_recorded,
            "Destination reached, trace completed"
        );
        self.inner.on_completed(completion);
    }
}
