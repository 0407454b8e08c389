//! Aggregated results of a single run.

use crate::observer::TraceNotification;
use crate::{ErrorKind, HopRecord, TraceCompletion};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TraceOutcome {
    /// The destination replied.
    Completed(TraceCompletion),
    /// The TTL budget ran out.
    Aborted { detail: String },
    /// The run failed.
    Failed { kind: ErrorKind, detail: String },
    /// The run was stopped before reaching an outcome.
    Stopped,
}

/// Hop records and outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceReport {
    /// Target host as configured.
    pub target_host: String,
    /// Hop records in TTL order.
    pub hops: Vec<HopRecord>,
    /// `None` while the run is still going.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TraceOutcome>,
}

impl TraceReport {
    pub fn new(target_host: impl Into<String>) -> Self {
        Self {
            target_host: target_host.into(),
            hops: Vec::new(),
            outcome: None,
        }
    }

    /// Folds one notification into the report.
    pub fn record(&mut self, notification: &TraceNotification) {
        match notification {
            TraceNotification::RunningChanged(false) => {
                self.outcome.get_or_insert(TraceOutcome::Stopped);
            }
            TraceNotification::RunningChanged(true) => {}
            TraceNotification::HopRecorded(hop) => self.hops.push(hop.clone()),
            TraceNotification::Completed(completion) => {
                self.outcome = Some(TraceOutcome::Completed(completion.clone()));
            }
            TraceNotification::Error {
                kind: ErrorKind::TtlExceeded,
                detail,
            } => {
                self.outcome = Some(TraceOutcome::Aborted {
                    detail: detail.clone(),
                });
            }
            // Rejected starts do not end the run being reported.
            TraceNotification::Error {
                kind: ErrorKind::AlreadyRunning,
                ..
            } => {}
            TraceNotification::Error { kind, detail } => {
                self.outcome = Some(TraceOutcome::Failed {
                    kind: *kind,
                    detail: detail.clone(),
                });
            }
        }
    }

    /// Reads notifications until the run stops or the channel closes.
    pub async fn collect(
        target_host: impl Into<String>,
        rx: &mut mpsc::UnboundedReceiver<TraceNotification>,
    ) -> Self {
        let mut report = Self::new(target_host);
        while let Some(notification) = rx.recv().await {
            report.record(&notification);
            if notification == TraceNotification::RunningChanged(false) {
                break;
            }
        }
        report
    }

    /// Whether the destination was reached.
    pub fn reached_destination(&self) -> bool {
        matches!(self.outcome, Some(TraceOutcome::Completed(_)))
    }

    /// Serializes the report to JSON with indentation.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Serializes the report to compact JSON.
    pub fn to_json_compact(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
