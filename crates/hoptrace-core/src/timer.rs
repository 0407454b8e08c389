//! Per-round timeout timer.

use crate::event::EngineEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A single armed timeout, tagged with the generation it guards.
///
/// Dropping or disarming aborts the sleeping task. A fire that was already
/// queued before the abort still carries the old generation, so the engine can
/// tell it apart from the live timer.
#[derive(Debug)]
pub(crate) struct RoundTimer {
    generation: u64,
    task: JoinHandle<()>,
}

impl RoundTimer {
    /// Arms a timer that reports `generation` after `timeout`.
    pub(crate) fn arm(
        generation: u64,
        timeout: Duration,
        tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(EngineEvent::Timeout { generation });
        });
        Self { generation, task }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
