//! Engine task hosting the hop discovery state machine.
//!
//! All transport events, timer fires and commands funnel into one task, so
//! the state machine handles exactly one event at a time.

mod machine;

use crate::event::EngineEvent;
use crate::{PingTransport, TraceError, TraceObserver, TraceResult, TraceSettings};
use machine::HopDiscovery;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug)]
enum Command {
    Start { run: u64 },
    RejectStart,
    Stop,
    Shutdown,
}

/// Handle to a hop discovery engine running on the tokio runtime.
///
/// `start` and `stop` only queue work; results arrive through the
/// [`TraceObserver`] given to [`TraceEngine::spawn`].
#[derive(Debug)]
pub struct TraceEngine {
    commands: mpsc::UnboundedSender<Command>,
    /// Id of the active run, 0 when idle. Cleared by the task when a run ends
    /// on its own and by `stop` eagerly.
    active: Arc<AtomicU64>,
    next_run: AtomicU64,
    task: JoinHandle<()>,
}

impl TraceEngine {
    /// Validates `settings` and spawns the engine task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T, O>(settings: TraceSettings, transport: T, observer: O) -> TraceResult<Self>
    where
        T: PingTransport,
        O: TraceObserver,
    {
        settings.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicU64::new(0));
        let machine = HopDiscovery::new(settings, transport, observer, events_tx, active.clone());
        let task = tokio::spawn(event_loop(machine, command_rx, events_rx));

        Ok(Self {
            commands,
            active,
            next_run: AtomicU64::new(0),
            task,
        })
    }

    /// Starts a new run.
    ///
    /// Fails with [`TraceError::AlreadyRunning`] while a run is active; the
    /// active run is left untouched.
    pub fn start(&self) -> TraceResult<()> {
        let run = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        if self
            .active
            .compare_exchange(0, run, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let _ = self.commands.send(Command::RejectStart);
            return Err(TraceError::AlreadyRunning);
        }

        self.commands.send(Command::Start { run }).map_err(|_| {
            self.active.store(0, Ordering::Release);
            TraceError::EngineClosed
        })
    }

    /// Stops the active run, if any.
    pub fn stop(&self) {
        self.active.store(0, Ordering::Release);
        let _ = self.commands.send(Command::Stop);
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    /// Stops any active run and waits for the engine task to exit.
    pub async fn shutdown(self) -> TraceResult<()> {
        let _ = self.commands.send(Command::Shutdown);
        self.task.await.map_err(|_| TraceError::EngineClosed)
    }
}

async fn event_loop<T, O>(
    mut machine: HopDiscovery<T, O>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) where
    T: PingTransport,
    O: TraceObserver,
{
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start { run }) => machine.start(run),
                Some(Command::RejectStart) => machine.reject_start(),
                Some(Command::Stop) => machine.stop(),
                Some(Command::Shutdown) | None => {
                    machine.stop();
                    break;
                }
            },
            Some(event) = events.recv() => machine.handle_event(event),
        }
    }
    debug!(state = %machine.phase(), "Engine task exiting");
}
