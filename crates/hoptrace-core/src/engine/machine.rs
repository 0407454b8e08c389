//! Hop discovery state machine.
//!
//! Runs inside the engine task; every method is one serialized event.

use crate::event::{EngineEvent, TransportEvent};
use crate::timer::RoundTimer;
use crate::types::rtt_ms;
use crate::{
    HopRecord, PingTransport, TraceCompletion, TraceError, TraceObserver, TraceSettings,
    TraceState, TransportEvents, TIMED_OUT_RTT,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// The probe currently on the wire.
#[derive(Debug, Clone, Copy)]
struct InFlightProbe {
    /// Unknown until the transport reports the send.
    sequence: Option<u16>,
    sent_at: Instant,
}

/// Per-run state, reset on start and released on stop.
#[derive(Debug, Default)]
struct EngineState {
    ttl: u8,
    round: usize,
    hop: Option<HopRecord>,
    probe: Option<InFlightProbe>,
    resolved: Option<IpAddr>,
    hops_recorded: usize,
}

pub(crate) struct HopDiscovery<T, O> {
    settings: TraceSettings,
    transport: T,
    observer: O,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    /// Id of the active run as seen by the handle, 0 when idle.
    active: Arc<AtomicU64>,
    run: u64,
    phase: TraceState,
    running: bool,
    state: EngineState,
    timer: Option<RoundTimer>,
    generation: u64,
}

impl<T: PingTransport, O: TraceObserver> HopDiscovery<T, O> {
    pub(crate) fn new(
        settings: TraceSettings,
        transport: T,
        observer: O,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
        active: Arc<AtomicU64>,
    ) -> Self {
        Self {
            settings,
            transport,
            observer,
            events_tx,
            active,
            run: 0,
            phase: TraceState::Idle,
            running: false,
            state: EngineState::default(),
            timer: None,
            generation: 0,
        }
    }

    pub(crate) fn phase(&self) -> TraceState {
        self.phase
    }

    pub(crate) fn start(&mut self, run: u64) {
        if self.phase.is_running() {
            debug!(run = self.run, "Rejecting start, run in progress");
            self.observer.on_error(&TraceError::AlreadyRunning);
            return;
        }

        self.run = run;
        self.state = EngineState::default();
        self.phase = TraceState::Starting;
        self.set_running(true);

        debug!(run, host = %self.settings.target_host, "Starting transport");
        let events = TransportEvents::new(run, self.events_tx.clone());
        self.transport.start(&self.settings.target_host, events);
    }

    /// Reports a start rejected by the handle without touching run state.
    pub(crate) fn reject_start(&mut self) {
        self.observer.on_error(&TraceError::AlreadyRunning);
    }

    pub(crate) fn stop(&mut self) {
        if !self.phase.is_running() {
            return;
        }
        debug!(run = self.run, ttl = self.state.ttl, "Stopping trace");
        self.finish(TraceState::Idle);
    }

    pub(crate) fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Timeout { generation } => self.on_timeout(generation),
            EngineEvent::Transport { run, event } => {
                if run != self.run || !self.phase.is_running() {
                    trace!(run, current = self.run, ?event, "Dropping event from stale run");
                    return;
                }
                self.on_transport_event(event);
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Started { address } => self.on_transport_ready(address),
            TransportEvent::Sent { sequence, sent_at } => self.on_probe_sent(sequence, sent_at),
            TransportEvent::IntermediateReply {
                source,
                quoted_sequence,
                received_at,
            } => self.on_intermediate_reply(source, quoted_sequence, received_at),
            TransportEvent::MatchedReply {
                sequence,
                received_at,
            } => self.on_final_reply(sequence, received_at),
            failure @ TransportEvent::StartFailed { .. } => {
                if self.phase != TraceState::Starting {
                    return;
                }
                if let Some(err) = failure.into_error(&self.settings.target_host) {
                    self.fail(err);
                }
            }
            failure @ TransportEvent::SendFailed { .. } => {
                if self.phase != TraceState::AwaitingReply {
                    return;
                }
                if let Some(err) = failure.into_error(&self.settings.target_host) {
                    self.fail(err);
                }
            }
        }
    }

    fn on_transport_ready(&mut self, address: IpAddr) {
        if self.phase != TraceState::Starting {
            trace!(%address, "Ignoring duplicate transport start");
            return;
        }
        debug!(host = %self.settings.target_host, %address, "Transport ready");
        self.state.resolved = Some(address);
        self.send_probe(1);
    }

    /// Opens the record for `ttl` and sends its first round.
    fn send_probe(&mut self, ttl: u8) {
        if ttl > self.settings.max_ttl {
            self.abort_ttl_exceeded();
            return;
        }
        self.state.ttl = ttl;
        self.state.round = 0;
        self.state.hop = Some(HopRecord::open(ttl));
        self.launch_round();
    }

    /// Sends one probe at the current TTL and arms its timeout.
    fn launch_round(&mut self) {
        self.state.probe = Some(InFlightProbe {
            sequence: None,
            sent_at: Instant::now(),
        });
        if let Err(source) = self.transport.set_ttl(self.state.ttl) {
            self.fail(TraceError::ProbeSend {
                sequence: None,
                source,
            });
            return;
        }

        self.generation += 1;
        self.timer = Some(RoundTimer::arm(
            self.generation,
            self.settings.timeout,
            self.events_tx.clone(),
        ));
        self.phase = TraceState::AwaitingReply;
        trace!(ttl = self.state.ttl, round = self.state.round, "Sending probe");
        self.transport.send();
    }

    fn on_probe_sent(&mut self, sequence: u16, sent_at: Instant) {
        if self.phase != TraceState::AwaitingReply {
            return;
        }
        match self.state.probe.as_mut() {
            Some(probe) if probe.sequence.is_none() => {
                probe.sequence = Some(sequence);
                probe.sent_at = sent_at;
                if let Some(hop) = self.state.hop.as_mut() {
                    hop.sequence_number.get_or_insert(sequence);
                }
            }
            _ => trace!(sequence, "Ignoring send report for a settled probe"),
        }
    }

    fn on_intermediate_reply(
        &mut self,
        source: IpAddr,
        quoted_sequence: Option<u16>,
        received_at: Instant,
    ) {
        if self.phase != TraceState::AwaitingReply {
            return;
        }
        let Some(probe) = self.state.probe else {
            trace!(%source, "Reply with no probe in flight");
            return;
        };
        // Sends are reported before their replies, so a reply seen while the
        // in-flight probe is still unconfirmed answers an earlier probe.
        let Some(expected) = probe.sequence else {
            trace!(%source, quoted = ?quoted_sequence, "Reply for a settled probe");
            return;
        };
        if let Some(quoted) = quoted_sequence {
            if quoted != expected {
                trace!(%source, quoted, expected, "Reply for an earlier probe");
                return;
            }
        }
        let rtt = rtt_ms(received_at.saturating_duration_since(probe.sent_at));
        self.complete_round(Some(source), rtt);
    }

    fn on_timeout(&mut self, generation: u64) {
        if self.timer.as_ref().map(RoundTimer::generation) != Some(generation) {
            trace!(generation, "Ignoring stale timeout");
            return;
        }
        debug!(ttl = self.state.ttl, round = self.state.round, "Round timed out");
        self.complete_round(None, TIMED_OUT_RTT);
    }

    /// Fills the current round's slot, then either probes again at the same
    /// TTL or closes the hop once every slot is filled.
    fn complete_round(&mut self, source: Option<IpAddr>, rtt: f64) {
        self.timer = None;
        self.state.probe = None;

        let probes = self.settings.probes_per_hop;
        let Some(hop) = self.state.hop.as_mut() else {
            return;
        };
        if self.state.round < probes {
            if hop.host_ip.is_none() {
                hop.host_ip = source;
            }
            hop.push_rtt(rtt);
            self.state.round += 1;
        }

        if self.state.round == probes {
            self.close_hop();
        } else {
            self.launch_round();
        }
    }

    fn close_hop(&mut self) {
        self.phase = TraceState::HopComplete;
        if let Some(hop) = self.state.hop.take() {
            self.state.hops_recorded += 1;
            self.observer.on_hop_recorded(&hop);
        }
        match self.state.ttl.checked_add(1) {
            Some(next) => self.send_probe(next),
            None => self.abort_ttl_exceeded(),
        }
    }

    fn on_final_reply(&mut self, sequence: u16, received_at: Instant) {
        if self.phase != TraceState::AwaitingReply {
            return;
        }
        self.timer = None;

        let rtt = self
            .state
            .probe
            .filter(|probe| probe.sequence.map_or(true, |seq| seq == sequence))
            .map(|probe| rtt_ms(received_at.saturating_duration_since(probe.sent_at)));
        let completion = TraceCompletion {
            destination: self.state.resolved,
            ttl: self.state.ttl,
            sequence_number: sequence,
            rtt,
            hops_recorded: self.state.hops_recorded,
        };
        debug!(
            ttl = completion.ttl,
            sequence,
            rtt_ms = ?completion.rtt,
            "Destination reached"
        );
        self.observer.on_completed(&completion);
        self.finish(TraceState::Completed);
    }

    fn abort_ttl_exceeded(&mut self) {
        let err = TraceError::TtlExceeded {
            max_ttl: self.settings.max_ttl,
        };
        self.observer.on_error(&err);
        self.finish(TraceState::Aborted);
    }

    fn fail(&mut self, err: TraceError) {
        debug!(error = %err, "Trace failed");
        self.observer.on_error(&err);
        self.finish(TraceState::Idle);
    }

    /// Disarms the timer, stops the transport and leaves the run.
    fn finish(&mut self, phase: TraceState) {
        self.timer = None;
        self.transport.stop();
        self.state.hop = None;
        self.state.probe = None;
        self.phase = phase;
        self.set_running(false);
    }

    fn set_running(&mut self, running: bool) {
        if !running {
            let _ = self
                .active
                .compare_exchange(self.run, 0, Ordering::AcqRel, Ordering::Acquire);
        }
        if self.running != running {
            self.running = running;
            self.observer.on_running_changed(running);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start(String),
        Stop,
        SetTtl(u8),
        Send,
    }

    #[derive(Default, Clone)]
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_set_ttl: bool,
    }

    impl PingTransport for RecordingTransport {
        fn start(&mut self, host: &str, _events: TransportEvents) {
            self.calls.lock().unwrap().push(Call::Start(host.to_string()));
        }

        fn stop(&mut self) {
            self.calls.lock().unwrap().push(Call::Stop);
        }

        fn set_ttl(&mut self, ttl: u8) -> std::io::Result<()> {
            self.calls.lock().unwrap().push(Call::SetTtl(ttl));
            if self.fail_set_ttl {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "setsockopt IP_TTL",
                ));
            }
            Ok(())
        }

        fn send(&mut self) {
            self.calls.lock().unwrap().push(Call::Send);
        }
    }

    #[derive(Default, Clone)]
    struct RecordingObserver {
        running: Arc<Mutex<Vec<bool>>>,
        hops: Arc<Mutex<Vec<HopRecord>>>,
        errors: Arc<Mutex<Vec<crate::ErrorKind>>>,
        details: Arc<Mutex<Vec<String>>>,
    }

    impl TraceObserver for RecordingObserver {
        fn on_running_changed(&mut self, running: bool) {
            self.running.lock().unwrap().push(running);
        }

        fn on_hop_recorded(&mut self, record: &HopRecord) {
            self.hops.lock().unwrap().push(record.clone());
        }

        fn on_error(&mut self, error: &TraceError) {
            self.errors.lock().unwrap().push(error.kind());
            self.details.lock().unwrap().push(error.to_string());
        }
    }

    type Harness = (
        HopDiscovery<RecordingTransport, RecordingObserver>,
        RecordingTransport,
        RecordingObserver,
        mpsc::UnboundedReceiver<EngineEvent>,
    );

    fn machine(settings: TraceSettings) -> Harness {
        machine_with(settings, RecordingTransport::default())
    }

    fn machine_with(settings: TraceSettings, transport: RecordingTransport) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = RecordingObserver::default();
        let machine = HopDiscovery::new(
            settings,
            transport.clone(),
            observer.clone(),
            tx,
            Arc::new(AtomicU64::new(1)),
        );
        (machine, transport, observer, rx)
    }

    fn transport_event(run: u64, event: TransportEvent) -> EngineEvent {
        EngineEvent::Transport { run, event }
    }

    fn started(m: &mut HopDiscovery<RecordingTransport, RecordingObserver>) {
        m.start(1);
        m.handle_event(transport_event(
            1,
            TransportEvent::Started {
                address: "10.0.0.9".parse().unwrap(),
            },
        ));
    }

    fn sent(sequence: u16) -> EngineEvent {
        transport_event(
            1,
            TransportEvent::Sent {
                sequence,
                sent_at: Instant::now(),
            },
        )
    }

    fn reply(source: &str, quoted_sequence: Option<u16>) -> EngineEvent {
        transport_event(
            1,
            TransportEvent::IntermediateReply {
                source: source.parse().unwrap(),
                quoted_sequence,
                received_at: Instant::now(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_probe_before_transport_ready() {
        let (mut m, transport, observer, _rx) = machine(TraceSettings::new("10.0.0.9"));
        m.start(1);

        assert_eq!(m.phase(), TraceState::Starting);
        assert_eq!(
            *transport.calls.lock().unwrap(),
            vec![Call::Start("10.0.0.9".into())]
        );
        assert_eq!(*observer.running.lock().unwrap(), vec![true]);

        m.handle_event(transport_event(
            1,
            TransportEvent::Started {
                address: "10.0.0.9".parse().unwrap(),
            },
        ));
        assert_eq!(m.phase(), TraceState::AwaitingReply);
        assert_eq!(
            transport.calls.lock().unwrap()[1..],
            [Call::SetTtl(1), Call::Send]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_keeps_state() {
        let (mut m, transport, observer, _rx) = machine(TraceSettings::new("10.0.0.9"));
        m.start(1);
        m.handle_event(transport_event(
            1,
            TransportEvent::Started {
                address: "10.0.0.9".parse().unwrap(),
            },
        ));

        m.start(2);
        assert_eq!(m.phase(), TraceState::AwaitingReply);
        assert_eq!(
            *observer.errors.lock().unwrap(),
            vec![crate::ErrorKind::AlreadyRunning]
        );
        assert_eq!(transport.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timeout_is_inert() {
        let settings = TraceSettings::new("10.0.0.9").with_probes_per_hop(2);
        let (mut m, _transport, observer, _rx) = machine(settings);
        started(&mut m);
        let stale = m.generation;
        m.handle_event(sent(1));
        m.handle_event(reply("10.0.0.1", None));

        m.handle_event(EngineEvent::Timeout { generation: stale });
        assert!(observer.hops.lock().unwrap().is_empty());
        assert_eq!(m.state.round, 1);
        assert_eq!(m.state.hop.as_ref().unwrap().rtt.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (mut m, transport, observer, _rx) = machine(TraceSettings::new("10.0.0.9"));
        m.stop();
        assert!(transport.calls.lock().unwrap().is_empty());

        m.start(1);
        m.stop();
        m.stop();
        assert_eq!(m.phase(), TraceState::Idle);
        assert_eq!(*observer.running.lock().unwrap(), vec![true, false]);
        assert_eq!(
            transport
                .calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == Call::Stop)
                .count(),
            1
        );
        assert!(m.timer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_previous_run_are_dropped() {
        let (mut m, transport, _observer, _rx) = machine(TraceSettings::new("10.0.0.9"));
        m.start(1);
        m.stop();
        m.start(2);

        m.handle_event(transport_event(
            1,
            TransportEvent::Started {
                address: "10.0.0.9".parse().unwrap(),
            },
        ));
        assert_eq!(m.phase(), TraceState::Starting);
        assert!(!transport.calls.lock().unwrap().contains(&Call::Send));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_racing_timeout_is_not_credited_to_next_round() {
        let settings = TraceSettings::new("10.0.0.9").with_probes_per_hop(2);
        let (mut m, _transport, observer, _rx) = machine(settings);
        started(&mut m);
        m.handle_event(sent(1));

        // The timeout and the reply to sequence 1 were queued together; the
        // timeout wins and round 1 goes out before its send is confirmed.
        m.handle_event(EngineEvent::Timeout {
            generation: m.generation,
        });
        m.handle_event(reply("10.0.0.66", Some(1)));
        m.handle_event(reply("10.0.0.66", None));
        assert_eq!(m.state.round, 1);
        assert_eq!(m.state.hop.as_ref().unwrap().rtt, vec![TIMED_OUT_RTT]);

        m.handle_event(sent(2));
        m.handle_event(reply("10.0.0.66", Some(1)));
        assert_eq!(m.state.round, 1);

        m.handle_event(EngineEvent::Timeout {
            generation: m.generation,
        });
        let hops = observer.hops.lock().unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].rtt, vec![TIMED_OUT_RTT, TIMED_OUT_RTT]);
        assert_eq!(hops[0].host_ip, None);
        assert!(!hops[0].reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_racing_last_timeout_stays_out_of_next_hop() {
        let settings = TraceSettings::new("10.0.0.9").with_probes_per_hop(1);
        let (mut m, _transport, observer, _rx) = machine(settings);
        started(&mut m);
        m.handle_event(sent(1));

        m.handle_event(EngineEvent::Timeout {
            generation: m.generation,
        });
        assert_eq!(m.state.ttl, 2);
        m.handle_event(reply("10.0.0.1", Some(1)));

        assert_eq!(m.state.round, 0);
        assert!(m.state.hop.as_ref().unwrap().rtt.is_empty());
        assert_eq!(m.state.hop.as_ref().unwrap().host_ip, None);
        assert_eq!(observer.hops.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_ttl_failure_reports_send_failure() {
        let transport = RecordingTransport {
            fail_set_ttl: true,
            ..Default::default()
        };
        let (mut m, transport, observer, _rx) =
            machine_with(TraceSettings::new("10.0.0.9"), transport);
        started(&mut m);

        assert_eq!(m.phase(), TraceState::Idle);
        assert!(m.timer.is_none());
        assert_eq!(
            *observer.errors.lock().unwrap(),
            vec![crate::ErrorKind::ProbeSendFailure]
        );
        assert!(observer.details.lock().unwrap()[0].contains("seq=-"));
        assert_eq!(*observer.running.lock().unwrap(), vec![true, false]);

        let calls = transport.calls.lock().unwrap();
        assert!(!calls.contains(&Call::Send));
        assert_eq!(calls.last(), Some(&Call::Stop));
    }
}
