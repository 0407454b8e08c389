//! Scripted in-memory ping transport for engine tests.

#![allow(dead_code)]

use hoptrace_core::{PingTransport, TransportEvents};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What happens to one probe.
#[derive(Debug, Clone)]
pub enum Reply {
    /// A router answers with time exceeded after `delay`.
    Hop { ip: IpAddr, delay: Duration },
    /// A router answers but the quoted sequence number is not extracted.
    HopUnquoted { ip: IpAddr, delay: Duration },
    /// The destination answers after `delay`.
    Destination { delay: Duration },
    /// Nothing comes back.
    Silent,
    /// The send itself fails.
    SendFails,
}

pub fn hop(ip: &str, delay_us: u64) -> Reply {
    Reply::Hop {
        ip: ip.parse().unwrap(),
        delay: Duration::from_micros(delay_us),
    }
}

pub fn destination(delay_us: u64) -> Reply {
    Reply::Destination {
        delay: Duration::from_micros(delay_us),
    }
}

/// Calls the engine made on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(String),
    Stop,
    SetTtl(u8),
    Send,
}

#[derive(Debug, Default)]
struct Inner {
    resolved: Option<IpAddr>,
    /// Replies per TTL in round order; missing rounds are silent.
    script: HashMap<u8, Vec<Reply>>,
    rounds: HashMap<u8, usize>,
    calls: Vec<Call>,
    events: Option<TransportEvents>,
    ttl: u8,
    sequence: u16,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedTransport {
    /// A transport resolving every host to `resolved`.
    pub fn new(resolved: &str) -> Self {
        let transport = Self::default();
        transport.inner.lock().unwrap().resolved = Some(resolved.parse().unwrap());
        transport
    }

    /// A transport whose start always fails.
    pub fn unresolvable() -> Self {
        Self::default()
    }

    pub fn script(self, ttl: u8, replies: Vec<Reply>) -> Self {
        self.inner.lock().unwrap().script.insert(ttl, replies);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// TTLs of every probe sent, in order.
    pub fn sent_ttls(&self) -> Vec<u8> {
        let mut ttl = 0;
        let mut sent = Vec::new();
        for call in self.calls() {
            match call {
                Call::SetTtl(value) => ttl = value,
                Call::Send => sent.push(ttl),
                _ => {}
            }
        }
        sent
    }
}

impl PingTransport for ScriptedTransport {
    fn start(&mut self, host: &str, events: TransportEvents) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Start(host.to_string()));
        inner.rounds.clear();
        match inner.resolved {
            Some(address) => events.started(address),
            None => events.start_failed(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("cannot resolve {}", host),
            )),
        }
        inner.events = Some(events);
    }

    fn stop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Stop);
        inner.events = None;
    }

    fn set_ttl(&mut self, ttl: u8) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::SetTtl(ttl));
        inner.ttl = ttl;
        Ok(())
    }

    fn send(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Send);
        let Some(events) = inner.events.clone() else {
            return;
        };

        inner.sequence += 1;
        let sequence = inner.sequence;
        let ttl = inner.ttl;
        let round = {
            let round = inner.rounds.entry(ttl).or_insert(0);
            *round += 1;
            *round - 1
        };
        let reply = inner
            .script
            .get(&ttl)
            .and_then(|replies| replies.get(round))
            .cloned()
            .unwrap_or(Reply::Silent);

        if let Reply::SendFails = reply {
            events.send_failed(
                sequence,
                std::io::Error::new(std::io::ErrorKind::Other, "network unreachable"),
            );
            return;
        }
        events.sent(sequence);

        match reply {
            Reply::Hop { ip, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    events.intermediate_reply(ip, Some(sequence));
                });
            }
            Reply::HopUnquoted { ip, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    events.intermediate_reply(ip, None);
                });
            }
            Reply::Destination { delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    events.matched_reply(sequence);
                });
            }
            Reply::Silent | Reply::SendFails => {}
        }
    }
}
