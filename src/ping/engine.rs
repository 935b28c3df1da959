//! One probing engine per address family: a send loop on the runtime, a
//! receive loop on a dedicated thread, and the monitor table they share.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Sample, MAX_PENDING_PROBES, PING_PAYLOAD};
use crate::config::Target;
use crate::icmp::{self, Echo, Family, IcmpMessage, IcmpSocket, MAX_PACKET_SIZE};
use crate::resolve::{Resolution, ResolveResult};

/// When a destination's FIFO hits its cap, drop this many of the oldest
/// entries in one operation to amortize the eviction.
const EVICTION_BATCH: usize = MAX_PENDING_PROBES / 4;

/// Receive loop read deadline. An idle liveness and shutdown check, not
/// a per-probe timeout.
const RECV_IDLE_CHECK: Duration = Duration::from_secs(5);

/// One echo on the wire, awaiting its reply.
#[derive(Debug, Clone, Copy)]
struct OutstandingProbe {
    seq: u16,
    sent: Instant,
}

/// Probe bookkeeping for one destination address.
#[derive(Debug)]
struct DestinationState {
    target: Target,
    outstanding: VecDeque<OutstandingProbe>,
    /// Counted per destination so a future circuit breaker can ignore
    /// addresses that consistently fail to send.
    #[allow(dead_code)]
    send_err_count: u64,
}

/// Monitor table plus the 16-bit sequence counter, shared between the
/// send and receive loops under a single mutex. Critical sections stay
/// narrow: the lock is never held across socket or channel I/O.
#[derive(Debug, Default)]
pub(crate) struct Monitors {
    table: HashMap<IpAddr, DestinationState>,
    sequence: u16,
}

impl Monitors {
    /// Reserve the next sequence number for a probe to `dest`, creating
    /// the destination's state on first use.
    ///
    /// The probe is registered before it hits the wire so a fast reply
    /// cannot race the bookkeeping; a failed send is rolled back.
    fn register(&mut self, dest: IpAddr, target: &Target, sent: Instant) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        let seq = self.sequence;

        let state = self
            .table
            .entry(dest)
            .or_insert_with(|| DestinationState {
                target: target.clone(),
                outstanding: VecDeque::with_capacity(MAX_PENDING_PROBES),
                send_err_count: 0,
            });
        // The address may have moved to a different target since this
        // state was created; samples carry the target current at send
        // time.
        if state.target != *target {
            state.target = target.clone();
        }

        if state.outstanding.len() >= MAX_PENDING_PROBES {
            state.outstanding.drain(..EVICTION_BATCH);
        }
        state.outstanding.push_back(OutstandingProbe { seq, sent });
        seq
    }

    /// Forget a probe whose send failed so it never reads as lost.
    fn rollback(&mut self, dest: IpAddr, seq: u16) {
        if let Some(state) = self.table.get_mut(&dest) {
            if state.outstanding.back().is_some_and(|probe| probe.seq == seq) {
                state.outstanding.pop_back();
            }
            state.send_err_count += 1;
        }
    }

    /// Correlate a reply from `peer`. Returns the samples to emit, in
    /// send order: every probe older than the match is lost, the match
    /// itself is delivered.
    ///
    /// A reply matching nothing leaves the FIFO alone; those probes stay
    /// accounted for until a later reply or the capacity bound reclaims
    /// them.
    fn correlate(&mut self, source: IpAddr, peer: IpAddr, seq: u16, when: Instant) -> Vec<Sample> {
        let Some(state) = self.table.get_mut(&peer) else {
            debug!(%peer, seq, "reply from unmonitored address");
            return Vec::new();
        };
        let Some(index) = state.outstanding.iter().position(|probe| probe.seq == seq) else {
            debug!(%peer, seq, "no outstanding probe matches reply");
            return Vec::new();
        };

        let target = state.target.clone();
        state
            .outstanding
            .drain(..=index)
            .map(|probe| Sample {
                sent: probe.sent,
                recv: (probe.seq == seq).then_some(when),
                src: source,
                dest: peer,
                target: target.clone(),
            })
            .collect()
    }

    /// Drop state for addresses that left the live set.
    fn retain(&mut self, live: &HashSet<IpAddr>) {
        self.table.retain(|addr, _| live.contains(addr));
    }

    #[cfg(test)]
    fn pending(&self, dest: IpAddr) -> usize {
        self.table
            .get(&dest)
            .map_or(0, |state| state.outstanding.len())
    }

    #[cfg(test)]
    fn send_errors(&self, dest: IpAddr) -> u64 {
        self.table
            .get(&dest)
            .map_or(0, |state| state.send_err_count)
    }
}

/// Restrict a resolve result to the addresses one engine probes,
/// dropping resolutions left with no address of that family.
pub(crate) fn family_view(result: &ResolveResult, family: Family) -> Vec<Resolution> {
    result
        .items
        .iter()
        .map(|res| Resolution {
            target: res.target.clone(),
            addrs: res
                .addrs
                .iter()
                .copied()
                .filter(|addr| family.matches(*addr))
                .collect(),
        })
        .filter(|res| !res.addrs.is_empty())
        .collect()
}

struct Shared {
    source: IpAddr,
    family: Family,
    socket: IcmpSocket,
    interval: RwLock<Duration>,
    targets: RwLock<Vec<Resolution>>,
    monitors: Mutex<Monitors>,
    samples: mpsc::Sender<Sample>,
}

/// Handle to a running per-family engine.
pub struct PingEngine {
    shared: Arc<Shared>,
}

impl PingEngine {
    /// Open the family's socket and start the send and receive loops.
    pub fn start(
        family: Family,
        interval: Duration,
        samples: mpsc::Sender<Sample>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let source = family.unspecified();
        let socket =
            IcmpSocket::listen(source).with_context(|| format!("could not listen on {source}"))?;
        socket.set_read_timeout(RECV_IDLE_CHECK)?;

        let shared = Arc::new(Shared {
            source,
            family,
            socket,
            interval: RwLock::new(interval),
            targets: RwLock::new(Vec::new()),
            monitors: Mutex::new(Monitors::default()),
            samples,
        });

        tokio::spawn(send_loop(Arc::clone(&shared), cancel.clone()));

        let recv_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name(format!("ping-recv-{family:?}"))
            .spawn(move || receive_loop(&recv_shared, &cancel))
            .context("failed to spawn receive thread")?;

        Ok(Self { shared })
    }

    pub fn family(&self) -> Family {
        self.shared.family
    }

    /// Picked up by the send loop on its next timer reset.
    pub fn set_interval(&self, interval: Duration) {
        *self.shared.interval.write() = interval;
    }

    /// Replace the live target set. Monitors for removed addresses are
    /// dropped immediately; added addresses get state lazily on the next
    /// send.
    pub fn update_targets(&self, result: &ResolveResult) {
        let targets = family_view(result, self.shared.family);
        let live: HashSet<IpAddr> = targets
            .iter()
            .flat_map(|res| res.addrs.iter().copied())
            .collect();
        self.shared.monitors.lock().retain(&live);
        *self.shared.targets.write() = targets;
    }
}

async fn send_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        // Re-read the interval each cycle so config updates apply on the
        // next reset.
        let interval = *shared.interval.read();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let targets = shared.targets.read().clone();
        for resolution in &targets {
            for &dest in &resolution.addrs {
                send_one(&shared, dest, &resolution.target);
            }
        }
    }
}

fn send_one(shared: &Shared, dest: IpAddr, target: &Target) {
    let sent = Instant::now();
    let seq = shared.monitors.lock().register(dest, target, sent);

    // The kernel owns the echo id on unprivileged sockets; correlation
    // runs on (destination, seq) alone.
    let echo = Echo { id: 0, seq };
    if let Err(err) = shared.socket.send_echo(echo, PING_PAYLOAD, dest) {
        warn!(%dest, seq, error = %err, "ping send failed");
        shared.monitors.lock().rollback(dest, seq);
    }
}

/// Blocking receive loop; owns the socket's remaining lifetime and runs
/// until cancellation, a terminal socket error, or the sample consumer
/// going away.
fn receive_loop(shared: &Shared, cancel: &CancellationToken) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let (peer, msg) = match shared.socket.recv(&mut buf) {
            Ok(read) => read,
            Err(err) if icmp::is_timeout(&err) => continue,
            Err(err) if icmp::is_terminal(&err) => {
                error!(family = ?shared.family, error = %err, "icmp socket closed");
                return;
            }
            Err(err) => {
                debug!(error = %err, "discarding unreadable packet");
                continue;
            }
        };
        let when = Instant::now();

        let IcmpMessage::EchoReply(echo) = msg else {
            // Datagram sockets should only ever hand us echo replies.
            debug!(%peer, "ignoring non-reply icmp message");
            continue;
        };

        let samples = shared
            .monitors
            .lock()
            .correlate(shared.source, peer, echo.seq, when);
        for sample in samples {
            // Deliberately blocking: a full channel slows us down rather
            // than letting the sink fall unboundedly behind.
            if shared.samples.blocking_send(sample).is_err() {
                debug!("sample consumer gone, stopping receive loop");
                return;
            }
        }
    }
}
