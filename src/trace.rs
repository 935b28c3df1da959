//! Hop discovery via TTL-limited ICMP echo probes.
//!
//! Sends echo requests with increasing TTLs and correlates the Time
//! Exceeded / Destination Unreachable answers routers send back, giving
//! an ordered per-hop address list toward a destination.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::icmp::{self, Echo, Family, IcmpMessage, IcmpSocket, MAX_PACKET_SIZE};

/// Default cap on path length, from the IANA recommended default TTL.
pub const DEFAULT_MAX_HOPS: usize = 64;
const DEFAULT_RETRIES: usize = 3;
const DEFAULT_HOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Stable payload carried in every trace probe.
const TRACE_PAYLOAD: &[u8] = b"netmon/trace";

#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// Highest TTL to probe.
    pub max_hops: usize,
    /// Echo attempts per hop before giving up on it.
    pub retries: usize,
    /// Deadline for each attempt; a whole hop is bounded by
    /// `retries * hop_timeout`.
    pub hop_timeout: Duration,
    /// Local address to probe from. Defaults to the unspecified address
    /// of the destination's family, and must share that family when set.
    pub interface: Option<IpAddr>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            retries: DEFAULT_RETRIES,
            hop_timeout: DEFAULT_HOP_TIMEOUT,
            interface: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceResult {
    pub source: IpAddr,
    pub dest: IpAddr,
    /// Hop addresses in path order. The first entry is the source host
    /// itself; `None` marks a TTL where nothing answered. The last entry
    /// is `dest` exactly when an echo reply came back.
    pub hops: Vec<Option<IpAddr>>,
}

/// Discover the path toward `dest`.
///
/// The socket loop is blocking and runs on a dedicated thread;
/// cancelling `cancel` aborts the trace with an error.
pub async fn trace(
    dest: IpAddr,
    opts: TraceOptions,
    cancel: CancellationToken,
) -> Result<TraceResult> {
    let dest = icmp::unmap(dest);
    let source = match opts.interface {
        Some(ip) => icmp::unmap(ip),
        None => Family::of(dest).unspecified(),
    };
    if Family::of(source) != Family::of(dest) {
        bail!("mismatched address families: source {source}, destination {dest}");
    }

    tokio::task::spawn_blocking(move || trace_blocking(source, dest, &opts, &cancel))
        .await
        .context("traceroute task panicked")?
}

fn trace_blocking(
    source: IpAddr,
    dest: IpAddr,
    opts: &TraceOptions,
    cancel: &CancellationToken,
) -> Result<TraceResult> {
    let recv_socket = IcmpSocket::listen_privileged(source)
        .context("could not open privileged icmp socket")?;
    let send_socket = IcmpSocket::listen(source).context("icmp socket listen failed")?;

    // The kernel rewrites the echo id on datagram sockets to the bound
    // port; sending with that id keeps both fields matchable. Without a
    // port we fall back to matching on sequence alone.
    let id = match send_socket.local_id() {
        Some(id) => id,
        None => {
            warn!("could not determine the socket's echo id, matching replies by sequence only");
            0
        }
    };

    let mut seq: u16 = rand::thread_rng().gen();
    let mut result = TraceResult {
        source,
        dest,
        // The zeroth hop is always the host we probe from.
        hops: vec![Some(source)],
    };
    let mut buf = [0u8; MAX_PACKET_SIZE];

    'hops: for ttl in 1..=opts.max_hops {
        send_socket.set_ttl(u8::try_from(ttl).unwrap_or(u8::MAX))?;

        let mut found = false;
        let hop_budget = Instant::now() + opts.hop_timeout * opts.retries.max(1) as u32;

        for _attempt in 0..opts.retries.max(1) {
            if found || Instant::now() >= hop_budget {
                break;
            }
            if cancel.is_cancelled() {
                bail!("traceroute to {dest} cancelled");
            }

            seq = seq.wrapping_add(1);
            if let Err(err) = send_socket.send_echo(Echo { id, seq }, TRACE_PAYLOAD, dest) {
                // Transient send failures just burn one attempt.
                debug!(%dest, ttl, error = %err, "traceroute send failed");
                continue;
            }

            let hop_deadline = Instant::now() + opts.hop_timeout;
            // Keep reading until our probe's answer shows up or the hop
            // deadline expires; unrelated traffic arrives on raw sockets
            // all the time.
            while !found {
                if cancel.is_cancelled() {
                    bail!("traceroute to {dest} cancelled");
                }
                let remaining = hop_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                recv_socket.set_read_timeout(remaining)?;

                let (from, msg) = match recv_socket.recv(&mut buf) {
                    Ok(read) => read,
                    Err(err) if icmp::is_timeout(&err) => break,
                    Err(err) => {
                        debug!(error = %err, "discarding unreadable icmp packet");
                        continue;
                    }
                };

                let (echo, reached) = match msg {
                    IcmpMessage::EchoReply(echo) => (echo, true),
                    IcmpMessage::TimeExceeded {
                        original: Some(echo),
                    }
                    | IcmpMessage::DestinationUnreachable {
                        original: Some(echo),
                    } => (echo, false),
                    IcmpMessage::TimeExceeded { original: None }
                    | IcmpMessage::DestinationUnreachable { original: None } => {
                        debug!(%from, "error message did not quote an echo of ours");
                        continue;
                    }
                    IcmpMessage::Other { icmp_type, .. } => {
                        debug!(icmp_type, %from, "ignoring unexpected icmp type");
                        continue;
                    }
                };

                if echo.seq != seq || (id != 0 && echo.id != id) {
                    // Not the probe in flight.
                    continue;
                }

                found = true;
                result.hops.push(Some(from));
                if reached {
                    break 'hops;
                }
            }
        }

        if !found {
            debug!(ttl, %dest, "hop did not answer");
            result.hops.push(None);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = TraceOptions::default();
        assert_eq!(opts.max_hops, 64);
        assert_eq!(opts.retries, 3);
        assert_eq!(opts.hop_timeout, Duration::from_secs(5));
        assert!(opts.interface.is_none());
    }

    #[tokio::test]
    async fn trace_rejects_mismatched_families() {
        let err = trace(
            "8.8.8.8".parse().unwrap(),
            TraceOptions {
                interface: Some("2001:db8::1".parse().unwrap()),
                ..TraceOptions::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("mismatched address families"));
    }
}
