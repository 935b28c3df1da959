//! Periodic echo probing of the live address set.
//!
//! One engine per address family drives sends and receives over a single
//! unprivileged ICMP socket; the manager wires configuration and
//! resolution updates into both.

pub mod engine;
pub mod manager;

pub use engine::PingEngine;
pub use manager::PingManager;

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::Target;

/// Default capacity of the sample output channel. A full channel blocks
/// the receive loops, so the sink can never fall unboundedly behind.
pub const SAMPLE_BUFFER: usize = 100;

/// Upper bound on per-destination probes awaiting a reply.
pub(crate) const MAX_PENDING_PROBES: usize = 100;

/// Stable payload carried by every ping probe.
pub(crate) const PING_PAYLOAD: &[u8] = b"netmon/ping";

/// The outcome of a single probe: delivered with a measured round trip,
/// or lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub sent: Instant,
    /// `None` when the probe was lost or its reply arrived out of order.
    pub recv: Option<Instant>,
    pub src: IpAddr,
    pub dest: IpAddr,
    /// The target whose resolution contained `dest` when the probe was
    /// sent.
    pub target: Target,
}

impl Sample {
    pub fn elapsed(&self) -> Option<Duration> {
        self.recv
            .map(|recv| recv.saturating_duration_since(self.sent))
    }

    /// Round-trip milliseconds, negative when the probe was lost.
    pub fn elapsed_millis(&self) -> f64 {
        match self.elapsed() {
            Some(elapsed) => elapsed.as_secs_f64() * 1000.0,
            None => -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::Static {
            name: "static-ip:192.0.2.1".into(),
            addr: "192.0.2.1".parse().unwrap(),
        }
    }

    #[test]
    fn delivered_sample_elapsed() {
        let sent = Instant::now();
        let sample = Sample {
            sent,
            recv: Some(sent + Duration::from_millis(12)),
            src: "0.0.0.0".parse().unwrap(),
            dest: "192.0.2.1".parse().unwrap(),
            target: target(),
        };
        assert_eq!(sample.elapsed(), Some(Duration::from_millis(12)));
        assert!((sample.elapsed_millis() - 12.0).abs() < 1e-9);
    }

    #[test]
    fn lost_sample_is_negative() {
        let sample = Sample {
            sent: Instant::now(),
            recv: None,
            src: "0.0.0.0".parse().unwrap(),
            dest: "192.0.2.1".parse().unwrap(),
            target: target(),
        };
        assert_eq!(sample.elapsed(), None);
        assert_eq!(sample.elapsed_millis(), -1.0);
    }
}
