//! Turning declarative targets into their current address sets.

pub mod service;

pub use service::ResolverService;

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio_util::sync::CancellationToken;

use crate::config::Target;
use crate::icmp;
use crate::trace::{self, TraceOptions, TraceResult, DEFAULT_MAX_HOPS};

/// Traceroute settings used when a hop target is resolved. Hops are
/// re-resolved on every cycle, so the per-hop budget stays small.
const HOP_RETRIES: usize = 5;
const HOP_TIMEOUT: Duration = Duration::from_secs(2);

/// One target's current addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub target: Target,
    pub addrs: Vec<IpAddr>,
}

/// Everything that resolved this cycle, cached or fresh. Targets with no
/// known addresses are absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolveResult {
    pub items: Vec<Resolution>,
}

/// Which address families the resolver may hand downstream.
#[derive(Debug, Clone, Copy)]
pub struct FamilyFilter {
    pub allow_v4: bool,
    pub allow_v6: bool,
    /// Admit IPv4-mapped-in-IPv6 lookup answers. Admitted mapped
    /// addresses are still normalized to plain v4 before leaving the
    /// resolver.
    pub allow_v4_in_v6: bool,
}

impl Default for FamilyFilter {
    fn default() -> Self {
        Self {
            allow_v4: true,
            allow_v6: true,
            allow_v4_in_v6: false,
        }
    }
}

impl FamilyFilter {
    /// Admission check on a raw lookup answer, before normalization.
    pub fn admits(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(_) => self.allow_v4,
            IpAddr::V6(v6) => {
                if v6.to_ipv4_mapped().is_some() {
                    self.allow_v4_in_v6
                } else {
                    self.allow_v6
                }
            }
        }
    }

    fn apply(&self, addrs: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
        addrs
            .into_iter()
            .filter(|addr| self.admits(*addr))
            .map(icmp::unmap)
            .collect()
    }
}

/// Resolution backend. The production implementation combines DNS and
/// traceroute; tests substitute deterministic fakes.
pub trait Resolver: Send + Sync {
    fn resolve(
        &self,
        target: &Target,
    ) -> impl std::future::Future<Output = Result<Vec<IpAddr>>> + Send;
}

/// The production resolver: DNS for host targets, identity for static
/// addresses, a traceroute for hop targets.
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    filter: FamilyFilter,
    cancel: CancellationToken,
}

impl DnsResolver {
    pub fn new(filter: FamilyFilter, cancel: CancellationToken) -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            filter,
            cancel,
        }
    }

    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .with_context(|| format!("dns lookup for {host} failed"))?;
        Ok(self.filter.apply(lookup.iter()))
    }

    async fn resolve_hop(&self, dest: IpAddr, hop: i32) -> Result<Vec<IpAddr>> {
        // A negative hop counts back from the end of the path, whose
        // length is unknowable up front; probe the default distance.
        let max_hops = match usize::try_from(hop) {
            Ok(hop) => hop + 1,
            Err(_) => DEFAULT_MAX_HOPS,
        };
        let result = trace::trace(
            dest,
            TraceOptions {
                max_hops,
                retries: HOP_RETRIES,
                hop_timeout: HOP_TIMEOUT,
                interface: None,
            },
            self.cancel.child_token(),
        )
        .await?;
        index_hops(&result, hop)
    }
}

impl Resolver for DnsResolver {
    async fn resolve(&self, target: &Target) -> Result<Vec<IpAddr>> {
        match target {
            Target::Host { host, .. } => self.resolve_host(host).await,
            Target::Static { addr, .. } => Ok(vec![icmp::unmap(*addr)]),
            Target::Hop { dest, hop, .. } => self.resolve_hop(*dest, *hop).await,
        }
    }
}

/// Pick the `hop`-indexed entry out of a trace. Hop zero is the source
/// host; negative indices count back from the last recorded hop.
fn index_hops(result: &TraceResult, hop: i32) -> Result<Vec<IpAddr>> {
    let len = result.hops.len() as i64;
    let mut index = i64::from(hop);
    if index < 0 {
        index += len;
    }
    if index < 0 || index >= len {
        bail!(
            "traceroute to {} has no hop {hop}: {} hops found",
            result.dest,
            len
        );
    }
    match result.hops[index as usize] {
        Some(addr) => Ok(vec![icmp::unmap(addr)]),
        None => bail!("hop {hop} toward {} did not answer", result.dest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn family_filter_defaults() {
        let filter = FamilyFilter::default();
        assert!(filter.admits(addr("192.0.2.1")));
        assert!(filter.admits(addr("2001:db8::1")));
        // Mapped answers are excluded unless opted into.
        assert!(!filter.admits(addr("::ffff:192.0.2.1")));
    }

    #[test]
    fn family_filter_toggles() {
        let v6_only = FamilyFilter {
            allow_v4: false,
            ..FamilyFilter::default()
        };
        assert!(!v6_only.admits(addr("192.0.2.1")));
        assert!(v6_only.admits(addr("2001:db8::1")));

        let mapped_ok = FamilyFilter {
            allow_v4_in_v6: true,
            ..FamilyFilter::default()
        };
        // Admitted, and normalized to plain v4 on the way out.
        assert_eq!(
            mapped_ok.apply([addr("::ffff:192.0.2.7")]),
            vec![addr("192.0.2.7")]
        );
    }

    fn trace_fixture() -> TraceResult {
        TraceResult {
            source: addr("0.0.0.0"),
            dest: addr("8.8.8.8"),
            hops: vec![
                Some(addr("0.0.0.0")),
                Some(addr("10.0.0.1")),
                Some(addr("10.0.0.2")),
                None,
                None,
            ],
        }
    }

    #[test]
    fn index_hops_positive() {
        let result = trace_fixture();
        assert_eq!(index_hops(&result, 1).unwrap(), vec![addr("10.0.0.1")]);
        assert_eq!(index_hops(&result, 2).unwrap(), vec![addr("10.0.0.2")]);
    }

    #[test]
    fn index_hops_negative_counts_from_end() {
        let result = trace_fixture();
        // -3 lands on the last responsive hop of the five-entry path.
        assert_eq!(index_hops(&result, -3).unwrap(), vec![addr("10.0.0.2")]);
    }

    #[test]
    fn index_hops_out_of_range_is_an_error() {
        let result = trace_fixture();
        assert!(index_hops(&result, 5).is_err());
        assert!(index_hops(&result, -6).is_err());
    }

    #[test]
    fn index_hops_unresponsive_hop_is_an_error() {
        let result = trace_fixture();
        assert!(index_hops(&result, 3).is_err());
        assert!(index_hops(&result, -1).is_err());
    }
}
