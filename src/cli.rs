use clap::Parser;

use netmon::resolve::FamilyFilter;

/// Continuous network latency monitor: pings hosts, static addresses and
/// traceroute hops, emitting per-probe latency samples
#[derive(Parser, Debug, Clone)]
#[command(name = "netmon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON configuration file
    #[arg(short = 'c', long = "config", default_value = "config.json")]
    pub config: String,

    /// Drop IPv4 resolver answers
    #[arg(long = "no-ipv4")]
    pub no_ipv4: bool,

    /// Drop IPv6 resolver answers
    #[arg(long = "no-ipv6")]
    pub no_ipv6: bool,

    /// Admit IPv4-mapped IPv6 resolver answers (normalized to plain v4)
    #[arg(long = "allow-v4-mapped")]
    pub allow_v4_mapped: bool,
}

impl Args {
    pub fn family_filter(&self) -> FamilyFilter {
        FamilyFilter {
            allow_v4: !self.no_ipv4,
            allow_v6: !self.no_ipv6,
            allow_v4_in_v6: self.allow_v4_mapped,
        }
    }
}
