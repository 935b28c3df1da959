use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::packet::{self, Echo, Family, IcmpMessage};

/// Largest datagram we expect; anything bigger would have been
/// fragmented on common MTU networks.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Privilege level a socket was opened with. Raw sockets observe error
/// messages (Time Exceeded, Destination Unreachable); datagram sockets
/// only ever see echo replies but require no special capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Datagram,
    Raw,
}

/// An ICMP socket for one address family, usable for both sending echo
/// requests and receiving replies.
#[derive(Debug)]
pub struct IcmpSocket {
    socket: Socket,
    family: Family,
    mode: Mode,
}

impl IcmpSocket {
    /// Open an unprivileged datagram ICMP socket bound to `local`.
    ///
    /// The kernel assigns the echo identifier on these sockets and
    /// rewrites whatever id the caller marshals.
    pub fn listen(local: IpAddr) -> Result<Self> {
        Self::open(local, Mode::Datagram)
    }

    /// Open a raw ICMP socket bound to `local`. Needs CAP_NET_RAW or
    /// root; required to observe anything beyond echo replies.
    pub fn listen_privileged(local: IpAddr) -> Result<Self> {
        Self::open(local, Mode::Raw)
    }

    fn open(local: IpAddr, mode: Mode) -> Result<Self> {
        let local = packet::unmap(local);
        let family = Family::of(local);
        let (domain, protocol) = match family {
            Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
            Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let ty = match mode {
            Mode::Datagram => Type::DGRAM,
            Mode::Raw => Type::RAW,
        };
        let socket = Socket::new(domain, ty, Some(protocol))
            .with_context(|| format!("could not open {mode:?} icmp socket for {local}"))?;
        socket
            .bind(&SockAddr::from(SocketAddr::new(local, 0)))
            .with_context(|| format!("could not bind icmp socket to {local}"))?;
        Ok(Self {
            socket,
            family,
            mode,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// The kernel-assigned echo identifier of a datagram socket, exposed
    /// as the bound port. `None` when the kernel does not report one.
    pub fn local_id(&self) -> Option<u16> {
        self.socket
            .local_addr()
            .ok()?
            .as_socket()
            .map(|s| s.port())
            .filter(|port| *port != 0)
    }

    /// Bound read deadline for subsequent [`recv`](Self::recv) calls.
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        // A zero timeout would mean "block forever" to the kernel.
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .context("failed to set read timeout")
    }

    /// Set the IPv4 TTL or IPv6 hop limit, whichever the family uses.
    pub fn set_ttl(&self, ttl: u8) -> Result<()> {
        match self.family {
            Family::V4 => self.socket.set_ttl(u32::from(ttl)),
            Family::V6 => self.socket.set_unicast_hops_v6(u32::from(ttl)),
        }
        .with_context(|| format!("failed to set ttl to {ttl}"))
    }

    /// Marshal and transmit one echo request to `dest`.
    pub fn send_echo(&self, echo: Echo, payload: &[u8], dest: IpAddr) -> Result<()> {
        let dest = packet::unmap(dest);
        if !self.family.matches(dest) {
            bail!("destination {dest} does not match socket family {:?}", self.family);
        }
        let buf = packet::build_echo_request(self.family, echo, payload);
        let addr = SockAddr::from(SocketAddr::new(dest, 0));
        self.socket
            .send_to(&buf, &addr)
            .with_context(|| format!("icmp send to {dest} failed"))?;
        Ok(())
    }

    /// Receive and parse one ICMP message, blocking up to the read
    /// timeout. Returns the source address alongside the parsed message.
    pub fn recv(&self, buf: &mut [u8]) -> Result<(IpAddr, IcmpMessage)> {
        // socket2 takes an uninitialized buffer; reusing the caller's is
        // sound because u8 has no validity requirement.
        let uninit: &mut [MaybeUninit<u8>] = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<MaybeUninit<u8>>(), buf.len())
        };
        let (len, addr) = self.socket.recv_from(uninit)?;

        let source = addr
            .as_socket()
            .map(|s| s.ip())
            .ok_or_else(|| anyhow!("unparseable packet source: {addr:?}"))?;
        let source = packet::unmap(source);

        let mut data = &buf[..len];
        // Raw v4 sockets deliver the IP header; datagram sockets and all
        // v6 sockets start at the ICMP header.
        if self.family == Family::V4 && self.mode == Mode::Raw {
            data = packet::strip_ipv4_header(data)?;
        }
        let msg = packet::parse_message(self.family, data)?;
        Ok((source, msg))
    }
}

/// True when an error is the socket read deadline expiring, which is
/// normal control flow for every receive loop in this crate.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>().is_some_and(|io| {
        matches!(
            io.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        )
    })
}

/// True when an error means the socket is gone and the owning loop
/// should terminate rather than retry.
pub fn is_terminal(err: &anyhow::Error) -> bool {
    // EBADF: the descriptor was closed under us.
    const EBADF: i32 = 9;
    err.downcast_ref::<io::Error>().is_some_and(|io| {
        io.raw_os_error() == Some(EBADF)
            || matches!(
                io.kind(),
                io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_classification() {
        let err = anyhow::Error::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(is_timeout(&err));

        let err = anyhow::Error::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(is_timeout(&err));

        let err = anyhow!("parse failure");
        assert!(!is_timeout(&err));
    }

    #[test]
    fn terminal_classification() {
        let err = anyhow::Error::from(io::Error::from_raw_os_error(9));
        assert!(is_terminal(&err));

        let err = anyhow::Error::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(!is_terminal(&err));
    }
}
