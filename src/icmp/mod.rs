//! ICMP transport shared by the ping and traceroute engines: socket
//! handling for both address families and the wire model for the small
//! set of message types we care about.

pub mod packet;
pub mod socket;

pub use packet::*;
pub use socket::*;
