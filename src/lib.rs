//! Find out where a connection is headed from its first bytes.
//!
//! [`sniff`] reads a bounded prefix off a freshly accepted stream, pulls the
//! SNI out of a TLS ClientHello (or the `Host` header of a plain HTTP/1.x
//! request) and returns the stream wrapped in a [`ReplayConnection`], which
//! gives the consumed bytes back to the next reader. Nothing is decrypted or
//! terminated.

pub mod replay;
pub mod sniffer;

#[cfg(test)]
mod test_util;

pub use replay::{ConnectionInfo, ReplayConnection};
pub use sniffer::{
    sniff, ConnectionSniffer, HostSniffer, ParseError, ReadMode, SniffError, SniffErrorKind,
    Sniffed, SnifferConfig, MAX_PROBE_SIZE,
};
