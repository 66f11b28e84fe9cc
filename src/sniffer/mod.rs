//! Destination-host sniffing for freshly accepted connections.
//!
//! A [`ConnectionSniffer`] reads one bounded prefix from a connection, runs it
//! through an ordered chain of [`HostSniffer`] strategies (TLS ClientHello
//! first, HTTP `Host` header second) and hands the connection back wrapped in
//! a [`ReplayConnection`] so the consumed bytes are seen again by whoever
//! reads next.

pub mod http_parse;
pub mod tls_parse;

use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::replay::ReplayConnection;

pub use http_parse::HttpSniffer;
pub use tls_parse::TlsSniffer;

/// Upper bound on the number of bytes read from a connection while sniffing.
pub const MAX_PROBE_SIZE: usize = 512;

/// Errors produced while looking for a hostname in a buffered prefix.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("not a TLS handshake record")]
    NotHandshake,
    #[error("incomplete TLS record")]
    IncompleteRecord,
    #[error("not a ClientHello")]
    NotClientHello,
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("SNI not found")]
    ServerNameNotFound,
    #[error("no DNS SNI found")]
    NoHostName,
    #[error("server name is not valid UTF-8")]
    InvalidHostName,
    #[error("host header not found in request")]
    HostHeaderNotFound,
}

impl ParseError {
    /// Whether more bytes from the peer could turn this failure into a success.
    pub fn is_truncation(&self) -> bool {
        matches!(self, ParseError::IncompleteRecord | ParseError::Truncated(_))
    }
}

/// One step of the sniffing chain.
pub trait HostSniffer: Send + Sync {
    /// Short label used in logs and reported back in [`Sniffed::sniffer`].
    fn name(&self) -> &'static str;

    fn attempt(&self, data: &[u8]) -> Result<String, ParseError>;
}

/// How the probe prefix is collected from the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Exactly one read call; a ClientHello split across segments is not
    /// reassembled.
    #[default]
    Single,
    /// Keep reading while a strategy reports truncation, up to the probe size.
    Accumulate,
}

impl FromStr for ReadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ReadMode::Single),
            "accumulate" => Ok(ReadMode::Accumulate),
            other => Err(format!(
                "`{}` is not a read mode, either `single` or `accumulate` is expected.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnifferConfig {
    /// Bytes requested from the connection, clamped to `1..=MAX_PROBE_SIZE`.
    pub probe_size: usize,
    pub read_mode: ReadMode,
    /// Match the `Host` header name regardless of case.
    pub case_insensitive_host: bool,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            probe_size: MAX_PROBE_SIZE,
            read_mode: ReadMode::Single,
            case_insensitive_host: false,
        }
    }
}

/// A successful sniff.
pub struct Sniffed<S> {
    pub host: String,
    /// Name of the strategy that produced `host`.
    pub sniffer: &'static str,
    /// The connection, replaying the probed prefix before any fresh bytes.
    pub conn: ReplayConnection<S>,
}

impl<S> fmt::Debug for Sniffed<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sniffed")
            .field("host", &self.host)
            .field("sniffer", &self.sniffer)
            .field("conn", &self.conn)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffErrorKind {
    ConnectionRead,
    HostHeaderNotFound,
}

/// Failure of [`ConnectionSniffer::sniff`].
pub enum SniffError<S> {
    /// The probe read failed. The connection is gone.
    Read(io::Error),
    /// No strategy found a host. The connection is handed back with the
    /// consumed prefix still queued for replay.
    HostNotFound {
        cause: ParseError,
        conn: ReplayConnection<S>,
    },
}

impl<S> SniffError<S> {
    pub fn kind(&self) -> SniffErrorKind {
        match self {
            SniffError::Read(_) => SniffErrorKind::ConnectionRead,
            SniffError::HostNotFound { .. } => SniffErrorKind::HostHeaderNotFound,
        }
    }

    pub fn into_connection(self) -> Option<ReplayConnection<S>> {
        match self {
            SniffError::Read(_) => None,
            SniffError::HostNotFound { conn, .. } => Some(conn),
        }
    }
}

impl<S> fmt::Debug for SniffError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniffError::Read(err) => f.debug_tuple("Read").field(err).finish(),
            SniffError::HostNotFound { cause, conn } => f
                .debug_struct("HostNotFound")
                .field("cause", cause)
                .field("buffered", &conn.buffered().len())
                .finish(),
        }
    }
}

impl<S> fmt::Display for SniffError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniffError::Read(err) => write!(f, "failed to read connection prefix: {}", err),
            SniffError::HostNotFound { cause, conn } => write!(
                f,
                "no host found in {} byte prefix: {}",
                conn.buffered().len(),
                cause
            ),
        }
    }
}

impl<S> std::error::Error for SniffError<S> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SniffError::Read(err) => Some(err),
            SniffError::HostNotFound { cause, .. } => Some(cause),
        }
    }
}

/// Reads a bounded prefix off a connection and tries each strategy on it.
pub struct ConnectionSniffer {
    probe_size: usize,
    read_mode: ReadMode,
    sniffers: Vec<Box<dyn HostSniffer>>,
}

impl ConnectionSniffer {
    /// Builds the TLS-then-HTTP chain.
    pub fn new(config: SnifferConfig) -> Self {
        Self {
            probe_size: config.probe_size.clamp(1, MAX_PROBE_SIZE),
            read_mode: config.read_mode,
            sniffers: vec![
                Box::new(TlsSniffer),
                Box::new(HttpSniffer {
                    case_insensitive: config.case_insensitive_host,
                }),
            ],
        }
    }

    /// Appends a strategy after the existing ones.
    pub fn with_sniffer<T: HostSniffer + 'static>(mut self, sniffer: T) -> Self {
        self.sniffers.push(Box::new(sniffer));
        self
    }

    pub fn probe_size(&self) -> usize {
        self.probe_size
    }

    /// Runs the chain over `data`. On failure every strategy's error is
    /// returned in chain order.
    pub fn attempt(&self, data: &[u8]) -> Result<(String, &'static str), Vec<ParseError>> {
        let mut errors = Vec::with_capacity(self.sniffers.len());
        for sniffer in &self.sniffers {
            match sniffer.attempt(data) {
                Ok(host) => return Ok((host, sniffer.name())),
                Err(err) => {
                    debug!("{} sniffer: {}", sniffer.name(), err);
                    errors.push(err);
                }
            }
        }
        Err(errors)
    }

    pub async fn sniff<S>(&self, mut conn: S) -> Result<Sniffed<S>, SniffError<S>>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = [0u8; MAX_PROBE_SIZE];
        let limit = self.probe_size;

        let mut filled = match conn.read(&mut buf[..limit]).await {
            Ok(n) => n,
            Err(err) => {
                debug!("failed to read connection prefix: {}", err);
                return Err(SniffError::Read(err));
            }
        };
        let mut outcome = self.attempt(&buf[..filled]);

        if self.read_mode == ReadMode::Accumulate {
            while filled > 0 && filled < limit && needs_more(&outcome) {
                match conn.read(&mut buf[filled..limit]).await {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) => {
                        // A reset is usually reported once, so the held bytes
                        // can't be replayed as a clean stream.
                        debug!("failed to read connection prefix after {} bytes: {}", filled, err);
                        return Err(SniffError::Read(err));
                    }
                }
                outcome = self.attempt(&buf[..filled]);
            }
        }

        let conn = ReplayConnection::new(conn, Bytes::copy_from_slice(&buf[..filled]));
        match outcome {
            Ok((host, sniffer)) => {
                debug!("found the server name {} via {}", host, sniffer);
                Ok(Sniffed {
                    host,
                    sniffer,
                    conn,
                })
            }
            Err(mut errors) => {
                let cause = errors.pop().unwrap_or(ParseError::HostHeaderNotFound);
                debug!("no host found in {} byte prefix: {}", filled, cause);
                Err(SniffError::HostNotFound { cause, conn })
            }
        }
    }
}

impl Default for ConnectionSniffer {
    fn default() -> Self {
        Self::new(SnifferConfig::default())
    }
}

fn needs_more(outcome: &Result<(String, &'static str), Vec<ParseError>>) -> bool {
    match outcome {
        Ok(_) => false,
        Err(errors) => errors.iter().any(ParseError::is_truncation),
    }
}

/// Sniffs `conn` with the default TLS-then-HTTP chain and a single 512 byte read.
pub async fn sniff<S>(conn: S) -> Result<Sniffed<S>, SniffError<S>>
where
    S: AsyncRead + Unpin,
{
    ConnectionSniffer::default().sniff(conn).await
}
