//! A connection wrapper that hands already-consumed bytes back to the next reader.

use std::cmp;
use std::fmt;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Address accessors of a stream socket.
pub trait ConnectionInfo {
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl ConnectionInfo for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

/// Replays a buffered prefix, then reads from the inner stream.
///
/// Writes go straight to the inner stream. Shutting the wrapper down shuts
/// the inner stream down once; later shutdowns are no-ops. The wrapper is a
/// single-owner stream like the one it wraps, callers serialize access.
pub struct ReplayConnection<S> {
    inner: S,
    buffered: Bytes,
    closed: bool,
}

impl<S> ReplayConnection<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self {
            inner,
            buffered: prefix,
            closed: false,
        }
    }

    /// Bytes not yet replayed.
    pub fn buffered(&self) -> &[u8] {
        &self.buffered
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Reading through this reference skips the unreplayed prefix.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Splits into the inner stream and the bytes still owed to the reader.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.buffered)
    }
}

impl<S> ReplayConnection<S>
where
    S: AsyncWrite + Unpin,
{
    /// Shuts the inner stream down. Only the first call reaches it.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

impl<S> fmt::Debug for ReplayConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayConnection")
            .field("buffered", &self.buffered.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S: ConnectionInfo> ConnectionInfo for ReplayConnection<S> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl<S> AsyncRead for ReplayConnection<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.buffered.has_remaining() {
            let n = cmp::min(buf.remaining(), this.buffered.len());
            buf.put_slice(&this.buffered[..n]);
            this.buffered.advance(n);
            if !this.buffered.has_remaining() {
                // drop our reference to the probe buffer
                this.buffered = Bytes::new();
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for ReplayConnection<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }

        let res = ready!(Pin::new(&mut this.inner).poll_shutdown(cx));
        this.closed = true;
        Poll::Ready(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ChunkedStream;
    use tokio::io::AsyncReadExt;

    fn wrap(prefix: &[u8], rest: Vec<Vec<u8>>) -> ReplayConnection<ChunkedStream> {
        ReplayConnection::new(ChunkedStream::new(rest), Bytes::copy_from_slice(prefix))
    }

    #[tokio::test]
    async fn test_replay_then_delegate_any_read_size() {
        let prefix = b"\x16\x03\x01prefix-bytes";
        let rest = vec![b"first".to_vec(), b"-second-".to_vec(), b"third".to_vec()];
        let mut expected = prefix.to_vec();
        expected.extend(rest.concat());

        for size in 1..=expected.len() + 1 {
            let mut conn = wrap(prefix, rest.clone());
            let mut out = Vec::new();
            let mut buf = vec![0u8; size];
            loop {
                let n = conn.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            assert_eq!(out, expected, "read size {}", size);
            assert_eq!(out.len(), prefix.len() + rest.concat().len());
        }
    }

    #[tokio::test]
    async fn test_prefix_reads_do_not_touch_inner() {
        let mut conn = wrap(b"hello", vec![b"world".to_vec()]);
        let mut buf = [0u8; 3];

        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hel");
        assert_eq!(conn.buffered(), b"lo");
        assert!(conn.get_ref().requested.is_empty());

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"lo");
        assert!(conn.get_ref().requested.is_empty());

        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(conn.get_ref().requested, vec![16]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut conn = wrap(b"abc", vec![]);
        assert!(!conn.is_closed());

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        conn.shutdown().await.unwrap();

        assert!(conn.is_closed());
        assert_eq!(conn.get_ref().shutdowns, 1);
    }

    #[tokio::test]
    async fn test_write_delegates() {
        let mut conn = wrap(b"request", vec![]);
        conn.write_all(b"response").await.unwrap();
        conn.flush().await.unwrap();

        assert_eq!(conn.get_ref().written, b"response");
        // writing does not consume the replay buffer
        assert_eq!(conn.buffered(), b"request");
    }

    #[tokio::test]
    async fn test_into_parts() {
        let mut conn = wrap(b"abcdef", vec![b"tail".to_vec()]);
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();

        let (inner, rest) = conn.into_parts();
        assert_eq!(&rest[..], b"cdef");
        assert_eq!(inner.shutdowns, 0);
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            stream.write_all(b"Host: example.com\r\n\r\n").await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let (mut socket, peer) = listener.accept().await.unwrap();
        let mut first = [0u8; 16];
        socket.read_exact(&mut first).await.unwrap();

        let mut conn = ReplayConnection::new(socket, Bytes::copy_from_slice(&first));
        assert_eq!(ConnectionInfo::peer_addr(&conn).unwrap(), peer);
        assert_eq!(ConnectionInfo::local_addr(&conn).unwrap(), addr);

        let mut request = vec![0u8; 37];
        conn.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..], b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

        conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(client.await.unwrap(), b"HTTP/1.1 204 No Content\r\n\r\n");
    }
}
