use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, copy_bidirectional};
use tracing::debug;

/// RelayStats counts the bytes moved in each direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub from_client: u64,
    pub from_upstream: u64,
}

/// Relay pumps bytes between an established client connection and its
/// upstream until both directions finish or one of them fails.
///
/// End-of-stream on one side is forwarded as a write shutdown on the
/// other while the opposite direction keeps flowing. An I/O error in
/// either direction stops both.
pub struct Relay<'a, C: ?Sized, U: ?Sized> {
    client: &'a mut C,
    upstream: &'a mut U,
}

/// Relay implementation block
impl<'a, C, U> Relay<'a, C, U>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
    U: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    pub fn new(client: &'a mut C, upstream: &'a mut U) -> Self {
        Self { client, upstream }
    }

    /// run relays until teardown. Errors end the relay like a clean EOF
    /// would; they are returned for logging only. The stats cover the
    /// bytes read before the error.
    pub async fn run(self) -> (RelayStats, Option<io::Error>) {
        let mut client = Counted::new(self.client);
        let mut upstream = Counted::new(self.upstream);

        match copy_bidirectional(&mut client, &mut upstream).await {
            Ok((from_client, from_upstream)) => {
                debug!(
                    "relay finished: {} bytes from client, {} bytes from upstream",
                    from_client, from_upstream
                );
                (
                    RelayStats {
                        from_client,
                        from_upstream,
                    },
                    None,
                )
            }
            Err(e) => {
                debug!("relay terminated by I/O error: {e}");
                let stats = RelayStats {
                    from_client: client.read,
                    from_upstream: upstream.read,
                };
                (stats, Some(e))
            }
        }
    }
}

/// Counted tallies the bytes read through a stream so partial transfers
/// can still be reported
struct Counted<'a, T: ?Sized> {
    inner: &'a mut T,
    read: u64,
}

impl<'a, T: ?Sized> Counted<'a, T> {
    fn new(inner: &'a mut T) -> Self {
        Self { inner, read: 0 }
    }
}

impl<T: AsyncRead + Unpin + ?Sized> AsyncRead for Counted<'_, T> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.read += (buf.filled().len() - before) as u64;
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin + ?Sized> AsyncWrite for Counted<'_, T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}
