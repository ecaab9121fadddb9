//! TCP socket wrapper (§4.2).
//!
//! Generalizes `stream.rs`'s `StreamInner` (a bare `Tcp`/`Tls` enum that
//! `read`/`write_all`/`flush` match on inline, with every caller awaiting
//! its own write directly and no queueing) into the spec's addressed
//! primitive: independent reader and writer tasks own the two halves of
//! the transport, `send`/`send_async` hand the writer buffers without
//! blocking the caller on anything but an optional completion, and a
//! buffer-limit threshold protects the fire-and-forget path from an
//! unbounded backlog when the peer stops reading.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::server::TlsStream;
use tracing::warn;

use crate::error::XmppError;
use crate::process::Mailbox;

/// Events a socket posts back to its owning process (§4.2).
#[derive(Debug)]
pub enum SocketEvent {
    /// `tcp-data(socket, bytes)`.
    TcpData(Vec<u8>),
    /// `tcp-close(socket)`.
    TcpClose,
}

enum WriterMsg {
    Write(Vec<u8>, Option<oneshot::Sender<Result<(), XmppError>>>),
    Close,
}

/// A wrapped connection plus its dedicated reader and writer tasks (§4.2).
pub struct Socket {
    writer: mpsc::Sender<WriterMsg>,
    pending_bytes: Arc<AtomicUsize>,
    buffer_limit: usize,
    timeout: Duration,
}

impl Socket {
    /// `of_fd(fd, owner)` for a plain TCP connection: spawn reader and
    /// writer tasks, one-shot-activated (§4.2 "spawn its writer"; the
    /// reader loop here plays the role `activate` plays in the spec, run
    /// continuously rather than re-armed after each read).
    pub fn of_tcp(
        stream: TcpStream,
        owner: Mailbox<SocketEvent>,
        timeout: Duration,
        buffer_limit: usize,
    ) -> Self {
        Self::spawn(stream, owner, timeout, buffer_limit)
    }

    /// Same, for a connection already upgraded to TLS.
    pub fn of_tls(
        stream: TlsStream<TcpStream>,
        owner: Mailbox<SocketEvent>,
        timeout: Duration,
        buffer_limit: usize,
    ) -> Self {
        Self::spawn(stream, owner, timeout, buffer_limit)
    }

    fn spawn<T>(stream: T, owner: Mailbox<SocketEvent>, timeout: Duration, buffer_limit: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let reader_owner = owner.clone();
        tokio::spawn(reader_loop(read_half, reader_owner));

        let (tx, rx) = mpsc::channel(1024);
        let pending_bytes = Arc::new(AtomicUsize::new(0));
        tokio::spawn(writer_loop(write_half, rx, owner, pending_bytes.clone()));

        Socket {
            writer: tx,
            pending_bytes,
            buffer_limit,
            timeout,
        }
    }

    /// `send(socket, data)`: queue `data` and wait for the writer to flush
    /// it, subject to the configured timeout (§4.2).
    pub async fn send(&self, data: Vec<u8>) -> Result<(), XmppError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.pending_bytes.fetch_add(data.len(), Ordering::Relaxed);
        if self.writer.send(WriterMsg::Write(data, Some(done_tx))).await.is_err() {
            return Err(XmppError::internal("socket writer has already stopped"));
        }

        if self.timeout.is_zero() {
            done_rx
                .await
                .map_err(|_| XmppError::internal("socket writer dropped the waiter"))?
        } else {
            match tokio::time::timeout(self.timeout, done_rx).await {
                Ok(result) => {
                    result.map_err(|_| XmppError::internal("socket writer dropped the waiter"))?
                }
                Err(_) => {
                    self.close_forceful();
                    Err(XmppError::internal("socket send timed out"))
                }
            }
        }
    }

    /// `send_async(socket, data)`: fire-and-forget; force-closes first if
    /// the outbound backlog is already over `buffer_limit` (§4.2).
    pub fn send_async(&self, data: Vec<u8>) {
        if self.buffer_limit > 0 && self.pending_bytes.load(Ordering::Relaxed) > self.buffer_limit {
            warn!("socket: buffer limit exceeded, force-closing before enqueueing");
            self.close_forceful();
            return;
        }
        self.pending_bytes.fetch_add(data.len(), Ordering::Relaxed);
        let _ = self.writer.try_send(WriterMsg::Write(data, None));
    }

    /// `close(socket)`: orderly close — the writer drains whatever is
    /// already queued, then shuts the transport down.
    pub fn close(&self) {
        let _ = self.writer.try_send(WriterMsg::Close);
    }

    /// `close'(socket)`: forceful close. Both variants resolve to the same
    /// signal here — the writer task is the only path to tearing the
    /// transport down, so "forceful" means giving up on a drain rather
    /// than tearing the socket down through some second mechanism.
    pub fn close_forceful(&self) {
        let _ = self.writer.try_send(WriterMsg::Close);
    }
}

async fn reader_loop<R>(mut read_half: R, owner: Mailbox<SocketEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                let _ = owner.send(SocketEvent::TcpClose);
                return;
            }
            Ok(n) => {
                if owner.send(SocketEvent::TcpData(buf[..n].to_vec())).is_err() {
                    warn!("socket: owner mailbox full, dropping connection");
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "socket: read failed, treating as close");
                let _ = owner.send(SocketEvent::TcpClose);
                return;
            }
        }
    }
}

async fn writer_loop<W>(
    mut write_half: W,
    mut rx: mpsc::Receiver<WriterMsg>,
    owner: Mailbox<SocketEvent>,
    pending_bytes: Arc<AtomicUsize>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Write(data, waiter) => {
                let len = data.len();
                let result = match write_half.write_all(&data).await {
                    Ok(()) => write_half.flush().await.map_err(XmppError::from),
                    Err(err) => Err(XmppError::from(err)),
                };
                let prev = pending_bytes.load(Ordering::Relaxed);
                pending_bytes.store(prev.saturating_sub(len), Ordering::Relaxed);

                match result {
                    Ok(()) => {
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(Err(XmppError::internal(err.to_string())));
                        }
                        let _ = owner.send(SocketEvent::TcpClose);
                        return;
                    }
                }
            }
            WriterMsg::Close => {
                let _ = write_half.shutdown().await;
                let _ = owner.send(SocketEvent::TcpClose);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mailbox;
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_flushes_to_the_transport_and_completes() {
        let (client, mut server) = duplex(4096);
        let (owner, _inbox) = mailbox::<SocketEvent>(10);
        let socket = Socket::spawn(client, owner, Duration::from_secs(5), 0);

        socket.send(b"hello".to_vec()).await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn reader_posts_tcp_close_on_eof() {
        let (client, server) = duplex(4096);
        let (owner, mut inbox) = mailbox::<SocketEvent>(10);
        let _socket = Socket::spawn(client, owner, Duration::from_secs(5), 0);
        drop(server);

        match inbox.receive().await {
            Some(SocketEvent::TcpClose) => {}
            other => panic!("expected TcpClose, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_async_force_closes_once_the_backlog_exceeds_the_limit() {
        let (client, _server) = duplex(4096);
        let (owner, mut inbox) = mailbox::<SocketEvent>(10);
        let socket = Socket::spawn(client, owner, Duration::from_secs(5), 4);

        // First call: 0 pending bytes is not over the limit, so it is queued.
        socket.send_async(vec![0u8; 10]);
        // Second call now observes 10 pending bytes, over the limit of 4,
        // and force-closes instead of queueing more.
        socket.send_async(vec![0u8; 10]);

        match inbox.receive().await {
            Some(SocketEvent::TcpClose) => {}
            other => panic!("expected TcpClose from the forced close, got {other:?}"),
        }
    }
}
