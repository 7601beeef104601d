//! TCP/TLS duplex byte stream with RouterOS sentence framing.
//!
//! One reader task per connection drives a `Framed<_, WordCodec>` stream and
//! forwards decoded words to the router core over an mpsc channel; writes
//! are serialized through a second mpsc channel so that sentence-granularity
//! atomicity holds even when multiple callers submit concurrently (the same
//! single-writer-task shape the teacher uses to serialize writes onto a
//! WebSocket sink fed by multiple producers).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::codec::WordCodec;
use crate::error::{Error, Result};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// A byte stream that is either a plain TCP socket or a TLS-wrapped one,
/// unified behind `AsyncRead`/`AsyncWrite` so the framing layer above
/// doesn't need to know which.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match this {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An event surfaced by the reader task to whatever owns the transport.
#[derive(Debug)]
pub enum TransportEvent {
    Word(String),
    Closed,
    Error(String),
}

/// A single duplex connection to a RouterOS device, framed at the word
/// level.
pub struct SocketTransport {
    writer_tx: mpsc::Sender<String>,
    events_rx: mpsc::Receiver<TransportEvent>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

impl SocketTransport {
    /// Connect to `host:port`, optionally over TLS, within `handshake_timeout`.
    /// After connecting, Nagle is disabled and TCP keepalive is set to a
    /// 10 s interval.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: bool,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(handshake_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("connect {host}:{port}: {e}")))?;

        configure_socket(&stream)?;

        let stream = if tls {
            let connector = tls_connector()?;
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|e| Error::Transport(format!("invalid TLS server name {host:?}: {e}")))?;
            let tls_stream = timeout(handshake_timeout, connector.connect(server_name, stream))
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|e| Error::Transport(format!("TLS handshake: {e}")))?;
            MaybeTlsStream::Tls(Box::new(tls_stream))
        } else {
            MaybeTlsStream::Plain(stream)
        };

        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: MaybeTlsStream) -> Self {
        let framed = Framed::new(stream, WordCodec);
        let (mut sink, mut source) = framed.split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(256);
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(256);

        let writer_task = tokio::spawn(async move {
            while let Some(word) = writer_rx.recv().await {
                if let Err(e) = sink.send(word).await {
                    error!(error = %e, "socket transport: write failed");
                    break;
                }
            }
            debug!("socket transport: writer task exiting");
        });

        let reader_events_tx = events_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(word)) => {
                        if reader_events_tx
                            .send(TransportEvent::Word(word))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "socket transport: framing error");
                        let _ = reader_events_tx
                            .send(TransportEvent::Error(e.to_string()))
                            .await;
                        break;
                    }
                    None => {
                        info!("socket transport: connection closed by peer");
                        let _ = reader_events_tx.send(TransportEvent::Closed).await;
                        break;
                    }
                }
            }
        });

        Self {
            writer_tx,
            events_rx,
            reader_task,
            writer_task,
        }
    }

    /// Clone a handle callers can use to submit words without taking
    /// ownership of the transport itself — the router core's pump task
    /// needs to own the transport to drive its reader loop, while
    /// submitters only ever need a sender into the same serialized queue.
    pub fn writer(&self) -> mpsc::Sender<String> {
        self.writer_tx.clone()
    }

    /// Write one word. Sentence submission serializes a whole sentence's
    /// worth of calls (including the empty terminator) through this same
    /// channel, so interleaving across concurrent submitters is impossible.
    pub async fn write(&self, word: impl Into<String>) -> Result<()> {
        self.writer_tx
            .send(word.into())
            .await
            .map_err(|_| Error::ConnectionLost)
    }

    /// Receive the next transport event (a decoded word, or connection
    /// closed/error).
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Half-close: stop the reader so no further words are delivered, but
    /// leave any already-queued writes to drain through the writer task.
    pub fn close(&self) {
        self.reader_task.abort();
    }

    /// Immediate teardown of both tasks.
    pub fn destroy(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

fn configure_socket(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| Error::Transport(format!("set_nodelay: {e}")))?;
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
    sock_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Transport(format!("set_tcp_keepalive: {e}")))?;
    Ok(())
}

fn tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots_certs());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Load the platform/embedded root certificate set. Kept as a separate
/// function so a future certificate-trust override (out of scope per §1
/// Non-goals: no pinning) has a single seam to replace.
fn webpki_roots_certs() -> impl Iterator<Item = rustls_pki_types::CertificateDer<'static>> {
    webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| ta.to_owned().into())
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}
