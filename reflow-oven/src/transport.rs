//! One TCP session with the oven controller.
//!
//! A [`Session`] owns the socket halves and frames them into lines, so
//! callers deal in whole lines. Inbound bytes are split on `\n` and decoded
//! lossily: a line of garbage is still a line, and it is for the protocol
//! layer to reject. It never retries and never reconnects; the client
//! decides what a fault means.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{FutureExt, SinkExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite, LinesCodec,
    LinesCodecError,
};

use crate::error::{ConnectError, TransportError};
use crate::tracing::prelude::*;

/// Bound on flushing and shutting down the write half during close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const LINE_DELIMITER: &[u8] = b"\n";

struct Halves {
    reader: FramedRead<OwnedReadHalf, AnyDelimiterCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

/// A line-oriented connection to one oven.
pub struct Session {
    peer: String,
    inner: Option<Halves>,
    alive: bool,
    max_line_length: usize,
}

impl Session {
    /// Connect to `host:port`, giving up after `timeout`.
    ///
    /// Resolution, refusal and timeout are reported as distinct
    /// [`ConnectError`]s so callers can log something useful.
    pub async fn open(
        host: &str,
        port: u16,
        timeout: Duration,
        max_line_length: usize,
    ) -> Result<Self, ConnectError> {
        let peer = format!("{host}:{port}");

        let stream = time::timeout(timeout, Self::connect(host, port, &peer))
            .await
            .map_err(|_| ConnectError::Timeout {
                addr: peer.clone(),
                timeout_ms: timeout.as_millis(),
            })??;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Could not disable Nagle");
        }

        let (read_half, write_half) = stream.into_split();
        debug!(peer = %peer, "Session opened");

        Ok(Self {
            peer,
            inner: Some(Halves {
                reader: FramedRead::new(
                    read_half,
                    AnyDelimiterCodec::new_with_max_length(
                        LINE_DELIMITER.to_vec(),
                        LINE_DELIMITER.to_vec(),
                        max_line_length,
                    ),
                ),
                writer: FramedWrite::new(write_half, LinesCodec::new()),
            }),
            alive: true,
            max_line_length,
        })
    }

    async fn connect(host: &str, port: u16, peer: &str) -> Result<TcpStream, ConnectError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| ConnectError::Resolve {
                host: host.to_string(),
                port,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ConnectError::Resolve {
                host: host.to_string(),
                port,
            });
        }

        TcpStream::connect(&addrs[..]).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectError::Refused {
                addr: peer.to_string(),
            },
            _ => ConnectError::Io {
                addr: peer.to_string(),
                source: e,
            },
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the session still believes the connection is open.
    ///
    /// This says nothing about whether the device is responsive.
    pub fn is_alive(&self) -> bool {
        self.alive && self.inner.is_some()
    }

    /// Send `line` followed by a newline and flush.
    ///
    /// A write fault marks the session dead.
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let Some(halves) = self.inner.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        if !self.alive {
            return Err(TransportError::Closed);
        }

        let result = halves.writer.send(line).await;
        match result {
            Ok(()) => {
                trace!(peer = %self.peer, line, "Sent");
                Ok(())
            }
            Err(e) => {
                self.alive = false;
                Err(match e {
                    LinesCodecError::Io(e) => TransportError::Io(e),
                    LinesCodecError::MaxLineLengthExceeded => TransportError::LineTooLong {
                        max: self.max_line_length,
                    },
                })
            }
        }
    }

    /// Wait at most `wait` for one complete line.
    ///
    /// `Ok(None)` means nothing arrived in time, or the peer closed the
    /// connection (in which case [`is_alive`](Self::is_alive) turns false).
    pub async fn read_line_if_available(
        &mut self,
        wait: Duration,
    ) -> Result<Option<String>, TransportError> {
        let Some(halves) = self.inner.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let result = time::timeout(wait, halves.reader.next()).await;
        match result {
            Err(_) => Ok(None),
            Ok(Some(Ok(chunk))) => {
                let line = to_line(&chunk);
                trace!(peer = %self.peer, line = %line, "Received");
                Ok(Some(line))
            }
            Ok(Some(Err(e))) => {
                self.alive = false;
                Err(self.map_read_error(e))
            }
            Ok(None) => {
                debug!(peer = %self.peer, "Peer closed the connection");
                self.alive = false;
                Ok(None)
            }
        }
    }

    /// Take every line that is already buffered, without waiting.
    ///
    /// A fault part-way through marks the session dead and returns what was
    /// read before it.
    pub fn drain_buffered_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let Some(halves) = self.inner.as_mut() else {
            return lines;
        };

        loop {
            match halves.reader.next().now_or_never() {
                Some(Some(Ok(chunk))) => lines.push(to_line(&chunk)),
                Some(Some(Err(e))) => {
                    warn!(peer = %self.peer, error = %e, "Read fault while draining");
                    self.alive = false;
                    break;
                }
                Some(None) => {
                    debug!(peer = %self.peer, "Peer closed the connection");
                    self.alive = false;
                    break;
                }
                None => break,
            }
        }
        lines
    }

    /// Release the socket. Safe to call more than once.
    ///
    /// Errors while shutting down are logged and dropped: the connection is
    /// going away regardless.
    pub async fn close(&mut self) {
        self.alive = false;
        let Some(mut halves) = self.inner.take() else {
            return;
        };

        let closing = SinkExt::<&str>::close(&mut halves.writer);
        match time::timeout(CLOSE_TIMEOUT, closing).await {
            Ok(Ok(())) => debug!(peer = %self.peer, "Session closed"),
            Ok(Err(e)) => warn!(peer = %self.peer, error = %e, "Error while closing session"),
            Err(_) => warn!(peer = %self.peer, "Timed out closing session"),
        }
    }

    fn map_read_error(&self, e: AnyDelimiterCodecError) -> TransportError {
        match e {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => TransportError::LineTooLong {
                max: self.max_line_length,
            },
            AnyDelimiterCodecError::Io(e) => TransportError::Io(e),
        }
    }
}

/// One framed chunk as text, without its trailing `\r`. Invalid UTF-8
/// becomes U+FFFD rather than an error.
fn to_line(chunk: &[u8]) -> String {
    let text = String::from_utf8_lossy(chunk);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}
