//! Per-peer connection state: one exclusively owned TCP socket plus the buffers that
//!  absorb partial reads and writes. All I/O here is non-blocking single steps; the
//!  multiplexer decides when a step is worth taking.

use crate::error::BridgeError;
use crate::frame;
use bytes::{Buf, Bytes, BytesMut};
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tracing::{trace, warn};

type DialFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// The socket is part of the state so that a closed connection cannot hold a live
///  descriptor: dropping the variant releases it.
enum SocketState {
    Connecting(DialFuture),
    Established(TcpStream),
    Closing(TcpStream),
    Closed,
}

/// Observable projection of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Established,
    Closing,
    Closed,
}

/// Result of one read step.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Zero or more complete frames; an incomplete trailing frame stays buffered.
    Frames(Vec<Bytes>),
    /// The peer closed the connection (zero-length read). The caller must deregister
    ///  this connection - removing it drops the socket.
    Closed,
}

pub struct PeerConnection {
    addr: SocketAddr,
    socket: SocketState,
    inbound: BytesMut,
    outbound: BytesMut,
    read_buf_size: usize,
    max_frame_size: usize,
}

impl PeerConnection {
    /// Starts an active, non-blocking dial to `addr`. The connection is usable
    ///  immediately: data enqueued while `Connecting` is flushed once the dial
    ///  completes. Dial completion or failure is observed via [PeerConnection::poll_dial],
    ///  driven by the multiplexer.
    pub fn connect(addr: SocketAddr, read_buf_size: usize, max_frame_size: usize) -> PeerConnection {
        PeerConnection {
            addr,
            socket: SocketState::Connecting(Box::pin(TcpStream::connect(addr))),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            read_buf_size,
            max_frame_size,
        }
    }

    /// Wraps a passively accepted connection, entering `Established` directly.
    pub fn from_accepted(
        addr: SocketAddr,
        stream: TcpStream,
        read_buf_size: usize,
        max_frame_size: usize,
    ) -> PeerConnection {
        PeerConnection {
            addr,
            socket: SocketState::Established(stream),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            read_buf_size,
            max_frame_size,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        match &self.socket {
            SocketState::Connecting(_) => PeerState::Connecting,
            SocketState::Established(_) => PeerState::Established,
            SocketState::Closing(_) => PeerState::Closing,
            SocketState::Closed => PeerState::Closed,
        }
    }

    /// True iff there is pending outbound data. Write interest in the multiplexer is
    ///  gated on this - unconditional write interest would make the loop spin on idle
    ///  connections.
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Appends one framed message to the outbound queue, in order behind everything
    ///  already queued.
    pub fn enqueue_message(&mut self, payload: &[u8]) {
        frame::put_frame(&mut self.outbound, payload);
    }

    pub(crate) fn poll_dial(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let SocketState::Connecting(dial) = &mut self.socket else {
            return Poll::Pending;
        };
        match dial.as_mut().poll(cx) {
            Poll::Ready(Ok(stream)) => {
                self.socket = SocketState::Established(stream);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.socket = SocketState::Closed;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &self.socket {
            SocketState::Established(stream) => stream.poll_read_ready(cx),
            _ => Poll::Pending,
        }
    }

    pub(crate) fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &self.socket {
            SocketState::Established(stream) => stream.poll_write_ready(cx),
            _ => Poll::Pending,
        }
    }

    /// One non-blocking read step: receive into a bounded buffer, append to the inbound
    ///  accumulator, and take every complete frame off it. An incomplete frame stays
    ///  buffered until more data arrives; an oversized frame closes the connection.
    pub fn on_readable(&mut self) -> Result<ReadOutcome, BridgeError> {
        let stream = match &self.socket {
            SocketState::Established(stream) => stream,
            _ => return Ok(ReadOutcome::Frames(Vec::new())),
        };

        let mut buf = vec![0u8; self.read_buf_size];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                self.begin_close();
                Ok(ReadOutcome::Closed)
            }
            Ok(n) => {
                trace!("read {} bytes from {}", n, self.addr);
                self.inbound.extend_from_slice(&buf[..n]);

                let mut frames = Vec::new();
                loop {
                    match frame::try_take_frame(&mut self.inbound, self.max_frame_size) {
                        Ok(Some(f)) => frames.push(f),
                        Ok(None) => break,
                        Err(e) => {
                            self.begin_close();
                            return Err(e);
                        }
                    }
                }
                Ok(ReadOutcome::Frames(frames))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadOutcome::Frames(Vec::new())),
            Err(e) => {
                warn!("read from {} failed: {}", self.addr, e);
                self.begin_close();
                Err(BridgeError::PeerClosed { addr: self.addr })
            }
        }
    }

    /// One non-blocking write step: send as much of the queue's head as the transport
    ///  accepts and remove exactly the sent prefix, in order. Returns true once the
    ///  queue is drained, so the caller can clear write interest.
    pub fn on_writable(&mut self) -> Result<bool, BridgeError> {
        let stream = match &self.socket {
            SocketState::Established(stream) => stream,
            _ => return Ok(!self.wants_write()),
        };
        if self.outbound.is_empty() {
            return Ok(true);
        }

        match stream.try_write(&self.outbound) {
            Ok(n) => {
                trace!("wrote {} of {} queued bytes to {}", n, self.outbound.len(), self.addr);
                self.outbound.advance(n);
                Ok(self.outbound.is_empty())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => {
                warn!("write to {} failed, discarding {} queued bytes: {}", self.addr, self.outbound.len(), e);
                self.outbound.clear();
                self.begin_close();
                Err(BridgeError::PeerClosed { addr: self.addr })
            }
        }
    }

    fn begin_close(&mut self) {
        if let SocketState::Established(stream) = std::mem::replace(&mut self.socket, SocketState::Closed) {
            self.socket = SocketState::Closing(stream);
        }
    }

    /// Releases the socket and discards buffered data. Queued outbound bytes are lost -
    ///  delivery is not guaranteed across a close.
    pub fn close(&mut self) {
        self.socket = SocketState::Closed;
        self.inbound.clear();
        self.outbound.clear();
    }
}
