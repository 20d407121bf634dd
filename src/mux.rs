//! The readiness multiplexer: blocks until the listening socket or one of the watched
//!  peer sockets can make progress, and reports what happened as tagged events. The
//!  surrounding loop dispatches them by explicit case analysis - there are no
//!  per-connection callbacks.
//!
//! Watch entries are keyed by the peer address, the same key the registry uses, so an
//!  event's tag directly recovers the owning connection.

use crate::error::BridgeError;
use crate::peer::PeerState;
use crate::registry::ConnectionRegistry;
use rustc_hash::FxHashMap;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, trace, warn};

#[derive(Debug, Clone, Copy)]
struct Interest {
    read: bool,
    write: bool,
}

/// One readiness event. `Accepted` carries the new socket; everything else carries the
///  registry key of the connection it concerns.
#[derive(Debug)]
pub enum MuxEvent {
    Accepted { stream: TcpStream, addr: SocketAddr },
    DialCompleted { addr: SocketAddr },
    DialFailed { addr: SocketAddr, error: std::io::Error },
    Readable { addr: SocketAddr },
    Writable { addr: SocketAddr },
}

pub struct Multiplexer {
    listener: TcpListener,
    interests: FxHashMap<SocketAddr, Interest>,
}

impl Multiplexer {
    /// Binds the listening socket. Failure here is fatal - the bridge must not run
    ///  half-initialized.
    pub async fn bind(addr: SocketAddr) -> Result<Multiplexer, BridgeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;
        match listener.local_addr() {
            Ok(local) => info!("listening for peer connections on {}", local),
            Err(source) => return Err(BridgeError::Bind { addr, source }),
        }

        Ok(Multiplexer {
            listener,
            interests: FxHashMap::default(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Registers or updates interest for the connection keyed by `addr`. The listening
    ///  socket needs no registration - it is always watched.
    pub fn watch(&mut self, addr: SocketAddr, read: bool, write: bool) {
        self.interests.insert(addr, Interest { read, write });
    }

    /// Removes the watch entry for `addr`. Removing an entry that is already gone is a
    ///  no-op, not an error.
    pub fn unwatch(&mut self, addr: SocketAddr) {
        self.interests.remove(&addr);
    }

    /// Blocks until at least one watched socket is ready, and returns everything that is
    ///  ready right now. No timeout: with nothing ready there is nothing useful to do,
    ///  and the caller's select over the command channel provides the wakeup for
    ///  incoming commands.
    ///
    /// Pending dials of `Connecting` entries are driven here as well; their completion
    ///  or failure comes back as an event.
    pub async fn wait(&mut self, registry: &mut ConnectionRegistry) -> Vec<MuxEvent> {
        poll_fn(|cx| self.poll_events(cx, registry)).await
    }

    fn poll_events(
        &mut self,
        cx: &mut Context<'_>,
        registry: &mut ConnectionRegistry,
    ) -> Poll<Vec<MuxEvent>> {
        let mut events = Vec::new();

        loop {
            match self.listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, addr))) => {
                    events.push(MuxEvent::Accepted { stream, addr });
                }
                Poll::Ready(Err(e)) => {
                    warn!("accepting a connection failed: {}", e);
                    break;
                }
                Poll::Pending => break,
            }
        }

        let mut stale = Vec::new();
        for (&addr, interest) in &self.interests {
            let Some(conn) = registry.get_mut(&addr) else {
                stale.push(addr);
                continue;
            };

            match conn.state() {
                PeerState::Connecting => match conn.poll_dial(cx) {
                    Poll::Ready(Ok(())) => events.push(MuxEvent::DialCompleted { addr }),
                    Poll::Ready(Err(error)) => events.push(MuxEvent::DialFailed { addr, error }),
                    Poll::Pending => {}
                },
                PeerState::Established => {
                    if interest.read && conn.poll_read_ready(cx).is_ready() {
                        events.push(MuxEvent::Readable { addr });
                    }
                    if interest.write && conn.wants_write() && conn.poll_write_ready(cx).is_ready() {
                        events.push(MuxEvent::Writable { addr });
                    }
                }
                PeerState::Closing | PeerState::Closed => stale.push(addr),
            }
        }
        for addr in stale {
            trace!("dropping stale watch entry for {}", addr);
            self.interests.remove(&addr);
        }

        if events.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(events)
        }
    }
}
