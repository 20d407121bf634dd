//! The address-keyed registry of live peer connections. Owned by the bridge loop and
//!  passed explicitly to whoever needs it - there is no global state.
//!
//! Connections are keyed by the full socket address (host and port). Keying by host
//!  alone would silently conflate peers sharing an address, or let one peer evict
//!  another's connection.

use crate::config::BridgeConfig;
use crate::peer::PeerConnection;
#[cfg(test)] use crate::peer::PeerState;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use tracing::debug;
use tokio::net::TcpStream;

pub struct ConnectionRegistry {
    entries: FxHashMap<SocketAddr, PeerConnection>,
    read_buf_size: usize,
    max_frame_size: usize,
}

impl ConnectionRegistry {
    pub fn new(config: &BridgeConfig) -> ConnectionRegistry {
        ConnectionRegistry {
            entries: FxHashMap::default(),
            read_buf_size: config.read_buf_size,
            max_frame_size: config.max_frame_size,
        }
    }

    /// Returns the existing connection for `addr`, or starts a non-blocking dial and
    ///  inserts the new connection as `Connecting`. Repeated calls before the dial
    ///  completes all land on the same entry, so a burst of commands to one destination
    ///  produces exactly one connection. Dial failure surfaces later through the
    ///  multiplexer, at which point the entry is removed and a subsequent call retries
    ///  cleanly.
    pub fn get_or_connect(&mut self, addr: SocketAddr) -> &mut PeerConnection {
        match self.entries.entry(addr) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                debug!("dialing new connection to {}", addr);
                e.insert(PeerConnection::connect(addr, self.read_buf_size, self.max_frame_size))
            }
        }
    }

    /// Inserts a passively accepted connection as `Established`. If an entry for `addr`
    ///  already exists, the new connection replaces it and the superseded one is
    ///  returned - the caller must close it.
    pub fn register_accepted(
        &mut self,
        addr: SocketAddr,
        stream: TcpStream,
    ) -> Option<PeerConnection> {
        let conn = PeerConnection::from_accepted(addr, stream, self.read_buf_size, self.max_frame_size);
        self.entries.insert(addr, conn)
    }

    /// Deletes the entry for `addr`, dropping the connection and releasing its socket.
    ///  Idempotent.
    pub fn remove(&mut self, addr: SocketAddr) -> Option<PeerConnection> {
        self.entries.remove(&addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerConnection> {
        self.entries.get_mut(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every connection, for shutdown. The caller closes them; buffered
    ///  outbound data is discarded without guarantee of delivery.
    pub fn drain(&mut self) -> Vec<(SocketAddr, PeerConnection)> {
        self.entries.drain().collect()
    }

    /// Invariant check: no stored connection is ever `Closed`.
    #[cfg(test)]
    fn assert_no_closed_entries(&self) {
        for (addr, conn) in &self.entries {
            assert_ne!(conn.state(), PeerState::Closed, "closed connection left in registry for {}", addr);
        }
    }
}
