use std::net::SocketAddr;
use thiserror::Error;

/// The bridge's error taxonomy. Everything except [BridgeError::Bind] is recovered
///  locally: the offending command or connection is dropped with a log line, and nothing
///  is reported back to the UDP-side originator - commands are fire-and-forget.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An active connection attempt to a peer failed. The command that triggered the
    ///  dial is dropped; no registry entry remains, so the next command retries cleanly.
    #[error("failed to connect to peer {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Malformed input: an undecodable OSC payload, a route command with missing or
    ///  mistyped arguments, or a stream frame that violates the framing rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The remote closed the connection (zero-length read) or a read/write against it
    ///  failed. The connection is torn down and deregistered; queued outbound data is
    ///  discarded.
    #[error("peer {addr} closed the connection")]
    PeerClosed { addr: SocketAddr },

    /// A configured listen address could not be bound. Fatal at startup - the bridge
    ///  must not run half-initialized.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl BridgeError {
    pub fn protocol(msg: impl Into<String>) -> BridgeError {
        BridgeError::Protocol(msg.into())
    }
}
