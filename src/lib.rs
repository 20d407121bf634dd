//! A bridge between an OSC-over-UDP control plane and persistent TCP connections to
//!  remote peers.
//!
//! A controller (e.g. a Max/MSP patch) talks OSC over UDP because that is cheap and
//!  low-latency, but the devices it controls need a reliable transport. This crate sits
//!  in between:
//!
//! * The controller sends a *route command* to the bridge's UDP port: an OSC message on
//!   a reserved path (`/tcp` by default) whose arguments name a destination peer and an
//!   embedded message: `[dest_addr: s, dest_port: i, msg_path: s, args...]`. The bridge
//!   establishes or reuses a TCP connection to that peer and forwards the encoded
//!   message.
//! * Bytes arriving on any peer TCP connection are decoded as OSC messages and re-sent
//!   over UDP to a single configured controller destination.
//!
//! ## Design
//!
//! All TCP connection state is owned by a single task running a readiness-driven loop
//!  ([bridge::Bridge]): a [mux::Multiplexer] blocks until the listening socket or one of
//!  the peer sockets can make progress and returns tagged events that the loop dispatches
//!  by explicit case analysis. Per-peer buffered read/write state lives in
//!  [peer::PeerConnection], the address-keyed registry of live connections in
//!  [registry::ConnectionRegistry].
//!
//! The UDP receive path runs as its own task so that neither side can stall the other;
//!  it hands commands to the bridge loop through an mpsc channel rather than touching
//!  connection state directly.
//!
//! ## Wire format
//!
//! Both transports carry OSC 1.0 messages ([codec]). UDP datagrams hold one message
//!  each. On TCP, where the transport provides no message boundaries, each message is
//!  preceded by its length as a u32 in network byte order ([frame]).

pub mod bridge;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod mux;
pub mod peer;
pub mod registry;
pub mod router;
pub mod udp;
