//! The bridge event loop: a single task that owns the multiplexer, the connection
//!  registry and the router, and is the only place any of them is mutated. Each
//!  iteration drains the command channel or waits for socket readiness - whichever has
//!  something first - so commands handed over by the datagram task are never delayed
//!  behind an unbounded readiness wait.

use crate::command::RouteCommand;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::mux::{Multiplexer, MuxEvent};
use crate::peer::ReadOutcome;
use crate::registry::ConnectionRegistry;
use crate::router::{BridgeRouter, ControllerSink};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the datagram side (or an embedding application) can ask of the bridge loop.
///  Closing the channel shuts down as well.
#[derive(Debug)]
pub enum BridgeCommand {
    Route(RouteCommand),
    Shutdown,
}

pub struct Bridge<S: ControllerSink> {
    mux: Multiplexer,
    registry: ConnectionRegistry,
    router: BridgeRouter<S>,
}

impl<S: ControllerSink> Bridge<S> {
    /// Validates the configuration and binds the TCP listening socket. A bind failure
    ///  is fatal: it propagates instead of letting the bridge run half-initialized.
    pub async fn bind(config: &BridgeConfig, sink: Arc<S>) -> anyhow::Result<Bridge<S>> {
        config.validate()?;

        Ok(Bridge {
            mux: Multiplexer::bind(config.tcp_listen_addr).await?,
            registry: ConnectionRegistry::new(config),
            router: BridgeRouter::new(sink),
        })
    }

    /// The actual listen address, for configurations binding port 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.mux.local_addr()
    }

    /// Runs until a shutdown command arrives or the command channel closes. On the way
    ///  out every peer connection is closed and deregistered; buffered outbound data is
    ///  discarded.
    pub async fn run(mut self, mut commands: mpsc::Receiver<BridgeCommand>) {
        loop {
            tokio::select! {
                biased;

                cmd = commands.recv() => match cmd {
                    Some(BridgeCommand::Route(cmd)) => {
                        self.router.handle_command(cmd, &mut self.registry, &mut self.mux);
                    }
                    Some(BridgeCommand::Shutdown) | None => break,
                },
                events = self.mux.wait(&mut self.registry) => {
                    for event in events {
                        self.dispatch(event).await;
                    }
                }
            }
        }
        self.shutdown();
    }

    async fn dispatch(&mut self, event: MuxEvent) {
        match event {
            MuxEvent::Accepted { stream, addr } => {
                info!("accepted connection from {}", addr);
                if let Some(mut superseded) = self.registry.register_accepted(addr, stream) {
                    warn!("connection from {} supersedes an existing one, closing the old connection", addr);
                    superseded.close();
                }
                let wants_write = self
                    .registry
                    .get_mut(&addr)
                    .map(|conn| conn.wants_write())
                    .unwrap_or(false);
                self.mux.watch(addr, true, wants_write);
            }

            MuxEvent::DialCompleted { addr } => {
                info!("connected to peer {}", addr);
                if let Some(conn) = self.registry.get_mut(&addr) {
                    let wants_write = conn.wants_write();
                    self.mux.watch(addr, true, wants_write);
                }
            }

            MuxEvent::DialFailed { addr, error } => {
                warn!("{}", BridgeError::Connect { addr, source: error });
                self.teardown(addr);
            }

            MuxEvent::Readable { addr } => {
                let Some(conn) = self.registry.get_mut(&addr) else {
                    return;
                };
                match conn.on_readable() {
                    Ok(ReadOutcome::Frames(frames)) => {
                        for frame in frames {
                            self.router.handle_inbound(addr, frame).await;
                        }
                    }
                    Ok(ReadOutcome::Closed) => {
                        info!("{}", BridgeError::PeerClosed { addr });
                        self.teardown(addr);
                    }
                    Err(e) => {
                        warn!("closing connection to {}: {}", addr, e);
                        self.teardown(addr);
                    }
                }
            }

            MuxEvent::Writable { addr } => {
                let Some(conn) = self.registry.get_mut(&addr) else {
                    return;
                };
                match conn.on_writable() {
                    Ok(true) => self.mux.watch(addr, true, false),
                    Ok(false) => {}
                    Err(e) => {
                        warn!("closing connection to {}: {}", addr, e);
                        self.teardown(addr);
                    }
                }
            }
        }
    }

    /// Closing a connection and removing its registration is a single step - no watch
    ///  entry ever outlives its socket.
    fn teardown(&mut self, addr: SocketAddr) {
        self.mux.unwatch(addr);
        if let Some(mut conn) = self.registry.remove(addr) {
            conn.close();
        }
    }

    fn shutdown(&mut self) {
        info!("shutting down, closing {} peer connection(s)", self.registry.len());
        for (addr, mut conn) in self.registry.drain() {
            self.mux.unwatch(addr);
            conn.close();
            debug!("closed connection to {}", addr);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{OscArg, OscMessage};
    use crate::frame;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{timeout, Duration};

    struct CapturingSink(mpsc::UnboundedSender<OscMessage>);

    #[async_trait]
    impl ControllerSink for CapturingSink {
        async fn forward(&self, msg: OscMessage) -> anyhow::Result<()> {
            self.0.send(msg).map_err(|_| anyhow!("capture channel closed"))?;
            Ok(())
        }
    }

    struct TestBridge {
        addr: SocketAddr,
        commands: mpsc::Sender<BridgeCommand>,
        forwarded: mpsc::UnboundedReceiver<OscMessage>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start_bridge() -> TestBridge {
        let config = BridgeConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9999".parse().unwrap(),
        );
        let (sink_tx, forwarded) = mpsc::unbounded_channel();
        let bridge = Bridge::bind(&config, Arc::new(CapturingSink(sink_tx))).await.unwrap();
        let addr = bridge.local_addr().unwrap();

        let (commands, rx) = mpsc::channel(16);
        let handle = tokio::spawn(bridge.run(rx));

        TestBridge { addr, commands, forwarded, handle }
    }

    fn route(peer: SocketAddr, path: &str, args: Vec<OscArg>) -> BridgeCommand {
        BridgeCommand::Route(RouteCommand {
            peer,
            message: OscMessage::new(path, args),
        })
    }

    async fn write_message(stream: &mut TcpStream, msg: &OscMessage) {
        let mut buf = BytesMut::new();
        frame::put_frame(&mut buf, &msg.to_bytes());
        stream.write_all(&buf).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn read_message(stream: &mut TcpStream) -> OscMessage {
        let mut len_buf = [0u8; 4];
        timeout(Duration::from_secs(5), stream.read_exact(&mut len_buf)).await.unwrap().unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        timeout(Duration::from_secs(5), stream.read_exact(&mut payload)).await.unwrap().unwrap();
        OscMessage::try_deser(&payload).unwrap()
    }

    /// Scenarios A, B and C in one connection's lifetime: a peer connects and is
    ///  registered; its first message reaches the controller sink; a route command
    ///  addressed to the peer reuses the accepted connection instead of dialing.
    #[tokio::test]
    async fn test_accepted_connection_forwards_inbound_and_is_reused_for_routing() {
        let mut bridge = start_bridge().await;

        let mut peer = TcpStream::connect(bridge.addr).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        // scenario C - and proof that the accept was processed and registered
        let status = OscMessage::new("/status", vec![OscArg::Str("ok".to_string())]);
        write_message(&mut peer, &status).await;
        let forwarded = timeout(Duration::from_secs(5), bridge.forwarded.recv()).await.unwrap().unwrap();
        assert_eq!(forwarded, status);

        // scenario B: the command names the peer's address; nothing listens there, so
        // the message can only arrive over the accepted connection
        bridge
            .commands
            .send(route(peer_addr, "/led", vec![OscArg::Int(1)]))
            .await
            .unwrap();
        assert_eq!(read_message(&mut peer).await, OscMessage::new("/led", vec![OscArg::Int(1)]));
    }

    /// Two commands to the same destination before the dial completes produce exactly
    ///  one connection; after the peer disconnects, the next command dials fresh
    ///  (scenario D).
    #[tokio::test]
    async fn test_one_dial_per_destination_and_fresh_dial_after_disconnect() {
        let bridge = start_bridge().await;

        let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_listener.local_addr().unwrap();

        bridge.commands.send(route(peer_addr, "/led", vec![OscArg::Int(1)])).await.unwrap();
        bridge.commands.send(route(peer_addr, "/led", vec![OscArg::Int(0)])).await.unwrap();

        let (mut conn1, _) = timeout(Duration::from_secs(5), peer_listener.accept()).await.unwrap().unwrap();
        assert_eq!(read_message(&mut conn1).await, OscMessage::new("/led", vec![OscArg::Int(1)]));
        assert_eq!(read_message(&mut conn1).await, OscMessage::new("/led", vec![OscArg::Int(0)]));

        // no duplicate dial for the second command
        assert!(timeout(Duration::from_millis(200), peer_listener.accept()).await.is_err());

        // peer disconnects; the bridge must notice, drop the stale entry, and dial anew
        drop(conn1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        bridge.commands.send(route(peer_addr, "/led", vec![OscArg::Int(1)])).await.unwrap();

        let (mut conn2, _) = timeout(Duration::from_secs(5), peer_listener.accept()).await.unwrap().unwrap();
        assert_eq!(read_message(&mut conn2).await, OscMessage::new("/led", vec![OscArg::Int(1)]));
    }

    /// A command whose dial fails is dropped without leaving state behind; a later
    ///  command to the same address starts over and succeeds.
    #[tokio::test]
    async fn test_failed_dial_leaves_no_entry_and_the_next_command_retries() {
        let bridge = start_bridge().await;

        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = placeholder.local_addr().unwrap();
        drop(placeholder);

        bridge.commands.send(route(peer_addr, "/led", vec![OscArg::Int(1)])).await.unwrap();

        // the refused dial must not wedge the loop; give it time to process the failure
        tokio::time::sleep(Duration::from_millis(200)).await;

        let peer_listener = TcpListener::bind(peer_addr).await.unwrap();
        bridge.commands.send(route(peer_addr, "/on", vec![])).await.unwrap();

        let (mut conn, _) = timeout(Duration::from_secs(5), peer_listener.accept()).await.unwrap().unwrap();
        assert_eq!(read_message(&mut conn).await, OscMessage::new("/on", vec![]));
    }

    #[tokio::test]
    async fn test_shutdown_closes_peer_connections() {
        let mut bridge = start_bridge().await;

        let mut peer = TcpStream::connect(bridge.addr).await.unwrap();
        // make sure the accept is processed before shutting down: the ping coming back
        // out of the sink proves the connection is registered
        write_message(&mut peer, &OscMessage::new("/ping", vec![])).await;
        timeout(Duration::from_secs(5), bridge.forwarded.recv()).await.unwrap().unwrap();

        bridge.commands.send(BridgeCommand::Shutdown).await.unwrap();
        timeout(Duration::from_secs(5), bridge.handle).await.unwrap().unwrap();

        let mut buf = [0u8; 16];
        let num_read = timeout(Duration::from_secs(5), peer.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(num_read, 0, "peer socket not closed on shutdown");
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let first = start_bridge().await;

        let mut config = BridgeConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9999".parse().unwrap(),
        );
        config.tcp_listen_addr = first.addr;

        let (sink_tx, _forwarded) = mpsc::unbounded_channel();
        let result = Bridge::bind(&config, Arc::new(CapturingSink(sink_tx))).await;

        let err = result.err().expect("binding an occupied port must fail");
        assert!(matches!(err.downcast_ref::<BridgeError>(), Some(BridgeError::Bind { .. })));
    }
}
