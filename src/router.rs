//! The bridge router is the only component with protocol knowledge: it turns route
//!  commands into registry lookups and outbound writes, and inbound stream frames into
//!  messages for the controller.

use crate::codec::OscMessage;
use crate::command::RouteCommand;
use crate::mux::Multiplexer;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Where stream-origin messages go. All of them flow to the single configured
///  controller endpoint - no routing decision is needed on this path.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControllerSink: Send + Sync + 'static {
    async fn forward(&self, msg: OscMessage) -> anyhow::Result<()>;
}

pub struct BridgeRouter<S: ControllerSink> {
    sink: Arc<S>,
}

impl<S: ControllerSink> BridgeRouter<S> {
    pub fn new(sink: Arc<S>) -> BridgeRouter<S> {
        BridgeRouter { sink }
    }

    /// Handles one route command from the datagram side: look up or dial the peer
    ///  connection, encode the embedded message, queue it, and request write interest.
    ///  Command validation happened at parse time; a failing dial surfaces through the
    ///  multiplexer and drops the queued data with the connection.
    pub fn handle_command(
        &self,
        cmd: RouteCommand,
        registry: &mut ConnectionRegistry,
        mux: &mut Multiplexer,
    ) {
        debug!("routing {} to peer {}", cmd.message.path, cmd.peer);

        let conn = registry.get_or_connect(cmd.peer);
        conn.enqueue_message(&cmd.message.to_bytes());
        mux.watch(cmd.peer, true, conn.wants_write());
    }

    /// Handles one complete frame read from a peer connection: decode and forward to
    ///  the controller. An undecodable frame is logged and dropped; the connection
    ///  stays up.
    pub async fn handle_inbound(&self, from: SocketAddr, frame: Bytes) {
        match OscMessage::try_deser(&frame) {
            Ok(msg) => {
                trace!("forwarding {} from peer {} to controller", msg.path, from);
                if let Err(e) = self.sink.forward(msg).await {
                    warn!("forwarding message from {} to controller failed: {}", from, e);
                }
            }
            Err(e) => {
                warn!("dropping undecodable message from {}: {}", from, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::OscArg;
    use crate::config::BridgeConfig;
    use crate::peer::PeerState;

    fn test_fixture() -> (ConnectionRegistry, BridgeConfig) {
        let config = BridgeConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9999".parse().unwrap(),
        );
        (ConnectionRegistry::new(&config), config)
    }

    #[tokio::test]
    async fn test_command_dials_enqueues_and_requests_write_interest() {
        let (mut registry, config) = test_fixture();
        let mut mux = Multiplexer::bind(config.tcp_listen_addr).await.unwrap();
        let router = BridgeRouter::new(Arc::new(MockControllerSink::new()));

        let peer: SocketAddr = "127.0.0.1:7771".parse().unwrap();
        let cmd = RouteCommand {
            peer,
            message: OscMessage::new("/led", vec![OscArg::Int(1)]),
        };
        router.handle_command(cmd, &mut registry, &mut mux);

        let conn = registry.get_mut(&peer).unwrap();
        assert_eq!(conn.state(), PeerState::Connecting);
        assert!(conn.wants_write());
    }

    #[tokio::test]
    async fn test_inbound_frame_is_decoded_and_forwarded() {
        let mut sink = MockControllerSink::new();
        sink.expect_forward()
            .withf(|msg| msg.path == "/status" && msg.args == vec![OscArg::Str("ok".to_string())])
            .times(1)
            .returning(|_| Ok(()));
        let router = BridgeRouter::new(Arc::new(sink));

        let frame = OscMessage::new("/status", vec![OscArg::Str("ok".to_string())])
            .to_bytes()
            .freeze();
        router.handle_inbound("10.0.0.5:7771".parse().unwrap(), frame).await;
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped_not_forwarded() {
        let mut sink = MockControllerSink::new();
        sink.expect_forward().times(0);
        let router = BridgeRouter::new(Arc::new(sink));

        router
            .handle_inbound("10.0.0.5:7771".parse().unwrap(), Bytes::from_static(b"garbage"))
            .await;
    }
}
