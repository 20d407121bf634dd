//! The datagram side: receives route commands from the controller and sends translated
//!  peer messages back to it. The receive loop runs as its own task and hands commands
//!  to the bridge loop over a channel - it never touches connection state directly.

use crate::bridge::BridgeCommand;
use crate::codec::OscMessage;
use crate::command::RouteCommand;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::router::ControllerSink;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct UdpEndpoint {
    recv_socket: UdpSocket,
    send_socket: UdpSocket,
    controller_addr: SocketAddr,
    route_path: String,
}

impl UdpEndpoint {
    pub async fn bind(config: &BridgeConfig) -> anyhow::Result<UdpEndpoint> {
        let recv_socket = UdpSocket::bind(config.udp_listen_addr)
            .await
            .map_err(|source| BridgeError::Bind { addr: config.udp_listen_addr, source })?;
        info!("listening for controller commands on {}", recv_socket.local_addr()?);

        let send_any = if config.controller_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let send_socket = UdpSocket::bind(send_any).await?;
        // the controller destination may be a broadcast address
        send_socket.set_broadcast(true)?;
        info!("forwarding peer messages to controller at {}", config.controller_addr);

        Ok(UdpEndpoint {
            recv_socket,
            send_socket,
            controller_addr: config.controller_addr,
            route_path: config.route_path.clone(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.recv_socket.local_addr()?)
    }

    /// Receives datagrams until the bridge side goes away. Commands are fire-and-forget
    ///  for the controller: anything malformed is logged and dropped here, with no
    ///  reply and no side effects.
    pub async fn recv_loop(&self, commands: mpsc::Sender<BridgeCommand>) {
        let mut buf = [0u8; 1500];
        loop {
            let (num_read, from) = match self.recv_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let msg = match OscMessage::try_deser(&buf[..num_read]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("received undecodable datagram from {}, dropping: {}", from, e);
                    continue;
                }
            };

            if msg.path != self.route_path {
                debug!("ignoring message on unhandled path {} from {}", msg.path, from);
                continue;
            }

            let cmd = match RouteCommand::try_from_osc(&msg) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(
                        "invalid route command from {}: {} - usage: {} [dest_addr] [dest_port] [/path] [args...]",
                        from, e, self.route_path
                    );
                    continue;
                }
            };

            if commands.send(BridgeCommand::Route(cmd)).await.is_err() {
                debug!("bridge loop is gone, stopping the receive loop");
                return;
            }
        }
    }
}

#[async_trait]
impl ControllerSink for UdpEndpoint {
    async fn forward(&self, msg: OscMessage) -> anyhow::Result<()> {
        self.send_socket.send_to(&msg.to_bytes(), self.controller_addr).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::OscArg;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    async fn test_endpoint() -> (Arc<UdpEndpoint>, UdpSocket) {
        let controller = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut config = BridgeConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            controller.local_addr().unwrap(),
        );
        config.route_path = "/tcp".to_string();

        (Arc::new(UdpEndpoint::bind(&config).await.unwrap()), controller)
    }

    #[tokio::test]
    async fn test_route_command_crosses_to_the_bridge_channel() {
        let (endpoint, controller) = test_endpoint().await;
        let endpoint_addr = endpoint.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let loop_endpoint = endpoint.clone();
        tokio::spawn(async move { loop_endpoint.recv_loop(tx).await });

        // garbage and malformed commands first - they must all be dropped
        controller.send_to(b"not osc at all", endpoint_addr).await.unwrap();
        controller
            .send_to(&OscMessage::new("/other", vec![]).to_bytes(), endpoint_addr)
            .await
            .unwrap();
        controller
            .send_to(
                &OscMessage::new("/tcp", vec![OscArg::Str("10.0.0.5".to_string())]).to_bytes(),
                endpoint_addr,
            )
            .await
            .unwrap();

        let valid = OscMessage::new(
            "/tcp",
            vec![
                OscArg::Str("10.0.0.5".to_string()),
                OscArg::Int(7771),
                OscArg::Str("/led".to_string()),
                OscArg::Int(1),
            ],
        );
        controller.send_to(&valid.to_bytes(), endpoint_addr).await.unwrap();

        let cmd = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let BridgeCommand::Route(cmd) = cmd else {
            panic!("expected a route command");
        };
        assert_eq!(cmd.peer, "10.0.0.5:7771".parse().unwrap());
        assert_eq!(cmd.message, OscMessage::new("/led", vec![OscArg::Int(1)]));

        // the dropped datagrams produced nothing
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_forward_sends_to_the_controller_destination() {
        let (endpoint, controller) = test_endpoint().await;

        let msg = OscMessage::new("/status", vec![OscArg::Str("ok".to_string())]);
        endpoint.forward(msg.clone()).await.unwrap();

        let mut buf = [0u8; 1500];
        let (num_read, _) = timeout(Duration::from_secs(5), controller.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(OscMessage::try_deser(&buf[..num_read]).unwrap(), msg);
    }
}
