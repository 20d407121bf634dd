use anyhow::bail;
use std::net::SocketAddr;

/// Configuration for a bridge instance. Addresses and ports are always explicit inputs,
///  never hardcoded.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the TCP listening socket binds to. Peers connect here.
    pub tcp_listen_addr: SocketAddr,

    /// Address the UDP socket binds to. The controller sends route commands here.
    pub udp_listen_addr: SocketAddr,

    /// Fixed destination for all messages arriving on peer TCP connections. There is no
    ///  routing decision on that path - everything goes to this one controller endpoint.
    pub controller_addr: SocketAddr,

    /// The reserved OSC path that marks a datagram as a route command. Messages on any
    ///  other path are ignored.
    pub route_path: String,

    /// Upper bound for a single non-blocking read from a peer socket.
    pub read_buf_size: usize,

    /// Maximum accepted length of a single framed message on a TCP connection. A peer
    ///  announcing a longer frame is considered compromised and disconnected.
    pub max_frame_size: usize,
}

impl BridgeConfig {
    pub fn new(
        tcp_listen_addr: SocketAddr,
        udp_listen_addr: SocketAddr,
        controller_addr: SocketAddr,
    ) -> BridgeConfig {
        BridgeConfig {
            tcp_listen_addr,
            udp_listen_addr,
            controller_addr,
            route_path: "/tcp".to_string(),
            read_buf_size: 1024,
            max_frame_size: 16 * 1024 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.route_path.starts_with('/') {
            bail!("route path {:?} is not a valid OSC address pattern", self.route_path);
        }
        if self.read_buf_size == 0 {
            bail!("read buffer size must be greater than zero");
        }
        if self.max_frame_size < 8 {
            bail!("max frame size {} is too small to hold any OSC message", self.max_frame_size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn test_config() -> BridgeConfig {
        BridgeConfig::new(
            "127.0.0.1:7771".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
            "127.0.0.1:7772".parse().unwrap(),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(test_config().validate().is_ok());
    }

    #[rstest]
    #[case::path_without_slash("tcp")]
    #[case::empty_path("")]
    fn test_invalid_route_path(#[case] path: &str) {
        let mut config = test_config();
        config.route_path = path.to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_read_buf_rejected() {
        let mut config = test_config();
        config.read_buf_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_max_frame_rejected() {
        let mut config = test_config();
        config.max_frame_size = 4;
        assert!(config.validate().is_err());
    }
}
