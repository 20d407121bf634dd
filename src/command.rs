//! Parsing of route commands: OSC messages on the reserved routing path whose arguments
//!  name a destination peer and the message to deliver there.

use crate::codec::{OscArg, OscMessage};
use crate::error::BridgeError;
use std::net::{IpAddr, SocketAddr};

/// A validated instruction to forward `message` to the peer at `peer`.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteCommand {
    pub peer: SocketAddr,
    pub message: OscMessage,
}

impl RouteCommand {
    /// Extracts a route command from the argument list
    ///  `[dest_addr: s, dest_port: i, msg_path: s, args...]`. Fewer than three arguments,
    ///  a mistyped argument, an unparsable address or an out-of-range port are all
    ///  [BridgeError::Protocol] - the caller logs and drops the command without side
    ///  effects.
    pub fn try_from_osc(msg: &OscMessage) -> Result<RouteCommand, BridgeError> {
        if msg.args.len() < 3 {
            return Err(BridgeError::protocol(format!(
                "route command needs at least 3 arguments (dest_addr, dest_port, msg_path), got {}",
                msg.args.len()
            )));
        }

        let OscArg::Str(host) = &msg.args[0] else {
            return Err(BridgeError::protocol("destination address must be a string"));
        };
        let ip: IpAddr = host
            .parse()
            .map_err(|_| BridgeError::protocol(format!("unparsable destination address {:?}", host)))?;

        let OscArg::Int(port) = &msg.args[1] else {
            return Err(BridgeError::protocol("destination port must be an int"));
        };
        let port = u16::try_from(*port)
            .map_err(|_| BridgeError::protocol(format!("destination port {} out of range", port)))?;

        let OscArg::Str(path) = &msg.args[2] else {
            return Err(BridgeError::protocol("message path must be a string"));
        };
        if !path.starts_with('/') {
            return Err(BridgeError::protocol(format!(
                "message path {:?} is not a valid OSC address pattern",
                path
            )));
        }

        Ok(RouteCommand {
            peer: SocketAddr::new(ip, port),
            message: OscMessage::new(path.clone(), msg.args[3..].to_vec()),
        })
    }
}
