//! Simulated networking: packets, routes with latency and loss, sockets and
//! reliable in-order connections on top of an unreliable fabric.

mod config;
mod conn;
mod packet;
mod route;
mod socket;

pub use config::{profiles, RouteConfig};
pub use conn::SimConn;
pub use packet::{Packet, PacketFlags, Payload};
pub use socket::SimSocket;

pub(crate) use conn::{ConnState, HANDSHAKE_TIMEOUT};
pub(crate) use route::SimRoute;
pub(crate) use socket::SocketState;
