//! Listening sockets: per-port state, the listener side of the open
//! handshake and the accept handle.

use std::collections::{HashMap, VecDeque};

use tokio_util::sync::CancellationToken;

use crate::cluster::Endpoint;
use crate::error::{SimulationError, SimulationResult};
use crate::sim::timer::{PromiseHandle, SimPromise};
use crate::sim::{SchedulerId, SimWorld, WeakWorld};

use super::conn::{ConnState, SimConn, HANDSHAKE_TIMEOUT};
use super::packet::{Packet, PacketFlags};

/// State behind one bound port, stored in the machine's socket table.
pub(crate) struct SocketState {
    endpoint: Endpoint,
    scheduler: SchedulerId,
    token: CancellationToken,
    pub(crate) connections: HashMap<Endpoint, ConnState>,
    incoming: VecDeque<Endpoint>,
    accept_waiter: Option<PromiseHandle<Endpoint>>,
}

impl SocketState {
    pub(crate) fn new(endpoint: Endpoint, scheduler: SchedulerId, token: CancellationToken) -> Self {
        Self {
            endpoint,
            scheduler,
            token,
            connections: HashMap::new(),
            incoming: VecDeque::new(),
            accept_waiter: None,
        }
    }

    /// Routes an arriving packet to its connection, or reacts to an open
    /// request from an unknown peer. Anything else from an unknown peer is
    /// dropped.
    pub(crate) fn deliver(&mut self, world: &SimWorld, packet: Packet) {
        if let Some(conn) = self.connections.get_mut(&packet.source) {
            conn.deliver(packet);
            return;
        }
        if !packet.flags.contains(PacketFlags::SYN) {
            tracing::debug!(socket = %self.endpoint, %packet, "no connection, dropping");
            return;
        }
        let remote = packet.source.clone();
        self.connections.insert(
            remote.clone(),
            ConnState::accepting(self.endpoint.clone(), remote.clone(), &packet),
        );
        // The rest of the handshake runs as the socket owner.
        let conn = SimConn {
            world: world.downgrade(),
            local: self.endpoint.clone(),
            remote: remote.clone(),
            scheduler: self.scheduler,
            token: self.token.clone(),
        };
        let local = self.endpoint.clone();
        world.spawn(self.scheduler, async move {
            if let Err(error) = listener_handshake(conn, local, remote).await {
                tracing::debug!(%error, "listener handshake failed");
            }
        });
    }

    fn next_incoming(&mut self) -> Option<Endpoint> {
        self.incoming.pop_front()
    }
}

/// Replies to an open request and waits for the final acknowledgement; on
/// success the connection becomes acceptable, otherwise it is reset and
/// forgotten.
async fn listener_handshake(
    conn: SimConn,
    local: Endpoint,
    remote: Endpoint,
) -> SimulationResult<()> {
    conn.send_flags(PacketFlags::SYN | PacketFlags::ACK)?;
    let reply = conn.read_packet(Some(HANDSHAKE_TIMEOUT)).await;
    let world = conn.world.upgrade()?;
    let cluster = world.cluster()?;
    match reply {
        Ok(Some(packet)) if packet.flags == PacketFlags::ACK => {
            cluster.with_socket(&local, |socket| {
                if let Some(waiter) = socket.accept_waiter.take() {
                    waiter.set_result(remote.clone());
                } else {
                    socket.incoming.push_back(remote.clone());
                }
            })?;
            Ok(())
        }
        other => {
            let _ = conn.send_flags(PacketFlags::RESET);
            let _ = cluster.with_socket(&local, |socket| {
                socket.connections.remove(&remote);
            });
            match other {
                Err(error) => Err(error),
                Ok(_) => Err(SimulationError::HandshakeFailed(
                    "expected final ACK".into(),
                )),
            }
        }
    }
}

enum AcceptStep {
    Ready(Endpoint),
    Busy,
    Wait(SimPromise<Endpoint>),
}

/// A bound listening socket.
///
/// Like [`SimConn`], the handle holds only its endpoint key; releasing the
/// owning process removes the underlying state and fails later calls.
pub struct SimSocket {
    pub(crate) world: WeakWorld,
    pub(crate) endpoint: Endpoint,
    pub(crate) scheduler: SchedulerId,
    pub(crate) token: CancellationToken,
}

impl SimSocket {
    /// The bound endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Waits for the next fully established inbound connection. At most one
    /// accept may wait at a time.
    pub async fn accept(&self) -> SimulationResult<SimConn> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        let step = cluster.with_socket(&self.endpoint, |socket| {
            if let Some(remote) = socket.next_incoming() {
                return AcceptStep::Ready(remote);
            }
            if socket.accept_waiter.is_some() {
                return AcceptStep::Busy;
            }
            let (handle, promise) =
                world.promise_on(self.scheduler, None, Some(self.token.clone()));
            socket.accept_waiter = Some(handle);
            AcceptStep::Wait(promise)
        })?;
        let remote = match step {
            AcceptStep::Ready(remote) => remote,
            AcceptStep::Busy => {
                return Err(SimulationError::InvalidState(
                    "concurrent accept on one socket".into(),
                ))
            }
            AcceptStep::Wait(promise) => match promise.await {
                Ok(remote) => remote,
                Err(error) => {
                    let _ = cluster.with_socket(&self.endpoint, |socket| {
                        socket.accept_waiter = None;
                    });
                    return Err(error);
                }
            },
        };
        Ok(SimConn {
            world: self.world.clone(),
            local: self.endpoint.clone(),
            remote,
            scheduler: self.scheduler,
            token: self.token.clone(),
        })
    }
}
