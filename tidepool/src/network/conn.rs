//! Connections: sequence/acknowledgement tracking, in-order delivery and
//! the read/write handle.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::cluster::Endpoint;
use crate::error::{SimulationError, SimulationResult};
use crate::sim::timer::{PromiseHandle, SimPromise};
use crate::sim::{SchedulerId, WeakWorld};

use super::packet::{Packet, PacketFlags, Payload};

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Peer finished the stream gracefully.
    Fin,
    /// Peer reset the connection.
    Reset,
    /// Closed on this side.
    Local,
}

/// Per-connection bookkeeping stored inside the owning socket.
///
/// `seq` is the next outgoing sequence number; `ack` the next incoming one
/// expected. A packet arriving ahead of `ack` parks in the reorder buffer
/// and is handed out once the gap fills.
pub(crate) struct ConnState {
    local: Endpoint,
    remote: Endpoint,
    seq: u32,
    ack: u32,
    pub(crate) closed: Option<CloseReason>,
    read_buffer: VecDeque<Packet>,
    out_of_order: BTreeMap<u32, Packet>,
    pub(crate) pending_read: Option<PromiseHandle<Packet>>,
}

impl ConnState {
    pub(crate) fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self {
            local,
            remote,
            seq: 0,
            ack: 0,
            closed: None,
            read_buffer: VecDeque::new(),
            out_of_order: BTreeMap::new(),
            pending_read: None,
        }
    }

    /// A listener-side connection created from the opening packet: the next
    /// expected sequence follows the open request.
    pub(crate) fn accepting(local: Endpoint, remote: Endpoint, syn: &Packet) -> Self {
        let mut conn = Self::new(local, remote);
        conn.ack = syn.next_seq();
        conn
    }

    /// Stamps and consumes the next outgoing sequence number.
    pub(crate) fn next_packet(&mut self, flags: PacketFlags, payload: Option<Payload>) -> Packet {
        let packet = Packet {
            source: self.local.clone(),
            destination: self.remote.clone(),
            flags,
            seq: self.seq,
            ack: self.ack,
            payload,
        };
        self.seq = self.seq.wrapping_add(1);
        packet
    }

    /// Accepts an incoming packet, reordering as needed.
    pub(crate) fn deliver(&mut self, packet: Packet) {
        if packet.seq != self.ack {
            tracing::trace!(conn = %self.local, %packet, expected = self.ack, "buffering out of order");
            self.out_of_order.insert(packet.seq, packet);
            return;
        }
        self.hand_out(packet);
        while let Some(next) = self.out_of_order.remove(&self.ack) {
            self.hand_out(next);
        }
    }

    fn hand_out(&mut self, packet: Packet) {
        self.ack = packet.next_seq();
        if let Some(reader) = self.pending_read.take() {
            reader.set_result(packet);
        } else {
            self.read_buffer.push_back(packet);
        }
    }

    pub(crate) fn pop_buffered(&mut self) -> Option<Packet> {
        self.read_buffer.pop_front()
    }
}

/// Duration a connect or listen handshake waits for the peer's reply.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum ReadStep {
    Ready(SimulationResult<Option<Packet>>),
    Wait(SimPromise<Packet>),
}

/// One end of an established (or establishing) connection.
///
/// The handle carries only endpoint keys; the state lives in the owning
/// socket's table, so a killed or released process invalidates every handle
/// at once.
pub struct SimConn {
    pub(crate) world: WeakWorld,
    pub(crate) local: Endpoint,
    pub(crate) remote: Endpoint,
    pub(crate) scheduler: SchedulerId,
    pub(crate) token: CancellationToken,
}

impl SimConn {
    /// Local endpoint of this end.
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    /// Remote endpoint.
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Sends a payload. Never waits: the packet is stamped with the next
    /// sequence number and handed to the route.
    pub fn write(&self, payload: Payload) -> SimulationResult<()> {
        self.send(PacketFlags::NONE, Some(payload))
    }

    pub(crate) fn send_flags(&self, flags: PacketFlags) -> SimulationResult<()> {
        self.send(flags, None)
    }

    fn send(&self, flags: PacketFlags, payload: Option<Payload>) -> SimulationResult<()> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        let packet = cluster.with_conn(&self.local, &self.remote, |conn| {
            if conn.closed.is_some() {
                return Err(SimulationError::ConnectionClosed);
            }
            Ok(conn.next_packet(flags, payload))
        })??;
        cluster.send_packet(&world, packet)
    }

    /// Reads the next payload in order. `Ok(None)` is end of stream, and
    /// stays so on every later read. A reset fails this and every later
    /// read with `ConnectionReset`.
    pub async fn read(&self, timeout: Option<Duration>) -> SimulationResult<Option<Payload>> {
        match self.read_packet(timeout).await? {
            Some(packet) => Ok(packet.payload),
            None => Ok(None),
        }
    }

    /// Packet-level read used by handshakes; `Ok(None)` is end of stream.
    pub(crate) async fn read_packet(
        &self,
        timeout: Option<Duration>,
    ) -> SimulationResult<Option<Packet>> {
        let world = self.world.upgrade()?;
        let cluster = world.cluster()?;
        let step = cluster.with_conn(&self.local, &self.remote, |conn| {
            match conn.closed {
                Some(CloseReason::Reset) => {
                    return ReadStep::Ready(Err(SimulationError::ConnectionReset))
                }
                Some(CloseReason::Fin) => return ReadStep::Ready(Ok(None)),
                Some(CloseReason::Local) => {
                    return ReadStep::Ready(Err(SimulationError::ConnectionClosed))
                }
                None => {}
            }
            if let Some(packet) = conn.pop_buffered() {
                return ReadStep::Ready(classify(conn, packet));
            }
            if conn.pending_read.is_some() {
                return ReadStep::Ready(Err(SimulationError::InvalidState(
                    "concurrent read on one connection".into(),
                )));
            }
            let (handle, promise) =
                world.promise_on(self.scheduler, timeout, Some(self.token.clone()));
            conn.pending_read = Some(handle);
            ReadStep::Wait(promise)
        })?;
        match step {
            ReadStep::Ready(result) => result,
            ReadStep::Wait(promise) => match promise.await {
                Ok(packet) => {
                    cluster.with_conn(&self.local, &self.remote, |conn| classify(conn, packet))?
                }
                Err(error) => {
                    // Unregister so the next read is not refused.
                    let _ = cluster.with_conn(&self.local, &self.remote, |conn| {
                        conn.pending_read = None;
                    });
                    Err(error)
                }
            },
        }
    }

    /// Closes this end. Sends a courtesy FIN when the connection is still
    /// open; never waits and never fails.
    pub fn dispose(&self) {
        let Ok(world) = self.world.upgrade() else {
            return;
        };
        let Ok(cluster) = world.cluster() else {
            return;
        };
        let fin = cluster
            .with_conn(&self.local, &self.remote, |conn| {
                if conn.closed.is_some() {
                    return None;
                }
                let packet = conn.next_packet(PacketFlags::FIN, None);
                conn.closed = Some(CloseReason::Local);
                Some(packet)
            })
            .ok()
            .flatten();
        if let Some(packet) = fin {
            if let Err(error) = cluster.send_packet(&world, packet) {
                tracing::debug!(%error, "courtesy FIN not sent");
            }
        }
    }
}

/// Resolves a handed-out packet against the stream state: resets and FINs
/// close the connection, data passes through.
fn classify(conn: &mut ConnState, packet: Packet) -> SimulationResult<Option<Packet>> {
    if packet.flags.contains(PacketFlags::RESET) {
        conn.closed = Some(CloseReason::Reset);
        return Err(SimulationError::ConnectionReset);
    }
    if packet.flags.contains(PacketFlags::FIN) {
        conn.closed = Some(CloseReason::Fin);
        return Ok(None);
    }
    Ok(Some(packet))
}
