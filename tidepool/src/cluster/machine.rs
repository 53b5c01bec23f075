//! Machines: socket tables, ephemeral ports, installed services and local
//! storage.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    rc::Rc,
};

use crate::error::{SimulationError, SimulationResult};
use crate::network::{ConnState, PacketFlags, SimConn, SimSocket, SocketState, HANDSHAKE_TIMEOUT};
use crate::network::Packet;
use crate::process::{ProcState, SimService};
use crate::sim::SimWorld;
use crate::storage::{StorageData, StorageHandle};

use super::id::{zone_of, Endpoint, RouteId};
use super::topology::SimCluster;

/// First port handed out to outgoing connections; lower ports are for
/// listeners.
const EPHEMERAL_BASE: u16 = 10_000;

/// One machine: a set of installed services sharing a socket table and
/// named local storages.
pub struct SimMachine {
    name: String,
    services: BTreeMap<String, SimService>,
    sockets: RefCell<HashMap<u16, SocketState>>,
    stores: RefCell<BTreeMap<String, StorageData>>,
}

impl SimMachine {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            services: BTreeMap::new(),
            sockets: RefCell::new(HashMap::new()),
            stores: RefCell::new(BTreeMap::new()),
        }
    }

    pub(crate) fn install(&mut self, service: SimService) {
        self.services
            .insert(service.id().service().to_string(), service);
    }

    pub(crate) fn services(&self) -> impl Iterator<Item = &SimService> {
        self.services.values()
    }

    /// Opens a connection from a process on this machine. Checks the route
    /// up front, then runs the three-step handshake.
    pub(crate) async fn connect(
        &self,
        world: &SimWorld,
        cluster: &Rc<SimCluster>,
        proc: &Rc<ProcState>,
        destination: Endpoint,
    ) -> SimulationResult<SimConn> {
        let route = RouteId::between_machines(&self.name, &destination.machine);
        if !cluster.has_route(&route) {
            return Err(SimulationError::RouteNotFound {
                from: zone_of(&self.name).to_string(),
                to: destination.zone().to_string(),
            });
        }
        let port = self.allocate_port()?;
        let local = Endpoint::new(self.name.clone(), port);
        {
            let mut sockets = self.sockets.borrow_mut();
            let mut socket =
                SocketState::new(local.clone(), proc.scheduler, proc.token.clone());
            socket
                .connections
                .insert(destination.clone(), ConnState::new(local.clone(), destination.clone()));
            sockets.insert(port, socket);
        }
        proc.track_socket(port);

        let conn = SimConn {
            world: world.downgrade(),
            local,
            remote: destination,
            scheduler: proc.scheduler,
            token: proc.token.clone(),
        };
        conn.send_flags(PacketFlags::SYN)?;
        match conn.read_packet(Some(HANDSHAKE_TIMEOUT)).await {
            Ok(Some(reply)) if reply.flags == (PacketFlags::SYN | PacketFlags::ACK) => {
                conn.send_flags(PacketFlags::ACK)?;
                tracing::trace!(conn = %conn.local(), remote = %conn.remote(), "connected");
                Ok(conn)
            }
            Ok(Some(_)) => {
                let _ = conn.send_flags(PacketFlags::RESET);
                self.drop_socket(port, proc);
                Err(SimulationError::HandshakeFailed(
                    "unexpected reply to open request".into(),
                ))
            }
            Ok(None) => {
                self.drop_socket(port, proc);
                Err(SimulationError::HandshakeFailed(
                    "stream ended during handshake".into(),
                ))
            }
            Err(SimulationError::ConnectionReset) => {
                self.drop_socket(port, proc);
                Err(SimulationError::ConnectionRefused)
            }
            Err(error) => {
                let _ = conn.send_flags(PacketFlags::RESET);
                self.drop_socket(port, proc);
                Err(error)
            }
        }
    }

    /// Binds a listener on a well-known port.
    pub(crate) fn bind(
        &self,
        world: &SimWorld,
        proc: &Rc<ProcState>,
        port: u16,
    ) -> SimulationResult<SimSocket> {
        let endpoint = Endpoint::new(self.name.clone(), port);
        {
            let mut sockets = self.sockets.borrow_mut();
            if sockets.contains_key(&port) {
                return Err(SimulationError::AddressInUse(endpoint.to_string()));
            }
            sockets.insert(
                port,
                SocketState::new(endpoint.clone(), proc.scheduler, proc.token.clone()),
            );
        }
        proc.track_socket(port);
        tracing::debug!(socket = %endpoint, service = %proc.id, "bound");
        Ok(SimSocket {
            world: world.downgrade(),
            endpoint,
            scheduler: proc.scheduler,
            token: proc.token.clone(),
        })
    }

    /// Hands an arriving packet to its socket. Returns the packet when
    /// nothing listens on the port.
    pub(crate) fn try_deliver(&self, world: &SimWorld, packet: Packet) -> Option<Packet> {
        let mut sockets = self.sockets.borrow_mut();
        match sockets.get_mut(&packet.destination.port) {
            Some(socket) => {
                socket.deliver(world, packet);
                None
            }
            None => Some(packet),
        }
    }

    pub(crate) fn with_socket<R>(
        &self,
        port: u16,
        f: impl FnOnce(&mut SocketState) -> R,
    ) -> SimulationResult<R> {
        let mut sockets = self.sockets.borrow_mut();
        let socket = sockets
            .get_mut(&port)
            .ok_or(SimulationError::ConnectionReset)?;
        Ok(f(socket))
    }

    pub(crate) fn with_conn<R>(
        &self,
        port: u16,
        remote: &Endpoint,
        f: impl FnOnce(&mut ConnState) -> R,
    ) -> SimulationResult<R> {
        let mut sockets = self.sockets.borrow_mut();
        let socket = sockets
            .get_mut(&port)
            .ok_or(SimulationError::ConnectionReset)?;
        let conn = socket
            .connections
            .get_mut(remote)
            .ok_or(SimulationError::ConnectionReset)?;
        Ok(f(conn))
    }

    pub(crate) fn release_socket(&self, port: u16) {
        if self.sockets.borrow_mut().remove(&port).is_some() {
            tracing::debug!(machine = %self.name, port, "socket released");
        }
    }

    /// Releases every installed service's running instance; used at the end
    /// of a run.
    pub(crate) fn release_services(&self) {
        for service in self.services.values() {
            if let Some(proc) = service.take_running() {
                proc.release(self);
            }
        }
    }

    pub(crate) fn release_service(&self, service_name: &str) {
        if let Some(service) = self.services.get(service_name) {
            if let Some(proc) = service.take_running() {
                proc.release(self);
            }
        }
    }

    /// Opens (or reopens) a named storage; contents survive process
    /// restarts until wiped.
    pub(crate) fn open_storage(&self, proc: &Rc<ProcState>, name: &str) -> StorageHandle {
        let data = self
            .stores
            .borrow_mut()
            .entry(name.to_lowercase())
            .or_default()
            .clone();
        let handle = StorageHandle::new(&self.name, name, data);
        proc.track_resource(Box::new(handle.clone()));
        handle
    }

    /// Clears every storage in place; open handles observe the loss.
    pub(crate) fn wipe_storage(&self) {
        for data in self.stores.borrow().values() {
            data.borrow_mut().clear();
        }
        tracing::info!(machine = %self.name, "storage wiped");
    }

    fn allocate_port(&self) -> SimulationResult<u16> {
        let sockets = self.sockets.borrow();
        let mut port = EPHEMERAL_BASE;
        loop {
            if !sockets.contains_key(&port) {
                return Ok(port);
            }
            port = port
                .checked_add(1)
                .ok_or_else(|| SimulationError::NoFreePorts(self.name.clone()))?;
        }
    }

    fn drop_socket(&self, port: u16, proc: &Rc<ProcState>) {
        self.sockets.borrow_mut().remove(&port);
        proc.untrack_socket(port);
    }
}
