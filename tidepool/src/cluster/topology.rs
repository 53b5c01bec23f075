//! The live cluster assembled for one run: machines, route actors, and
//! fleet-level start/stop.

use std::{collections::BTreeMap, rc::Rc, time::Duration};

use crate::error::{SimulationError, SimulationResult};
use crate::network::{ConnState, Packet, PacketFlags, SimRoute, SocketState};
use crate::process::StopPhase;
use crate::sim::{SchedulerId, SimWorld, WeakWorld};

use super::def::ClusterDef;
use super::id::{Endpoint, RouteId, ServiceId};
use super::machine::SimMachine;
use crate::process::SimService;

/// Live topology for one run. Rebuilt fresh by every `run`, so earlier runs
/// leave no state behind.
pub struct SimCluster {
    world: WeakWorld,
    machines: BTreeMap<String, SimMachine>,
    routes: BTreeMap<RouteId, SimRoute>,
}

impl SimCluster {
    /// Instantiates machines, installed services and route actors from a
    /// definition. Iteration is over sorted names, so scheduler identities
    /// are stable across runs.
    pub(crate) fn build(world: &SimWorld, def: &ClusterDef) -> Rc<Self> {
        let mut routes = BTreeMap::new();
        for (id, config) in &def.routes {
            let scheduler = world.create_scheduler(format!("network:{id}"));
            routes.insert(id.clone(), SimRoute::new(id.clone(), scheduler, config.clone()));
        }
        let mut machines: BTreeMap<String, SimMachine> = BTreeMap::new();
        for (id, _) in &def.services {
            machines
                .entry(id.machine().to_string())
                .or_insert_with(|| SimMachine::new(id.machine()));
        }
        for (id, factory) in &def.services {
            let service = SimService::new(world, id.clone(), Rc::clone(factory));
            if let Some(machine) = machines.get_mut(id.machine()) {
                machine.install(service);
            }
        }
        Rc::new(Self {
            world: world.downgrade(),
            machines,
            routes,
        })
    }

    pub(crate) fn machine(&self, name: &str) -> Option<&SimMachine> {
        self.machines.get(name)
    }

    pub(crate) fn has_route(&self, id: &RouteId) -> bool {
        self.routes.contains_key(id)
    }

    /// Hands a packet to the route between its endpoints' zones.
    pub(crate) fn send_packet(&self, world: &SimWorld, packet: Packet) -> SimulationResult<()> {
        let id = RouteId::between_machines(&packet.source.machine, &packet.destination.machine);
        let route = self
            .routes
            .get(&id)
            .ok_or_else(|| SimulationError::RouteNotFound {
                from: id.source().to_string(),
                to: id.destination().to_string(),
            })?;
        route.send(world, packet);
        Ok(())
    }

    /// Final delivery after latency. An undeliverable packet is answered
    /// with a reset, so the sender observes a refused connection.
    pub(crate) fn deliver(&self, world: &SimWorld, packet: Packet) {
        match self.machines.get(&packet.destination.machine) {
            Some(machine) => {
                if let Some(refused) = machine.try_deliver(world, packet) {
                    self.refuse(world, refused);
                }
            }
            None => {
                // Same answer as an unbound port, so a connect to a missing
                // machine is refused instead of timing out.
                tracing::debug!(%packet, "destination machine does not exist");
                self.refuse(world, packet);
            }
        }
    }

    fn refuse(&self, world: &SimWorld, packet: Packet) {
        // Never answer a reset with a reset.
        if packet.flags.contains(PacketFlags::RESET) {
            return;
        }
        tracing::debug!(%packet, "nothing listening, resetting");
        let reset = Packet {
            source: packet.destination.clone(),
            destination: packet.source.clone(),
            flags: PacketFlags::RESET,
            seq: packet.ack,
            ack: packet.next_seq(),
            payload: None,
        };
        if let Err(error) = self.send_packet(world, reset) {
            tracing::debug!(%error, "reset not sent");
        }
    }

    pub(crate) fn with_socket<R>(
        &self,
        endpoint: &Endpoint,
        f: impl FnOnce(&mut SocketState) -> R,
    ) -> SimulationResult<R> {
        self.machines
            .get(&endpoint.machine)
            .ok_or(SimulationError::ConnectionReset)?
            .with_socket(endpoint.port, f)
    }

    pub(crate) fn with_conn<R>(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        f: impl FnOnce(&mut ConnState) -> R,
    ) -> SimulationResult<R> {
        self.machines
            .get(&local.machine)
            .ok_or(SimulationError::ConnectionReset)?
            .with_conn(local.port, remote, f)
    }

    fn filter(&self, selector: &dyn Fn(&ServiceId) -> bool) -> Vec<&SimService> {
        self.machines
            .values()
            .flat_map(|machine| machine.services())
            .filter(|service| selector(service.id()))
            .collect()
    }

    /// Launches every matched service. A fault in any launched body halts
    /// the simulation.
    pub(crate) fn start_services(
        &self,
        world: &SimWorld,
        selector: &dyn Fn(&ServiceId) -> bool,
    ) -> SimulationResult<usize> {
        let matched = self.filter(selector);
        if matched.is_empty() {
            return Err(SimulationError::NoMatchingServices);
        }
        for service in &matched {
            let weak = self.world.clone();
            let id = service.id().clone();
            service.launch(world, move |fault| {
                if let Some(error) = fault {
                    if let Ok(world) = weak.upgrade() {
                        world.halt(format!("service '{id}' faulted"), Some(error));
                    }
                }
            })?;
        }
        Ok(matched.len())
    }

    /// Stops every matched service: all stop requests go out first, then
    /// each process is awaited for the same grace period. Ones that miss it
    /// are killed.
    pub(crate) async fn stop_services(
        &self,
        world: &SimWorld,
        selector: &dyn Fn(&ServiceId) -> bool,
        grace: Duration,
        waiter: SchedulerId,
    ) -> SimulationResult<usize> {
        let matched = self.filter(selector);
        if matched.is_empty() {
            return Err(SimulationError::NoMatchingServices);
        }
        let count = matched.len();
        let mut stopping = Vec::new();
        for service in matched {
            match service.begin_stop(world, grace, waiter) {
                StopPhase::Idle => {}
                StopPhase::Exited => self.release_service(service.id()),
                StopPhase::Stopping(future) => stopping.push(future),
            }
        }
        for future in stopping {
            future.await?;
        }
        Ok(count)
    }

    /// Releases a service's process through its machine.
    pub(crate) fn release_service(&self, id: &ServiceId) {
        if let Some(machine) = self.machines.get(id.machine()) {
            machine.release_service(id.service());
        }
    }

    /// End-of-run cleanup: every machine gives back what its processes
    /// held.
    pub(crate) fn release_all(&self) {
        for machine in self.machines.values() {
            machine.release_services();
        }
    }
}
