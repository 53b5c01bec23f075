//! Active routes: each link direction is an actor that delays and delivers
//! packets.

use crate::cluster::RouteId;
use crate::sim::{SchedulerId, SimWorld};

use super::config::RouteConfig;
use super::packet::Packet;

/// One direction of a link. Every packet becomes its own delivery task, so
/// two packets drawing different latencies may arrive out of order; the
/// receiving connection reorders them.
pub(crate) struct SimRoute {
    id: RouteId,
    scheduler: SchedulerId,
    config: RouteConfig,
}

impl SimRoute {
    pub(crate) fn new(id: RouteId, scheduler: SchedulerId, config: RouteConfig) -> Self {
        Self {
            id,
            scheduler,
            config,
        }
    }

    /// Accepts a packet: drop it, or schedule delivery after the drawn
    /// latency. Loss is silent toward the sender.
    pub(crate) fn send(&self, world: &SimWorld, packet: Packet) {
        if let Some(loss) = &self.config.packet_loss {
            if world.with_rng(|rng| loss(rng)) {
                if self.config.log_faults {
                    tracing::warn!(route = %self.id, %packet, "packet lost");
                } else if (self.config.debug)(&packet) {
                    tracing::debug!(route = %self.id, %packet, "packet lost");
                }
                return;
            }
        }
        if (self.config.debug)(&packet) {
            tracing::debug!(route = %self.id, %packet, at = ?world.now(), "send");
        }
        let latency = world.with_rng(|rng| (self.config.latency)(rng));
        let weak = world.downgrade();
        let scheduler = self.scheduler;
        world.spawn(scheduler, async move {
            let delay = match weak.upgrade() {
                Ok(world) => world.delay_on(scheduler, Some(latency), None),
                Err(_) => return,
            };
            if delay.await.is_err() {
                return;
            }
            let Ok(world) = weak.upgrade() else {
                return;
            };
            let Ok(cluster) = world.cluster() else {
                return;
            };
            cluster.deliver(&world, packet);
        });
    }
}
