//! Per-route behavior: latency, loss and logging knobs.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::packet::Packet;

type LatencyFn = Rc<dyn Fn(&mut ChaCha8Rng) -> Duration>;
type LossFn = Rc<dyn Fn(&mut ChaCha8Rng) -> bool>;
type DebugFn = Rc<dyn Fn(&Packet) -> bool>;

/// Behavior of one directed route. Latency and loss draw from the world's
/// deterministic RNG, so a given seed always produces the same link weather.
#[derive(Clone)]
pub struct RouteConfig {
    pub(crate) latency: LatencyFn,
    pub(crate) packet_loss: Option<LossFn>,
    pub(crate) debug: DebugFn,
    pub(crate) log_faults: bool,
}

impl Default for RouteConfig {
    /// A reliable link with a constant 50ms latency and no logging.
    fn default() -> Self {
        Self {
            latency: Rc::new(|_| Duration::from_millis(50)),
            packet_loss: None,
            debug: Rc::new(|_| false),
            log_faults: false,
        }
    }
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("packet_loss", &self.packet_loss.is_some())
            .field("log_faults", &self.log_faults)
            .finish()
    }
}

impl RouteConfig {
    /// Replaces the latency distribution.
    pub fn set_latency(&mut self, f: impl Fn(&mut ChaCha8Rng) -> Duration + 'static) -> &mut Self {
        self.latency = Rc::new(f);
        self
    }

    /// Fixed latency for every packet.
    pub fn set_fixed_latency(&mut self, latency: Duration) -> &mut Self {
        self.latency = Rc::new(move |_| latency);
        self
    }

    /// Replaces the loss predicate; each packet is dropped when it returns
    /// true. Loss is silent on the sending side.
    pub fn set_packet_loss(&mut self, f: impl Fn(&mut ChaCha8Rng) -> bool + 'static) -> &mut Self {
        self.packet_loss = Some(Rc::new(f));
        self
    }

    /// Independent per-packet loss with the given probability.
    pub fn set_loss_probability(&mut self, probability: f64) -> &mut Self {
        self.packet_loss = Some(Rc::new(move |rng| rng.gen_bool(probability)));
        self
    }

    /// Logs packets matching the filter as they enter the route.
    pub fn set_debug(&mut self, f: impl Fn(&Packet) -> bool + 'static) -> &mut Self {
        self.debug = Rc::new(f);
        self
    }

    /// Logs dropped packets at warn level.
    pub fn set_log_faults(&mut self, log: bool) -> &mut Self {
        self.log_faults = log;
        self
    }
}

/// Ready-made route profiles, applied through
/// [`ClusterDef::link_with`](crate::cluster::ClusterDef::link_with).
pub mod profiles {
    use super::*;

    /// Reliable link, constant 50ms latency.
    pub fn reliable_constant(config: &mut RouteConfig) {
        config.set_fixed_latency(Duration::from_millis(50));
    }

    /// Wide-area link: 20-100ms latency, no loss.
    pub fn internet(config: &mut RouteConfig) {
        config.set_latency(|rng| Duration::from_millis(rng.gen_range(20..=100)));
    }

    /// Datacenter link: 1-10ms latency, no loss.
    pub fn intranet(config: &mut RouteConfig) {
        config.set_latency(|rng| Duration::from_millis(rng.gen_range(1..=10)));
    }

    /// Flaky cellular link: 100-500ms latency, 1% loss, drops logged.
    pub fn mobile_3g(config: &mut RouteConfig) {
        config
            .set_latency(|rng| Duration::from_millis(rng.gen_range(100..=500)))
            .set_loss_probability(0.01)
            .set_log_faults(true);
    }

    /// Logs every packet on the route.
    pub fn log_all(config: &mut RouteConfig) {
        config.set_debug(|_| true);
    }

    /// Logs packets touching one machine, either as source or destination.
    pub fn log_machine(machine: &str) -> impl Fn(&mut RouteConfig) {
        let machine = machine.to_lowercase();
        move |config: &mut RouteConfig| {
            let machine = machine.clone();
            config.set_debug(move |packet| {
                packet.source.machine == machine || packet.destination.machine == machine
            });
        }
    }
}
