//! Static cluster topology: which services exist and which zones are linked.

use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;

use crate::error::SimulationResult;
use crate::network::RouteConfig;
use crate::process::{Environment, Service};

use super::id::{RouteId, ServiceId};

/// Builds a boxed service instance for one launch. Invoked on every launch,
/// so a restarted service always starts from fresh state.
pub(crate) type ServiceFactory = Rc<dyn Fn(Environment) -> Box<dyn Service>>;

/// Declarative description of a cluster: services keyed by identity plus the
/// directed zone-to-zone links packets may traverse.
///
/// A definition is inert. Hand it to [`SimWorld`](crate::SimWorld) to run
/// plans against it.
#[derive(Default)]
pub struct ClusterDef {
    pub(crate) services: Vec<(ServiceId, ServiceFactory)>,
    pub(crate) routes: BTreeMap<RouteId, RouteConfig>,
}

impl ClusterDef {
    /// An empty definition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service under a `machine:service` identity. Registering
    /// the same identity again replaces the earlier factory.
    pub fn add_service<S, F>(&mut self, name: &str, factory: F)
    where
        S: Service + 'static,
        F: Fn(Environment) -> S + 'static,
    {
        let id = ServiceId::new(name);
        let factory: ServiceFactory = Rc::new(move |env| Box::new(factory(env)));
        if let Some(slot) = self.services.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = factory;
        } else {
            self.services.push((id, factory));
        }
    }

    /// Registers a service from a plain async body, for services with no
    /// cleanup of their own.
    pub fn add<F, Fut>(&mut self, name: &str, body: F)
    where
        F: Fn(Environment) -> Fut + 'static,
        Fut: Future<Output = SimulationResult<()>> + 'static,
    {
        let body = Rc::new(body);
        self.add_service(name, move |env| {
            let body = Rc::clone(&body);
            FnService {
                body: Some(Box::pin(body(env))),
            }
        });
    }

    /// Links two zones in both directions with default route behavior.
    pub fn link(&mut self, a: &str, b: &str) {
        self.link_with(a, b, |_| {});
    }

    /// Links two zones in both directions, then lets the profile adjust the
    /// shared configuration.
    pub fn link_with(&mut self, a: &str, b: &str, profile: impl Fn(&mut RouteConfig)) {
        let mut config = RouteConfig::default();
        profile(&mut config);
        self.routes.insert(RouteId::new(a, b), config.clone());
        self.routes.insert(RouteId::new(b, a), config);
    }

    /// Links one direction only, for asymmetric topologies.
    pub fn link_directed(&mut self, from: &str, to: &str, profile: impl Fn(&mut RouteConfig)) {
        let mut config = RouteConfig::default();
        profile(&mut config);
        self.routes.insert(RouteId::new(from, to), config);
    }
}

/// Adapter turning a stored async body into a [`Service`].
struct FnService {
    body: Option<std::pin::Pin<Box<dyn Future<Output = SimulationResult<()>>>>>,
}

#[async_trait::async_trait(?Send)]
impl Service for FnService {
    async fn run(&mut self) -> SimulationResult<()> {
        match self.body.take() {
            Some(body) => body.await,
            None => Ok(()),
        }
    }
}
