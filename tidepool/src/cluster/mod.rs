//! Cluster modeling: identities, static definitions, machines and the live
//! topology built for each run.

mod def;
mod id;
mod machine;
mod topology;

pub use def::ClusterDef;
pub use id::{zone_of, Endpoint, RouteId, ServiceId};

pub(crate) use def::ServiceFactory;
pub(crate) use machine::SimMachine;
pub(crate) use topology::SimCluster;
