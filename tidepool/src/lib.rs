//! # Tidepool
//!
//! Deterministic discrete-event simulation for testing distributed systems.
//!
//! A [`ClusterDef`] declares services on named machines and the latency and
//! loss characteristics of the links between their zones. A [`SimWorld`]
//! instantiates that cluster and runs a plan against it under virtual time:
//! the event loop pops the earliest pending event, jumps the clock straight
//! to it, and dispatches exactly one cooperative actor step. No wall-clock
//! waiting ever happens, and two runs with the same definition, seed and
//! plan replay the same history event for event.
//!
//! ## Core pieces
//!
//! - [`SimWorld`]: virtual clock, deterministic RNG and the event loop
//! - [`ClusterDef`]: machines, services and zone-to-zone links
//! - [`SimControl`]: the plan's handle for fleet start/stop and faults
//! - [`Environment`]: what a running service sees: timers, sockets, storage
//! - [`SimConn`] / [`SimSocket`]: a small reliable transport over a lossy,
//!   reordering fabric, complete with open handshake, resets and FINs
//!
//! ## Quick start
//!
//! ```ignore
//! use std::time::Duration;
//! use tidepool::{ClusterDef, SimWorld};
//!
//! let mut def = ClusterDef::new();
//! def.link("client", "api");
//! def.add("api:server", |env| async move {
//!     let socket = env.bind(9000)?;
//!     let conn = socket.accept().await?;
//!     while let Some(message) = conn.read(None).await? {
//!         conn.write(message)?;
//!     }
//!     Ok(())
//! });
//!
//! let mut world = SimWorld::new(def);
//! world.set_seed(42);
//! let report = world.run(|control| async move {
//!     control.start_all()?;
//!     control.delay(Duration::from_secs(5)).await?;
//!     control.stop_all().await?;
//!     Ok(())
//! });
//! println!("{report}");
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Cluster modeling: identities, definitions, machines and topology.
pub mod cluster;
/// The control plane handed to simulation plans.
pub mod control;
/// Error types and utilities for simulation operations.
pub mod error;
/// Simulated networking: packets, routes, sockets and connections.
pub mod network;
/// Service processes and their environment.
pub mod process;
/// Core simulation machinery: events, time, scheduling and reports.
pub mod sim;
/// Named per-machine key-value storage.
pub mod storage;

pub use cluster::{zone_of, ClusterDef, Endpoint, RouteId, ServiceId};
pub use control::{SimControl, DEFAULT_GRACE};
pub use error::{SimulationError, SimulationResult};
pub use network::{profiles, Packet, PacketFlags, Payload, RouteConfig, SimConn, SimSocket};
pub use process::{Environment, Service};
pub use sim::{HaltReason, SimDelay, SimReport, SimWorld, SimulationMetrics, TraceEntry};
pub use storage::StorageHandle;
