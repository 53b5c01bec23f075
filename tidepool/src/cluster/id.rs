//! Naming: service identities, zones, routes and endpoints.

use std::fmt;
use std::str::FromStr;

use crate::error::SimulationError;

/// Returns the zone a machine belongs to: everything after the first dot,
/// or the whole name when there is no dot.
pub fn zone_of(machine: &str) -> &str {
    match machine.split_once('.') {
        Some((_, zone)) => zone,
        None => machine,
    }
}

/// Canonical identity of one service instance: `machine:service`.
///
/// A bare name with no colon denotes a service named after its machine,
/// so `"proxy"` is shorthand for `"proxy:proxy"`. Names are lowercased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId {
    full: String,
}

impl ServiceId {
    /// Parses an identity, applying the bare-name shorthand.
    pub fn new(name: &str) -> Self {
        let name = name.to_lowercase();
        let full = if name.contains(':') {
            name
        } else {
            format!("{name}:{name}")
        };
        Self { full }
    }

    /// The full `machine:service` form.
    pub fn full(&self) -> &str {
        &self.full
    }

    /// The machine part.
    pub fn machine(&self) -> &str {
        self.full.split(':').next().unwrap_or(&self.full)
    }

    /// The service part.
    pub fn service(&self) -> &str {
        self.full.split(':').nth(1).unwrap_or(&self.full)
    }

    /// The zone the machine belongs to.
    pub fn zone(&self) -> &str {
        zone_of(self.machine())
    }
}

impl From<&str> for ServiceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// A directed link between two zones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteId {
    source: String,
    destination: String,
}

impl RouteId {
    /// Builds a route id from two zone names.
    pub fn new(source: &str, destination: &str) -> Self {
        Self {
            source: source.to_lowercase(),
            destination: destination.to_lowercase(),
        }
    }

    /// Builds a route id from the zones of two machine names.
    pub fn between_machines(from: &str, to: &str) -> Self {
        Self::new(zone_of(from), zone_of(to))
    }

    /// Source zone.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Destination zone.
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.destination)
    }
}

/// A network endpoint: machine name plus port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    /// Machine name.
    pub machine: String,
    /// Port on that machine.
    pub port: u16,
}

impl Endpoint {
    /// Builds an endpoint from its parts.
    pub fn new(machine: impl Into<String>, port: u16) -> Self {
        Self {
            machine: machine.into().to_lowercase(),
            port,
        }
    }

    /// The zone the endpoint's machine belongs to.
    pub fn zone(&self) -> &str {
        zone_of(&self.machine)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (machine, port) = s
            .split_once(':')
            .ok_or_else(|| SimulationError::InvalidState(format!("invalid endpoint '{s}'")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| SimulationError::InvalidState(format!("invalid port in '{s}'")))?;
        Ok(Self::new(machine, port))
    }
}
