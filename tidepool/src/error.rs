//! Error types for simulation operations.

use thiserror::Error;

/// Errors that can occur during simulation operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    /// No route is configured between the two zones.
    #[error("no route between zones '{from}' and '{to}'")]
    RouteNotFound {
        /// Zone of the connecting machine.
        from: String,
        /// Zone of the destination machine.
        to: String,
    },
    /// The destination zone is reachable but nothing listens on the port.
    #[error("connection refused")]
    ConnectionRefused,
    /// The peer reset the connection; pending and future reads fail.
    #[error("connection reset")]
    ConnectionReset,
    /// The connection was closed locally and can no longer be used.
    #[error("connection closed")]
    ConnectionClosed,
    /// The connect exchange saw unexpected flags, or the listener's
    /// ack wait expired.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// A blocking primitive's deadline elapsed before its result arrived.
    #[error("timed out")]
    Timeout,
    /// The process cancellation token fired while waiting.
    #[error("cancelled")]
    Cancelled,
    /// A start or stop selector matched no installed services.
    #[error("no services match selector")]
    NoMatchingServices,
    /// A service was launched while a previous instance is still running.
    #[error("service '{0}' is already running")]
    AlreadyRunning(String),
    /// The requested port is already bound on this machine.
    #[error("address {0} in use")]
    AddressInUse(String),
    /// The machine's ephemeral port range is exhausted.
    #[error("no free ports on machine '{0}'")]
    NoFreePorts(String),
    /// The simulation has been shut down and is no longer accessible.
    #[error("simulation has been shut down")]
    SimulationShutdown,
    /// The simulation is in an invalid state.
    #[error("invalid simulation state: {0}")]
    InvalidState(String),
}

/// A type alias for `Result<T, SimulationError>`.
pub type SimulationResult<T> = Result<T, SimulationError>;
